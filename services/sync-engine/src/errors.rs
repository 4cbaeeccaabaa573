use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Sync(#[from] sync_core::Error),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();

        HttpResponse::build(status_code).json(json!({
            "detail": self.to_string(),
            "error": {
                "code": status_code.as_u16(),
                "type": self.error_type()
            }
        }))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Sync(err) => match err {
                sync_core::Error::Validation(_) => StatusCode::BAD_REQUEST,
                sync_core::Error::NotFound(_) => StatusCode::NOT_FOUND,
                sync_core::Error::Configuration(_) => StatusCode::PRECONDITION_FAILED,
                sync_core::Error::ExternalRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
                sync_core::Error::ExternalUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl ApiError {
    fn error_type(&self) -> &str {
        match self {
            ApiError::Sync(err) => err.kind(),
            ApiError::BadRequest(_) => "validation_error",
            ApiError::NotFound(_) => "not_found",
            ApiError::Internal(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (sync_core::Error::Validation("x".into()), 400),
            (sync_core::Error::NotFound("x".into()), 404),
            (sync_core::Error::Configuration("x".into()), 412),
            (sync_core::Error::ExternalRejected("x".into()), 422),
            (sync_core::Error::ExternalUnavailable("x".into()), 503),
            (sync_core::Error::Storage("x".into()), 500),
        ];

        for (err, code) in cases {
            assert_eq!(ApiError::from(err).status_code().as_u16(), code);
        }
    }

    #[test]
    fn test_rejection_message_passes_through() {
        let err = ApiError::from(sync_core::Error::ExternalRejected(
            "Balance exceeds program cap".to_string(),
        ));
        assert_eq!(err.to_string(), "Balance exceeds program cap");
        assert_eq!(err.error_type(), "external_rejected");
    }
}
