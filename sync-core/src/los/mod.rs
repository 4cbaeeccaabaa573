//! External Loan System of Record (LOS) seam

pub mod mock;

use crate::error::Error;
use crate::mapping::{LoanPatch, NewExternalLoan};
use crate::types::{Credentials, ExternalLoan};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use mock::MockLosClient;

/// LOS call failure, classified at the source
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LosError {
    /// Network trouble, timeout, 5xx
    #[error("LOS unavailable: {0}")]
    Unavailable(String),

    /// The LOS answered and said no (4xx). Message is the LOS's own.
    #[error("{0}")]
    Rejected(String),

    /// Credentials missing or refused
    #[error("LOS authentication failed: {0}")]
    Unauthorized(String),
}

impl From<LosError> for Error {
    fn from(err: LosError) -> Self {
        match err {
            LosError::Unavailable(msg) => Error::ExternalUnavailable(msg),
            LosError::Rejected(msg) => Error::ExternalRejected(msg),
            e @ LosError::Unauthorized(_) => Error::Configuration(e.to_string()),
        }
    }
}

/// Answer of the LOS validation endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

#[async_trait]
pub trait LosClient: Send + Sync {
    /// Log in with `creds`; on success the client keeps using them
    async fn authenticate(&self, creds: &Credentials) -> Result<(), LosError>;

    /// Adopt stored credentials without a round trip
    fn set_credentials(&self, creds: Credentials);

    /// Fetch a loan; `None` if the LOS has no such loan
    async fn get_loan(&self, external_id: &str) -> Result<Option<ExternalLoan>, LosError>;

    /// Create a loan; a repeated `idempotency_key` returns the loan first
    /// created under it instead of a new one
    async fn create_loan(
        &self,
        loan: &NewExternalLoan,
        idempotency_key: &str,
    ) -> Result<ExternalLoan, LosError>;

    /// Apply a patch atomically; either every field is written or none
    async fn update_loan(&self, external_id: &str, patch: &LoanPatch) -> Result<ExternalLoan, LosError>;

    /// Check a change set without committing it
    async fn validate_loan(
        &self,
        external_id: Option<&str>,
        patch: &LoanPatch,
    ) -> Result<ValidationReport, LosError>;

    /// Short name for logs and breaker ids
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            Error::from(LosError::Unavailable("timeout".to_string())),
            Error::ExternalUnavailable(_)
        ));

        let err = Error::from(LosError::Rejected("Balance exceeds program cap".to_string()));
        assert_eq!(err.to_string(), "Balance exceeds program cap");

        assert!(matches!(
            Error::from(LosError::Unauthorized("bad password".to_string())),
            Error::Configuration(_)
        ));
    }

    #[test]
    fn test_validation_report() {
        assert!(ValidationReport::default().is_valid());
        let report: ValidationReport =
            serde_json::from_str(r#"{"errors": ["closeDate in the past"]}"#).unwrap();
        assert!(!report.is_valid());
        assert!(report.warnings.is_empty());
    }
}
