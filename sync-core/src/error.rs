//! Error types for the sync subsystem

use thiserror::Error;

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Sync errors
#[derive(Error, Debug)]
pub enum Error {
    /// Bad operator input (enqueue, configure). Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The LOS could not be reached or timed out. Retried per backoff policy.
    #[error("External system unavailable: {0}")]
    ExternalUnavailable(String),

    /// The LOS explicitly rejected the operation. Carries its message verbatim.
    #[error("{0}")]
    ExternalRejected(String),

    /// Unknown id, or replay of an entry that is not dead-lettered
    #[error("Not found: {0}")]
    NotFound(String),

    /// Credentials missing or invalid; blocks sync until reconfigured
    #[error("{0}")]
    Configuration(String),

    /// Illegal queue state transition
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Storage error (SQLite)
    #[error("Storage error: {0}")]
    Storage(String),

    /// SQLite reported the database busy or locked; the operation can be retried
    #[error("Storage busy: {0}")]
    StorageBusy(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Settings file could not be loaded
    #[error("Settings error: {0}")]
    Settings(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_error",
            Error::ExternalUnavailable(_) => "external_unavailable",
            Error::ExternalRejected(_) => "external_rejected",
            Error::NotFound(_) => "not_found",
            Error::Configuration(_) => "configuration_error",
            Error::InvalidState(_) => "invalid_state",
            Error::Storage(_) => "storage_error",
            Error::StorageBusy(_) => "storage_busy",
            Error::Serialization(_) => "serialization_error",
            Error::Concurrency(_) => "concurrency_error",
            Error::Settings(_) => "settings_error",
            Error::Io(_) => "io_error",
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if matches!(
                    code.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                Error::StorageBusy(err.to_string())
            }
            _ => Error::Storage(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_message_is_verbatim() {
        let err = Error::ExternalRejected("Loan amount exceeds program limit".to_string());
        assert_eq!(err.to_string(), "Loan amount exceeds program limit");
        assert_eq!(err.kind(), "external_rejected");
    }

    #[test]
    fn test_sqlite_error_maps_to_storage() {
        let err: Error = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[test]
    fn test_sqlite_busy_maps_to_storage_busy() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        );
        let err: Error = busy.into();
        assert!(matches!(err, Error::StorageBusy(_)));
        assert_eq!(err.kind(), "storage_busy");

        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some("locked out of constraint".to_string()),
        );
        assert!(matches!(Error::from(constraint), Error::Storage(_)));
    }
}
