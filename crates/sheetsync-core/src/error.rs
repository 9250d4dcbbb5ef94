//! Error types for sheetsync-core

use thiserror::Error;

use crate::config::ConfigError;
use crate::sheet::SheetError;

/// Result type alias using sheetsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in sheetsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Structural change rejected by the store
    #[error("Schema error: {0}")]
    Schema(String),

    /// Coordination store failure (locks, counters)
    #[error("Coordination error: {0}")]
    Coordination(String),

    /// External document write failure
    #[error(transparent)]
    Sheet(#[from] SheetError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Dispatch queue no longer accepts work
    #[error("Queue '{0}' is closed")]
    QueueClosed(String),
}

impl Error {
    /// Whether a dispatch attempt that failed with this error may succeed later.
    ///
    /// Store and coordination faults are transient by nature; rejected input,
    /// missing records and non-retryable sheet rejections are not.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Database(_) | Self::Io(_) | Self::Schema(_) | Self::Coordination(_) => true,
            Self::Sheet(error) => error.is_retryable(),
            Self::Serialization(_)
            | Self::NotFound(_)
            | Self::InvalidInput(_)
            | Self::Config(_)
            | Self::QueueClosed(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_faults_are_retryable() {
        let error = Error::Database(rusqlite::Error::InvalidQuery);
        assert!(error.is_retryable());
        assert!(Error::Schema("duplicate".into()).is_retryable());
    }

    #[test]
    fn input_faults_are_not_retryable() {
        assert!(!Error::InvalidInput("row must be >= 1".into()).is_retryable());
        assert!(!Error::NotFound("conflict 7".into()).is_retryable());
    }

    #[test]
    fn sheet_rate_limit_is_retryable() {
        let error = Error::Sheet(SheetError::RateLimited { retry_after: None });
        assert!(error.is_retryable());
        let error = Error::Sheet(SheetError::Rejected("bad range".into()));
        assert!(!error.is_retryable());
    }
}
