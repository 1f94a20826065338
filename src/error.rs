//! Error types for Tollgate.

use thiserror::Error;

/// Main error type for Tollgate operations.
///
/// Exceeding a quota is not an error: it is the deny branch of an
/// [`AdmissionDecision`](crate::ratelimit::AdmissionDecision).
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Malformed subject, unknown tier name or unusable tier values.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The shared counter store could not be reached or answered badly.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TollgateError {
    /// Whether this error should be routed to the degradation policy.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, TollgateError::StoreUnavailable(_))
    }
}

impl From<redis::RedisError> for TollgateError {
    fn from(err: redis::RedisError) -> Self {
        TollgateError::StoreUnavailable(err.to_string())
    }
}

impl From<config::ConfigError> for TollgateError {
    fn from(err: config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
