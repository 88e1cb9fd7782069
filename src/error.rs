//! Error types for the Turnstile rate limiter.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The counter store could not be reached or returned a failure
    #[error("Counter storage unavailable: {0}")]
    StorageUnavailable(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for TurnstileError {
    fn from(err: redis::RedisError) -> Self {
        TurnstileError::StorageUnavailable(err.to_string())
    }
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

impl TurnstileError {
    /// Whether this error came from the counter store.
    pub fn is_storage(&self) -> bool {
        matches!(self, TurnstileError::StorageUnavailable(_))
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
