//! Error types for the Ratekeeper service.

use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Ratekeeper operations.
#[derive(Error, Debug)]
pub enum RatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The caller supplied an identifier that cannot name a counter.
    ///
    /// This is a usage error, not a rate limit rejection.
    #[error("Invalid identifier: identifier must not be empty")]
    InvalidIdentifier,

    /// Counter store errors surfaced by administrative operations
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The store did not answer within the allotted budget
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for RatekeeperError {
    fn from(err: config::ConfigError) -> Self {
        RatekeeperError::Config(err.to_string())
    }
}

/// Result type alias for Ratekeeper operations.
pub type Result<T> = std::result::Result<T, RatekeeperError>;
