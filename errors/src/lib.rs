//! Shared application error type.
//!
//! Module-level error enums convert into `AppError` at API boundaries so that
//! callers outside a module never need to depend on its internal error types.

use thiserror::Error;

/// Top-level application error.
#[derive(Debug, Error)]
pub enum AppError {
    /// Persistent storage failure (datastore, value store, ...).
    #[error("Storage error: {0}")]
    Storage(Box<dyn std::error::Error + Send + Sync>),

    /// Networking / transport failure.
    #[error("Network error: {0}")]
    Network(String),

    /// A referenced resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation conflicts with current state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Cryptographic operation failed.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Caller supplied an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Anything that does not fit the categories above.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for storage errors from plain strings.
    pub fn storage(msg: impl Into<String>) -> Self {
        AppError::Storage(msg.into().into())
    }
}
