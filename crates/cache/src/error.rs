//! Cache ledger error types.

use thiserror::Error;

/// Cache bookkeeping errors.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid input: {0}")]
    Input(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger command server is not running")]
    Shutdown,

    #[error(transparent)]
    Core(#[from] strata_core::Error),
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
