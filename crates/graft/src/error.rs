//! Graft engine error types.

use thiserror::Error;

/// Errors raised while reading graft databases or applying changesets.
#[derive(Debug, Error)]
pub enum GraftError {
    #[error("invalid graft input: {0}")]
    InputInvalid(String),

    #[error("catalog conflict: {0}")]
    CatalogConflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal invariant violated: {0}")]
    Internal(String),

    #[error(transparent)]
    Core(#[from] strata_core::Error),
}

/// Result type for graft operations.
pub type Result<T> = std::result::Result<T, GraftError>;
