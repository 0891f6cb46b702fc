//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("invalid ACL: {0}")]
    AclInvalid(String),

    #[error("manifest parse error: {0}")]
    ManifestParse(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
