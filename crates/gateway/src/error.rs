//! Gateway client error types.

use thiserror::Error;

/// Errors from gateway interactions.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The lease path is held by someone else; retryable.
    #[error("lease busy")]
    LeaseBusy,

    /// The gateway rejected the request for a non-busy reason; fatal.
    #[error("lease denied: {0}")]
    LeaseDenied(String),

    /// HTTP-level failure; retryable.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The gateway replied with something we cannot interpret.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Core(#[from] strata_core::Error),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
