//! HTTP client for the repository gateway: lease acquisition, refresh,
//! commit, and cancellation, plus the lease session with its background
//! refresh actor and signal-driven cleanup.

pub mod client;
pub mod error;
pub mod fetch;
pub mod protocol;
pub mod session;

pub use client::{GatewayClient, LeaseGrant, RefreshOutcome, RetryPolicy};
pub use error::{GatewayError, Result};
pub use fetch::fetch_manifest;
pub use session::{LeaseSession, install_signal_handlers};

/// A lease is refreshed when it is older than this many seconds.
pub const LEASE_REFRESH_INTERVAL_SECS: u64 = 90;

/// Poll cadence of the refresh actor.
pub const REFRESH_POLL_INTERVAL_SECS: u64 = 2;

/// Default wait between lease-busy retries.
pub const DEFAULT_LEASE_BUSY_RETRY_SECS: u64 = 10;

/// Environment variable carrying optional metadata for lease acquisition.
pub const GATEWAY_METADATA_ENV: &str = "STRATA_GATEWAY_METADATA";
