//! Managed local cache bookkeeping for the strata client.
//!
//! The central piece is the [`LruLedger`]: a SQLite-backed access-sequence
//! ledger that tracks the size and pin state of every content-addressed file
//! in the local cache and evicts least-recently-used entries when the cache
//! would grow past its configured limit. All mutations funnel through a
//! single command-server task that owns the database connection.
//!
//! The crate also hosts the catalog download worker pool used to prefetch
//! catalog files into the cache.

pub mod error;
pub mod ledger;
pub mod pool;
mod rebuild;

pub use error::{CacheError, Result};
pub use ledger::{LruLedger, MAX_CACHE_PATH};
pub use pool::{CatalogDownloadPool, CatalogDownloadResult, CatalogFetcher};

/// File name of the ledger database inside the cache directory.
pub const LEDGER_DB_NAME: &str = "cvmfscatalog.cache";

/// Prefix of the checksum sidecar files that identify catalog blobs during
/// a rebuild.
pub const CHECKSUM_SIDECAR_PREFIX: &str = "cvmfs.checksum";
