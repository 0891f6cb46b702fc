//! Core domain types and shared logic for the strata publisher toolchain.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Chunk digests and hex validation
//! - POSIX ACL text parsing and binary xattr encoding
//! - Repository manifest (`.cvmfspublished`) parsing and export
//! - Path sanitisation and lease-path computation
//! - Gateway client configuration

pub mod acl;
pub mod config;
pub mod error;
pub mod hash;
pub mod manifest;
pub mod path;

pub use acl::{AclEntry, AclTag, NameResolver, SystemResolver, acl_from_text};
pub use error::{Error, Result};
pub use hash::{ChunkDigest, EMPTY_FILE_DIGEST};
pub use manifest::Manifest;

/// Chunk size for internal (content-addressed, repository-hosted) data: 6 MiB.
pub const INTERNAL_CHUNK_SIZE: u64 = 6 * 1024 * 1024;

/// Chunk size for external (reference-only) data: 24 MiB.
pub const EXTERNAL_CHUNK_SIZE: u64 = 24 * 1024 * 1024;

/// Name of the root manifest file published by stratum 0.
pub const MANIFEST_NAME: &str = ".cvmfspublished";

/// Marker file placed in a directory to keep its nested catalog alive.
pub const NESTED_CATALOG_MARKER: &str = ".cvmfscatalog";
