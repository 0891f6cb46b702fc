//! The writable catalog seam driven by the changeset planner.
//!
//! The catalog stack (catalog files, spooler, upload fan-out) is an
//! external collaborator; the planner only needs the operations below.
//! [`crate::store::SqliteCatalogStore`] is a local implementation backed by
//! a single SQLite file.

use crate::model::{Directory, File, Symlink};
use async_trait::async_trait;

/// Kind of a catalog entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Directory {
        /// The directory roots a nested catalog.
        mountpoint: bool,
    },
    File,
    Symlink,
}

impl EntryKind {
    pub fn is_directory(self) -> bool {
        matches!(self, EntryKind::Directory { .. })
    }
}

/// Metadata of an existing catalog entry.
#[derive(Clone, Debug)]
pub struct CatalogEntry {
    pub kind: EntryKind,
    pub mode: u32,
    /// Modification time in seconds.
    pub mtime: i64,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
}

/// One child in a directory listing.
#[derive(Clone, Debug)]
pub struct ChildEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// Operations the planner performs against the writable catalog.
///
/// Paths are relative (no leading slash); the catalog root is `""`.
#[async_trait]
pub trait CatalogManager: Send + Sync {
    /// Warm up catalogs covering the given directories before the write
    /// burst starts.
    async fn precache(&self, lease_path: &str, dirs: &[String]) -> crate::Result<()>;

    /// Look up a single entry.
    async fn lookup(&self, path: &str) -> crate::Result<Option<CatalogEntry>>;

    /// List the children of a directory.
    async fn listing(&self, path: &str) -> crate::Result<Vec<ChildEntry>>;

    /// Add a directory; the parent must exist.
    async fn add_directory(&self, dir: &Directory) -> crate::Result<()>;

    /// Refresh metadata and extended attributes of an existing directory.
    async fn touch_directory(&self, dir: &Directory) -> crate::Result<()>;

    /// Add a chunked file; any previous entry of the same name is gone.
    async fn add_file(&self, file: &File) -> crate::Result<()>;

    /// Add a symlink; any previous entry of the same name is gone.
    async fn add_symlink(&self, symlink: &Symlink) -> crate::Result<()>;

    /// Remove a file or symlink entry.
    async fn remove_file(&self, path: &str) -> crate::Result<()>;

    /// Remove an (empty) directory entry.
    async fn remove_directory(&self, path: &str) -> crate::Result<()>;

    /// Turn a directory into a nested catalog mountpoint.
    async fn create_nested_catalog(&self, path: &str) -> crate::Result<()>;

    /// Detach a nested catalog together with its content.
    async fn remove_nested_catalog(&self, path: &str) -> crate::Result<()>;

    /// Whether the path is a nested catalog transition point.
    async fn is_transition_point(&self, path: &str) -> crate::Result<bool>;

    /// Schedule the nested catalog rooted at `path` for upload.
    async fn snapshot_catalog(&self, path: &str) -> crate::Result<()>;

    /// Finalize all touched catalogs and return the new root hash (hex).
    async fn commit(&self) -> crate::Result<String>;

    /// Block until scheduled uploads have drained.
    async fn wait_for_uploads(&self) -> crate::Result<()>;
}
