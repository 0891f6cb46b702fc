//! In-memory changeset model decoded from graft databases.

use std::collections::BTreeMap;
use strata_core::ChunkDigest;

/// Extended attributes attached to a directory entry.
pub type XattrList = BTreeMap<String, Vec<u8>>;

/// Compression selection for grafted file data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    /// Compressed when internal, uncompressed when external.
    Default,
    None,
    Zlib,
}

impl Compression {
    /// Decode the `compressed` column of the `files` table.
    pub fn from_column(value: i64) -> crate::Result<Self> {
        match value {
            0 => Ok(Self::Default),
            1 => Ok(Self::None),
            2 => Ok(Self::Zlib),
            other => Err(crate::GraftError::InputInvalid(format!(
                "unknown compression value {other}"
            ))),
        }
    }

    /// Resolve `Default` for a concrete file.
    pub fn resolve(self, internal: bool) -> ResolvedCompression {
        match self {
            Self::Default => {
                if internal {
                    ResolvedCompression::Zlib
                } else {
                    ResolvedCompression::None
                }
            }
            Self::None => ResolvedCompression::None,
            Self::Zlib => ResolvedCompression::Zlib,
        }
    }
}

/// Compression actually applied to stored data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolvedCompression {
    None,
    Zlib,
}

impl ResolvedCompression {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Zlib => "zlib",
        }
    }
}

/// A directory to create or refresh.
#[derive(Clone, Debug)]
pub struct Directory {
    /// Full relative path.
    pub name: String,
    /// Modification time in nanoseconds.
    pub mtime_ns: i64,
    pub mode: u32,
    pub owner: u32,
    pub group: u32,
    /// Whether this directory roots its own nested catalog.
    pub nested: bool,
    pub xattrs: XattrList,
}

/// One chunk of a grafted file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileChunk {
    pub digest: ChunkDigest,
    pub offset: u64,
    pub size: u64,
}

/// A chunked file whose data already exists in the backing store.
#[derive(Clone, Debug)]
pub struct File {
    pub name: String,
    pub mtime_ns: i64,
    pub size: u64,
    pub owner: u32,
    pub group: u32,
    pub mode: u32,
    /// Internal data is content-addressed in the repository; external data
    /// is referenced at its original location.
    pub internal: bool,
    pub compression: Compression,
    pub chunks: Vec<FileChunk>,
}

/// A symlink to create.
#[derive(Clone, Debug)]
pub struct Symlink {
    pub name: String,
    pub target: String,
    pub mtime_ns: i64,
    pub owner: u32,
    pub group: u32,
    /// Leave an existing file or directory of the same name in place.
    pub skip_if_file_or_dir: bool,
}

/// A typed deletion intent.
#[derive(Clone, Debug)]
pub struct Deletion {
    pub name: String,
    pub directory: bool,
    pub file: bool,
    pub link: bool,
}

/// The union of all additions from a set of graft databases, keyed for the
/// planner's tree traversal.
#[derive(Debug, Default)]
pub struct Changeset {
    /// Directories by full path.
    pub dirs: BTreeMap<String, Directory>,
    /// Files grouped by parent directory.
    pub files: BTreeMap<String, Vec<File>>,
    /// Symlinks grouped by parent directory.
    pub symlinks: BTreeMap<String, Vec<Symlink>>,
}

impl Changeset {
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty() && self.files.is_empty() && self.symlinks.is_empty()
    }

    /// Number of files across all parents.
    pub fn file_count(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }

    /// Number of symlinks across all parents.
    pub fn symlink_count(&self) -> usize {
        self.symlinks.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_resolution() {
        assert_eq!(
            Compression::Default.resolve(true),
            ResolvedCompression::Zlib
        );
        assert_eq!(
            Compression::Default.resolve(false),
            ResolvedCompression::None
        );
        assert_eq!(Compression::Zlib.resolve(false), ResolvedCompression::Zlib);
        assert_eq!(Compression::None.resolve(true), ResolvedCompression::None);
    }

    #[test]
    fn test_compression_column_decoding() {
        assert_eq!(Compression::from_column(0).unwrap(), Compression::Default);
        assert_eq!(Compression::from_column(1).unwrap(), Compression::None);
        assert_eq!(Compression::from_column(2).unwrap(), Compression::Zlib);
        assert!(Compression::from_column(3).is_err());
    }
}
