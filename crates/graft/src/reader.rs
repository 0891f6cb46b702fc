//! Read-only access to graft databases.
//!
//! Decodes the `dirs`, `files`, `links`, and `deletions` tables into the
//! in-memory changeset model. Older schema revisions lack some columns:
//! revision ≤ 3 has no `nested` column (default 1), revision ≤ 2 has no
//! `compressed` column (default 0).

use crate::error::{GraftError, Result};
use crate::model::{
    Changeset, Compression, Deletion, Directory, File, FileChunk, Symlink, XattrList,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::{Path, PathBuf};
use strata_core::{ChunkDigest, EXTERNAL_CHUNK_SIZE, INTERNAL_CHUNK_SIZE, acl, path};

/// One graft database, open read-only.
pub struct GraftDb {
    pool: Pool<Sqlite>,
    schema_revision: i64,
    db_path: PathBuf,
}

impl GraftDb {
    /// Open a graft database and read its schema revision.
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let opts = SqliteConnectOptions::new()
            .filename(&db_path)
            .read_only(true)
            .pragma("temp_store", "2");
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let revision: Option<String> =
            sqlx::query_scalar("SELECT value FROM properties WHERE key = 'schema_revision'")
                .fetch_optional(&pool)
                .await?;
        let schema_revision = revision
            .and_then(|r| r.parse::<i64>().ok())
            .ok_or_else(|| {
                GraftError::InputInvalid(format!(
                    "{}: properties table lacks a schema_revision",
                    db_path.display()
                ))
            })?;

        Ok(Self {
            pool,
            schema_revision,
            db_path,
        })
    }

    pub fn schema_revision(&self) -> i64 {
        self.schema_revision
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Load the `dirs` table into the changeset.
    pub async fn load_dirs(
        &self,
        lease_path: &str,
        prefix: &str,
        changeset: &mut Changeset,
    ) -> Result<()> {
        let query = if self.schema_revision <= 3 {
            "SELECT name, mode, mtime, owner, grp, acl, 1 FROM dirs"
        } else {
            "SELECT name, mode, mtime, owner, grp, acl, nested FROM dirs"
        };
        let rows: Vec<(String, i64, i64, i64, i64, String, i64)> =
            sqlx::query_as(query).fetch_all(&self.pool).await?;

        for (name, mode, mtime, owner, grp, acl_text, nested) in rows {
            let name = self.checked_name(&name, lease_path, prefix)?;
            let dir = Directory {
                name: name.clone(),
                mtime_ns: mtime,
                mode: mode as u32,
                owner: owner as u32,
                group: grp as u32,
                nested: nested != 0,
                xattrs: marshal_xattrs(&acl_text)?,
            };
            changeset.dirs.insert(name, dir);
        }
        Ok(())
    }

    /// Load the `files` table into the changeset, decoding chunk lists.
    pub async fn load_files(
        &self,
        lease_path: &str,
        prefix: &str,
        changeset: &mut Changeset,
    ) -> Result<()> {
        let query = if self.schema_revision <= 2 {
            "SELECT name, mode, mtime, owner, grp, size, hashes, internal, 0 FROM files"
        } else {
            "SELECT name, mode, mtime, owner, grp, size, hashes, internal, compressed FROM files"
        };
        let rows: Vec<(String, i64, i64, i64, i64, i64, String, i64, i64)> =
            sqlx::query_as(query).fetch_all(&self.pool).await?;

        for (name, mode, mtime, owner, grp, size, hashes, internal, compressed) in rows {
            let name = self.checked_name(&name, lease_path, prefix)?;
            if size < 0 {
                return Err(GraftError::InputInvalid(format!(
                    "file size cannot be negative [{name}]"
                )));
            }
            let internal = internal != 0;
            let compression = Compression::from_column(compressed)?;
            if !internal && compression == Compression::Zlib {
                return Err(GraftError::InputInvalid(format!(
                    "compression is only allowed for internal data [{name}]"
                )));
            }

            let chunks = decode_chunks(&name, size as u64, &hashes, internal)?;
            let file = File {
                name: name.clone(),
                mtime_ns: mtime,
                size: size as u64,
                owner: owner as u32,
                group: grp as u32,
                mode: mode as u32,
                internal,
                compression,
                chunks,
            };
            changeset
                .files
                .entry(path::parent(&name).to_string())
                .or_default()
                .push(file);
        }
        Ok(())
    }

    /// Load the `links` table into the changeset.
    pub async fn load_symlinks(
        &self,
        lease_path: &str,
        prefix: &str,
        changeset: &mut Changeset,
    ) -> Result<()> {
        let rows: Vec<(String, String, i64, i64, i64, i64)> = sqlx::query_as(
            "SELECT name, target, mtime, owner, grp, skip_if_file_or_dir FROM links",
        )
        .fetch_all(&self.pool)
        .await?;

        for (name, target, mtime, owner, grp, skip) in rows {
            let name = self.checked_name(&name, lease_path, prefix)?;
            let symlink = Symlink {
                name: name.clone(),
                target,
                mtime_ns: mtime,
                owner: owner as u32,
                group: grp as u32,
                skip_if_file_or_dir: skip != 0,
            };
            changeset
                .symlinks
                .entry(path::parent(&name).to_string())
                .or_default()
                .push(symlink);
        }
        Ok(())
    }

    /// Load deletion intents, children before parents.
    pub async fn load_deletions(&self, lease_path: &str, prefix: &str) -> Result<Vec<Deletion>> {
        let rows: Vec<(String, i64, i64, i64)> = sqlx::query_as(
            "SELECT name, directory, file, link FROM deletions ORDER BY length(name) DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(name, directory, file, link)| {
                Ok(Deletion {
                    name: self.checked_name(&name, lease_path, prefix)?,
                    directory: directory != 0,
                    file: file != 0,
                    link: link != 0,
                })
            })
            .collect()
    }

    /// All directories the database touches, for lease auto-detection.
    /// Additions contribute directory paths and file/symlink parents,
    /// deletions contribute parents.
    pub async fn affected_dirs(
        &self,
        include_additions: bool,
        include_deletions: bool,
    ) -> Result<Vec<String>> {
        let mut tables: Vec<(&str, bool)> = Vec::new();
        if include_additions {
            tables.extend([("dirs", false), ("links", true), ("files", true)]);
        }
        if include_deletions {
            tables.push(("deletions", true));
        }

        let mut paths = Vec::new();
        for (table, use_parent) in tables {
            let names: Vec<String> = sqlx::query_scalar(&format!("SELECT name FROM {table}"))
                .fetch_all(&self.pool)
                .await?;
            for name in names {
                let sanitised = path::sanitise_name(&name)?;
                if use_parent {
                    paths.push(path::parent(&sanitised).to_string());
                } else {
                    paths.push(sanitised);
                }
            }
        }
        Ok(paths)
    }

    fn checked_name(&self, raw: &str, lease_path: &str, prefix: &str) -> Result<String> {
        let name = format!("{prefix}{}", path::sanitise_name(raw)?);
        if !path::is_below(&name, lease_path) {
            return Err(GraftError::InputInvalid(format!(
                "{name} is not below lease path {lease_path}"
            )));
        }
        Ok(name)
    }
}

fn marshal_xattrs(acl_text: &str) -> Result<XattrList> {
    let mut xattrs = XattrList::new();
    if acl_text.is_empty() {
        return Ok(xattrs);
    }
    let encoded = acl::acl_from_text(acl_text)?;
    if !encoded.equivalent_to_mode {
        xattrs.insert("system.posix_acl_access".to_string(), encoded.bytes);
    }
    Ok(xattrs)
}

/// Decode a comma-separated digest list into chunks with derived offsets
/// and sizes. The chunk size is fixed by whether the data is internal.
fn decode_chunks(name: &str, size: u64, hashes: &str, internal: bool) -> Result<Vec<FileChunk>> {
    let chunk_size = if internal {
        INTERNAL_CHUNK_SIZE
    } else {
        EXTERNAL_CHUNK_SIZE
    };

    let mut chunks = Vec::new();
    for (i, token) in hashes.split(',').filter(|t| !t.is_empty()).enumerate() {
        let digest = ChunkDigest::from_hex(token).map_err(|_| {
            GraftError::InputInvalid(format!("provided hash for [{name}] is invalid: {token}"))
        })?;
        chunks.push(FileChunk {
            digest,
            offset: i as u64 * chunk_size,
            size: chunk_size,
        });
    }

    let expected = size.div_ceil(chunk_size).max(1);
    if chunks.len() as u64 != expected {
        return Err(GraftError::InputInvalid(format!(
            "chunk count {} for [{name}] does not match expected {expected}",
            chunks.len()
        )));
    }
    if let Some(last) = chunks.last_mut() {
        last.size = size - last.offset;
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(n: u64) -> String {
        format!("{n:040x}")
    }

    #[test]
    fn test_decode_single_chunk() {
        let chunks = decode_chunks("f", 100, &hex(1), true).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].offset, 0);
        assert_eq!(chunks[0].size, 100);
    }

    #[test]
    fn test_decode_empty_file_still_needs_one_chunk() {
        assert!(decode_chunks("f", 0, "", true).is_err());
        let chunks = decode_chunks("f", 0, &hex(1), true).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].size, 0);
    }

    #[test]
    fn test_decode_internal_chunking() {
        // 6 MiB chunks: 13 MiB needs three
        let size = 13 * 1024 * 1024;
        let csv = format!("{},{},{}", hex(1), hex(2), hex(3));
        let chunks = decode_chunks("f", size, &csv, true).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].offset, INTERNAL_CHUNK_SIZE);
        assert_eq!(chunks[2].size, size - 2 * INTERNAL_CHUNK_SIZE);
    }

    #[test]
    fn test_decode_external_chunking() {
        // 24 MiB chunks: 25 MiB needs two
        let size = 25 * 1024 * 1024;
        let csv = format!("{},{}", hex(1), hex(2));
        let chunks = decode_chunks("f", size, &csv, false).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].offset, EXTERNAL_CHUNK_SIZE);
        assert_eq!(chunks[1].size, 1024 * 1024);
    }

    #[test]
    fn test_decode_rejects_wrong_count_and_bad_hex() {
        let size = 13 * 1024 * 1024;
        assert!(decode_chunks("f", size, &hex(1), true).is_err());
        assert!(decode_chunks("f", 10, "nothex", true).is_err());
    }
}
