//! Local SQLite-backed implementation of the catalog seam.
//!
//! Holds the entry tree of one catalog namespace in a single database file.
//! The commit hash is a SHA-256 over the canonicalised listing, so two
//! stores holding the same tree report the same root hash regardless of the
//! order in which entries were applied.

use crate::catalog::{CatalogEntry, CatalogManager, ChildEntry, EntryKind};
use crate::error::{GraftError, Result};
use crate::model::{Directory, File, Symlink};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use strata_core::path;

const KIND_DIRECTORY: i64 = 0;
const KIND_FILE: i64 = 1;
const KIND_SYMLINK: i64 = 2;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS entries ( \
        path TEXT PRIMARY KEY, \
        parent TEXT NOT NULL, \
        kind INTEGER NOT NULL, \
        mode INTEGER NOT NULL, \
        mtime INTEGER NOT NULL, \
        uid INTEGER NOT NULL, \
        gid INTEGER NOT NULL, \
        size INTEGER NOT NULL DEFAULT 0, \
        target TEXT NOT NULL DEFAULT '', \
        compression TEXT NOT NULL DEFAULT '', \
        external INTEGER NOT NULL DEFAULT 0, \
        mountpoint INTEGER NOT NULL DEFAULT 0, \
        xattrs TEXT NOT NULL DEFAULT '', \
        chunks TEXT NOT NULL DEFAULT '')",
    "CREATE INDEX IF NOT EXISTS idx_entries_parent ON entries (parent)",
    "CREATE TABLE IF NOT EXISTS nested_catalogs (path TEXT PRIMARY KEY)",
    // implicit root directory
    "INSERT OR IGNORE INTO entries (path, parent, kind, mode, mtime, uid, gid) \
     VALUES ('', '', 0, 493, 0, 0, 0)",
];

/// Catalog store backed by one local SQLite file.
pub struct SqliteCatalogStore {
    pool: Pool<Sqlite>,
}

impl SqliteCatalogStore {
    /// Open (creating if missing) a catalog store.
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }
}

fn entry_kind(kind: i64, mountpoint: i64) -> Result<EntryKind> {
    match kind {
        KIND_DIRECTORY => Ok(EntryKind::Directory {
            mountpoint: mountpoint != 0,
        }),
        KIND_FILE => Ok(EntryKind::File),
        KIND_SYMLINK => Ok(EntryKind::Symlink),
        other => Err(GraftError::Internal(format!("unknown entry kind {other}"))),
    }
}

fn seconds(mtime_ns: i64) -> i64 {
    mtime_ns / 1_000_000_000
}

fn encode_xattrs(xattrs: &crate::model::XattrList) -> String {
    if xattrs.is_empty() {
        String::new()
    } else {
        serde_json::to_string(xattrs).expect("xattr maps always serialize")
    }
}

fn encode_chunks(file: &File) -> String {
    file.chunks
        .iter()
        .map(|c| format!("{}:{}:{}", c.digest, c.offset, c.size))
        .collect::<Vec<_>>()
        .join(",")
}

/// `substr`-based descendant match; avoids LIKE wildcard pitfalls in paths.
const DESCENDANT: &str = "substr(path, 1, length(?1) + 1) = ?1 || '/'";

#[async_trait]
impl CatalogManager for SqliteCatalogStore {
    async fn precache(&self, lease_path: &str, dirs: &[String]) -> Result<()> {
        // A local store has nothing to warm up.
        tracing::debug!(lease = lease_path, dirs = dirs.len(), "precache request");
        Ok(())
    }

    async fn lookup(&self, entry_path: &str) -> Result<Option<CatalogEntry>> {
        let row: Option<(i64, i64, i64, i64, i64, i64, i64)> = sqlx::query_as(
            "SELECT kind, mode, mtime, uid, gid, size, mountpoint FROM entries WHERE path = ?",
        )
        .bind(entry_path)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(kind, mode, mtime, uid, gid, size, mountpoint)| {
            Ok(CatalogEntry {
                kind: entry_kind(kind, mountpoint)?,
                mode: mode as u32,
                mtime,
                uid: uid as u32,
                gid: gid as u32,
                size: size as u64,
            })
        })
        .transpose()
    }

    async fn listing(&self, dir_path: &str) -> Result<Vec<ChildEntry>> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            "SELECT path, kind, mountpoint FROM entries \
             WHERE parent = ? AND path <> parent ORDER BY path",
        )
        .bind(dir_path)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(entry_path, kind, mountpoint)| {
                Ok(ChildEntry {
                    name: path::basename(&entry_path).to_string(),
                    kind: entry_kind(kind, mountpoint)?,
                })
            })
            .collect()
    }

    async fn add_directory(&self, dir: &Directory) -> Result<()> {
        sqlx::query(
            "INSERT INTO entries (path, parent, kind, mode, mtime, uid, gid, xattrs) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&dir.name)
        .bind(path::parent(&dir.name))
        .bind(KIND_DIRECTORY)
        .bind((dir.mode & 0o777) as i64)
        .bind(seconds(dir.mtime_ns))
        .bind(dir.owner as i64)
        .bind(dir.group as i64)
        .bind(encode_xattrs(&dir.xattrs))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_directory(&self, dir: &Directory) -> Result<()> {
        let result = sqlx::query(
            "UPDATE entries SET mode = ?, mtime = ?, uid = ?, gid = ?, xattrs = ? \
             WHERE path = ? AND kind = 0",
        )
        .bind((dir.mode & 0o777) as i64)
        .bind(seconds(dir.mtime_ns))
        .bind(dir.owner as i64)
        .bind(dir.group as i64)
        .bind(encode_xattrs(&dir.xattrs))
        .bind(&dir.name)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(GraftError::Internal(format!(
                "touched directory {} does not exist",
                dir.name
            )));
        }
        Ok(())
    }

    async fn add_file(&self, file: &File) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO entries \
             (path, parent, kind, mode, mtime, uid, gid, size, compression, external, chunks) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&file.name)
        .bind(path::parent(&file.name))
        .bind(KIND_FILE)
        .bind((file.mode & 0o777) as i64)
        .bind(seconds(file.mtime_ns))
        .bind(file.owner as i64)
        .bind(file.group as i64)
        .bind(file.size as i64)
        .bind(file.compression.resolve(file.internal).as_str())
        .bind(!file.internal)
        .bind(encode_chunks(file))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn add_symlink(&self, symlink: &Symlink) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO entries \
             (path, parent, kind, mode, mtime, uid, gid, target) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&symlink.name)
        .bind(path::parent(&symlink.name))
        .bind(KIND_SYMLINK)
        .bind(0o777)
        .bind(seconds(symlink.mtime_ns))
        .bind(symlink.owner as i64)
        .bind(symlink.group as i64)
        .bind(&symlink.target)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_file(&self, entry_path: &str) -> Result<()> {
        sqlx::query("DELETE FROM entries WHERE path = ? AND kind <> 0")
            .bind(entry_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_directory(&self, entry_path: &str) -> Result<()> {
        sqlx::query("DELETE FROM entries WHERE path = ? AND kind = 0")
            .bind(entry_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_nested_catalog(&self, entry_path: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO nested_catalogs (path) VALUES (?)")
            .bind(entry_path)
            .execute(&self.pool)
            .await?;
        sqlx::query("UPDATE entries SET mountpoint = 1 WHERE path = ?")
            .bind(entry_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_nested_catalog(&self, entry_path: &str) -> Result<()> {
        // Detaching takes the nested content with it.
        sqlx::query(&format!("DELETE FROM entries WHERE {DESCENDANT}"))
            .bind(entry_path)
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!(
            "DELETE FROM nested_catalogs WHERE path = ?1 OR {DESCENDANT}"
        ))
        .bind(entry_path)
        .execute(&self.pool)
        .await?;
        sqlx::query("UPDATE entries SET mountpoint = 0 WHERE path = ?")
            .bind(entry_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn is_transition_point(&self, entry_path: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM nested_catalogs WHERE path = ?)")
                .bind(entry_path)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn snapshot_catalog(&self, entry_path: &str) -> Result<()> {
        // Snapshots are an upload concern; the local store keeps everything
        // in one database.
        tracing::debug!(path = entry_path, "snapshot request");
        Ok(())
    }

    async fn commit(&self) -> Result<String> {
        let rows: Vec<(String, i64, i64, i64, i64, i64, i64, String, String, i64, i64, String, String)> =
            sqlx::query_as(
                "SELECT path, kind, mode, mtime, uid, gid, size, target, compression, \
                 external, mountpoint, xattrs, chunks FROM entries ORDER BY path",
            )
            .fetch_all(&self.pool)
            .await?;

        let mut hasher = Sha256::new();
        for (
            entry_path,
            kind,
            mode,
            mtime,
            uid,
            gid,
            size,
            target,
            compression,
            external,
            mountpoint,
            xattrs,
            chunks,
        ) in rows
        {
            hasher.update(format!(
                "{entry_path}|{kind}|{mode:o}|{mtime}|{uid}|{gid}|{size}|{target}|\
                 {compression}|{external}|{mountpoint}|{xattrs}|{chunks}\n"
            ));
        }
        let digest = hasher.finalize();
        Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
    }

    async fn wait_for_uploads(&self) -> Result<()> {
        Ok(())
    }
}
