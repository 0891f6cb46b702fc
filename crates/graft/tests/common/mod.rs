//! Shared helpers for graft integration tests.
#![allow(dead_code)]

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::{Path, PathBuf};
use strata_graft::{Changeset, GraftDb, SqliteCatalogStore};
use tempfile::TempDir;

pub async fn open_rw(db_path: &Path) -> Pool<Sqlite> {
    let opts = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(opts)
        .await
        .unwrap()
}

/// A graft database under construction.
pub struct GraftDbBuilder {
    pub db_path: PathBuf,
    pool: Pool<Sqlite>,
}

impl GraftDbBuilder {
    pub async fn new(dir: &TempDir, name: &str) -> Self {
        let db_path = dir.path().join(name);
        strata_graft::db::create_empty(&db_path).await.unwrap();
        let pool = open_rw(&db_path).await;
        Self { db_path, pool }
    }

    pub async fn dir(&self, name: &str, nested: i64) -> &Self {
        sqlx::query("INSERT INTO dirs (name, mtime, nested) VALUES (?, 1700000000000000000, ?)")
            .bind(name)
            .bind(nested)
            .execute(&self.pool)
            .await
            .unwrap();
        self
    }

    pub async fn dir_with_acl(&self, name: &str, acl: &str) -> &Self {
        sqlx::query(
            "INSERT INTO dirs (name, mtime, nested, acl) VALUES (?, 1700000000000000000, 0, ?)",
        )
        .bind(name)
        .bind(acl)
        .execute(&self.pool)
        .await
        .unwrap();
        self
    }

    pub async fn file(&self, name: &str, size: i64, hashes: &str, internal: i64) -> &Self {
        sqlx::query(
            "INSERT INTO files (name, mtime, size, hashes, internal) \
             VALUES (?, 1700000000000000000, ?, ?, ?)",
        )
        .bind(name)
        .bind(size)
        .bind(hashes)
        .bind(internal)
        .execute(&self.pool)
        .await
        .unwrap();
        self
    }

    pub async fn link(&self, name: &str, target: &str, skip_if_file_or_dir: i64) -> &Self {
        sqlx::query(
            "INSERT INTO links (name, target, mtime, skip_if_file_or_dir) \
             VALUES (?, ?, 1700000000000000000, ?)",
        )
        .bind(name)
        .bind(target)
        .bind(skip_if_file_or_dir)
        .execute(&self.pool)
        .await
        .unwrap();
        self
    }

    pub async fn deletion(&self, name: &str, directory: i64, file: i64, link: i64) -> &Self {
        sqlx::query("INSERT INTO deletions (name, directory, file, link) VALUES (?, ?, ?, ?)")
            .bind(name)
            .bind(directory)
            .bind(file)
            .bind(link)
            .execute(&self.pool)
            .await
            .unwrap();
        self
    }

    pub async fn open(&self) -> GraftDb {
        GraftDb::open(&self.db_path).await.unwrap()
    }
}

/// Load the complete changeset of one graft database.
pub async fn load_changeset(db: &GraftDb, lease: &str, prefix: &str) -> Changeset {
    let mut changeset = Changeset::default();
    db.load_dirs(lease, prefix, &mut changeset).await.unwrap();
    db.load_files(lease, prefix, &mut changeset).await.unwrap();
    db.load_symlinks(lease, prefix, &mut changeset)
        .await
        .unwrap();
    changeset
}

pub async fn fresh_store(dir: &TempDir) -> SqliteCatalogStore {
    SqliteCatalogStore::open(dir.path().join("catalog.db"))
        .await
        .unwrap()
}

pub fn digest_hex(n: u64) -> String {
    format!("{n:040x}")
}
