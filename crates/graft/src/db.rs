//! Graft database creation and the `completed_graft` property.

use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;

/// Canonical graft schema, revision 4.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS dirs ( \
        name  TEXT    PRIMARY KEY, \
        mode  INTEGER NOT NULL DEFAULT 493, \
        mtime INTEGER NOT NULL DEFAULT (unixepoch()), \
        owner INTEGER NOT NULL DEFAULT 0, \
        grp   INTEGER NOT NULL DEFAULT 0, \
        acl   TEXT    NOT NULL DEFAULT '', \
        nested INTEGER DEFAULT 1)",
    "CREATE TABLE IF NOT EXISTS files ( \
        name   TEXT    PRIMARY KEY, \
        mode   INTEGER NOT NULL DEFAULT 420, \
        mtime  INTEGER NOT NULL DEFAULT (unixepoch()), \
        owner  INTEGER NOT NULL DEFAULT 0, \
        grp    INTEGER NOT NULL DEFAULT 0, \
        size   INTEGER NOT NULL DEFAULT 0, \
        hashes TEXT    NOT NULL DEFAULT '', \
        internal INTEGER NOT NULL DEFAULT 0, \
        compressed INTEGER NOT NULL DEFAULT 0)",
    "CREATE TABLE IF NOT EXISTS links ( \
        name   TEXT    PRIMARY KEY, \
        target TEXT    NOT NULL DEFAULT '', \
        mtime  INTEGER NOT NULL DEFAULT (unixepoch()), \
        owner  INTEGER NOT NULL DEFAULT 0, \
        grp    INTEGER NOT NULL DEFAULT 0, \
        skip_if_file_or_dir INTEGER NOT NULL DEFAULT 0)",
    "CREATE TABLE IF NOT EXISTS deletions ( \
        name      TEXT PRIMARY KEY, \
        directory INTEGER NOT NULL DEFAULT 0, \
        file      INTEGER NOT NULL DEFAULT 0, \
        link      INTEGER NOT NULL DEFAULT 0)",
    "CREATE TABLE IF NOT EXISTS properties ( \
        key   TEXT PRIMARY KEY, \
        value TEXT NOT NULL)",
    "INSERT INTO properties VALUES ('schema_revision', '4') ON CONFLICT DO NOTHING",
];

async fn open_writable(db_path: &Path) -> Result<Pool<Sqlite>> {
    let opts = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .pragma("synchronous", "OFF");
    Ok(SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(opts)
        .await?)
}

/// Create an empty graft database with the canonical schema.
pub async fn create_empty(db_path: impl AsRef<Path>) -> Result<()> {
    let db_path = db_path.as_ref();
    tracing::info!(file = %db_path.display(), "creating empty graft database");
    let pool = open_writable(db_path).await?;
    for statement in SCHEMA {
        sqlx::query(statement).execute(&pool).await?;
    }
    pool.close().await;
    Ok(())
}

/// Whether the database carries the `completed_graft` marker.
pub async fn is_marked_complete(db_path: impl AsRef<Path>) -> bool {
    let Ok(pool) = open_writable(db_path.as_ref()).await else {
        return false;
    };
    let value: Option<String> =
        sqlx::query_scalar("SELECT value FROM properties WHERE key = 'completed_graft'")
            .fetch_optional(&pool)
            .await
            .ok()
            .flatten();
    pool.close().await;
    value.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0) > 0
}

/// Set the `completed_graft` marker after a successful run.
pub async fn mark_complete(db_path: impl AsRef<Path>) -> Result<()> {
    let pool = open_writable(db_path.as_ref()).await?;
    sqlx::query(
        "INSERT INTO properties (key, value) VALUES ('completed_graft', '1') \
         ON CONFLICT(key) DO UPDATE SET value = '1'",
    )
    .execute(&pool)
    .await?;
    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_empty_and_mark_complete() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("graft.db");

        create_empty(&db_path).await.unwrap();
        let db = crate::GraftDb::open(&db_path).await.unwrap();
        assert_eq!(db.schema_revision(), 4);

        assert!(!is_marked_complete(&db_path).await);
        mark_complete(&db_path).await.unwrap();
        assert!(is_marked_complete(&db_path).await);
        // setting it again is fine
        mark_complete(&db_path).await.unwrap();
        assert!(is_marked_complete(&db_path).await);
    }
}
