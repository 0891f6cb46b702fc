//! SQLite-backed LRU ledger with a single command-server task.
//!
//! Every mutation of the persistent cache catalog and of the in-memory
//! counters happens on one dedicated task that owns the database pool.
//! Callers submit commands through a bounded queue; touches and inserts are
//! batched into transactions, commands that carry a result (pin, reserve,
//! remove, cleanup, listings, status) flush the batch and reply on a
//! oneshot channel.
//!
//! A `limit` of zero disables cache management entirely: every operation
//! succeeds as a no-op, mirroring an unmanaged cache directory.

use crate::error::{CacheError, Result};
use crate::rebuild;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqliteConnection};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use strata_core::ChunkDigest;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Maximum byte length of a cache path carried by an insert or pin command.
///
/// The bound is inherited from the wire format of the original command pipe,
/// where a command record plus its path had to fit an atomic pipe write.
pub const MAX_CACHE_PATH: usize = 512;

/// Touch/insert commands are committed in batches of this many operations.
const COMMAND_BATCH_SIZE: usize = 64;

/// Depth of the command queue between callers and the server task.
const COMMAND_QUEUE_DEPTH: usize = 256;

/// Row type of a ledger entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i64)]
enum FileKind {
    Regular = 0,
    Catalog = 1,
}

#[derive(Clone, Copy, Debug)]
enum ListKind {
    Regular,
    Pinned,
    Catalogs,
}

enum LedgerCommand {
    Touch {
        digest: ChunkDigest,
    },
    Insert {
        digest: ChunkDigest,
        size: u64,
        path: String,
    },
    Pin {
        digest: ChunkDigest,
        size: u64,
        path: String,
        reply: oneshot::Sender<bool>,
    },
    Reserve {
        digest: ChunkDigest,
        size: u64,
        reply: oneshot::Sender<bool>,
    },
    Remove {
        digest: ChunkDigest,
        reply: oneshot::Sender<()>,
    },
    Cleanup {
        leave_size: u64,
        reply: oneshot::Sender<bool>,
    },
    List {
        kind: ListKind,
        reply: oneshot::Sender<Vec<String>>,
    },
    Status {
        reply: oneshot::Sender<(u64, u64)>,
    },
}

/// Handle to the LRU ledger.
///
/// Cloning is not supported; share behind an `Arc` if multiple owners need
/// access. All methods are safe to call concurrently.
pub struct LruLedger {
    tx: Option<mpsc::Sender<LedgerCommand>>,
    server: Option<JoinHandle<()>>,
    cache_dir: PathBuf,
    limit: u64,
    cleanup_threshold: u64,
}

impl LruLedger {
    /// Open (and if necessary bootstrap) the ledger for a cache directory.
    ///
    /// With `limit == 0` the cache is unmanaged and no server task is
    /// spawned. `force_rebuild` re-scans the cache directory even when the
    /// persisted table is non-empty; an empty table always triggers a
    /// rebuild.
    pub async fn open(
        cache_dir: impl AsRef<Path>,
        limit: u64,
        cleanup_threshold: u64,
        force_rebuild: bool,
    ) -> Result<Self> {
        let cache_dir = cache_dir.as_ref().to_path_buf();
        if limit > 0 && cleanup_threshold >= limit {
            return Err(CacheError::Input(format!(
                "cleanup threshold {cleanup_threshold} must be below limit {limit}"
            )));
        }

        let pool = bootstrap_database(&cache_dir).await?;

        if limit == 0 {
            pool.close().await;
            return Ok(Self {
                tx: None,
                server: None,
                cache_dir,
                limit,
                cleanup_threshold,
            });
        }

        // Stale pins from a previous process are meaningless now.
        sqlx::query("UPDATE cache_catalog SET pinned = 0")
            .execute(&pool)
            .await?;

        let row_count: i64 = sqlx::query_scalar("SELECT count(*) FROM cache_catalog")
            .fetch_one(&pool)
            .await?;
        if force_rebuild || row_count == 0 {
            rebuild::rebuild_from_directory(&pool, &cache_dir).await?;
        }

        let gauge: i64 = sqlx::query_scalar("SELECT coalesce(sum(size), 0) FROM cache_catalog")
            .fetch_one(&pool)
            .await?;
        let max_seq: i64 = sqlx::query_scalar("SELECT coalesce(max(acseq), 0) FROM cache_catalog")
            .fetch_one(&pool)
            .await?;

        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let server = Server {
            pool,
            cache_dir: cache_dir.clone(),
            limit,
            cleanup_threshold,
            gauge: gauge as u64,
            pinned: 0,
            seq: max_seq as u64 + 1,
            pinned_set: HashSet::new(),
        };
        let handle = tokio::spawn(server.run(rx));

        Ok(Self {
            tx: Some(tx),
            server: Some(handle),
            cache_dir,
            limit,
            cleanup_threshold,
        })
    }

    /// Total capacity in bytes (0 = unmanaged).
    pub fn capacity(&self) -> u64 {
        self.limit
    }

    /// Largest insertable file: cleanup only frees down to the threshold.
    pub fn max_file_size(&self) -> u64 {
        if self.limit == 0 {
            u64::MAX
        } else {
            self.limit - self.cleanup_threshold
        }
    }

    /// Assign a fresh access sequence to an entry if present. Batched,
    /// fire-and-forget.
    pub async fn touch(&self, digest: ChunkDigest) -> Result<()> {
        let Some(tx) = &self.tx else { return Ok(()) };
        tx.send(LedgerCommand::Touch { digest })
            .await
            .map_err(|_| CacheError::Shutdown)
    }

    /// Record a regular file, evicting older entries first when the cache
    /// would exceed its limit. Batched, fire-and-forget.
    pub async fn insert(&self, digest: ChunkDigest, size: u64, path: &str) -> Result<()> {
        let Some(tx) = &self.tx else { return Ok(()) };
        tx.send(LedgerCommand::Insert {
            digest,
            size,
            path: checked_path(path)?,
        })
        .await
        .map_err(|_| CacheError::Shutdown)
    }

    /// Record a pinned catalog file. Returns `false` when the pin budget
    /// (the cleanup threshold) would be exceeded.
    pub async fn pin(&self, digest: ChunkDigest, size: u64, path: &str) -> Result<bool> {
        let Some(tx) = &self.tx else { return Ok(true) };
        let (reply, rx) = oneshot::channel();
        tx.send(LedgerCommand::Pin {
            digest,
            size,
            path: checked_path(path)?,
            reply,
        })
        .await
        .map_err(|_| CacheError::Shutdown)?;
        rx.await.map_err(|_| CacheError::Shutdown)
    }

    /// Reserve pin budget for an entry whose data is not yet present. No
    /// database write.
    pub async fn reserve(&self, digest: ChunkDigest, size: u64) -> Result<bool> {
        let Some(tx) = &self.tx else { return Ok(true) };
        let (reply, rx) = oneshot::channel();
        tx.send(LedgerCommand::Reserve {
            digest,
            size,
            reply,
        })
        .await
        .map_err(|_| CacheError::Shutdown)?;
        rx.await.map_err(|_| CacheError::Shutdown)
    }

    /// Drop an entry from the ledger and unlink its data file. Idempotent;
    /// the unlink is best-effort.
    pub async fn remove(&self, digest: ChunkDigest) -> Result<()> {
        let Some(tx) = &self.tx else {
            // Unmanaged cache: still drop the data file.
            let _ = std::fs::remove_file(self.cache_dir.join(digest.to_cache_path()));
            return Ok(());
        };
        let (reply, rx) = oneshot::channel();
        tx.send(LedgerCommand::Remove { digest, reply })
            .await
            .map_err(|_| CacheError::Shutdown)?;
        rx.await.map_err(|_| CacheError::Shutdown)
    }

    /// Evict unpinned entries in access order until the cache holds at most
    /// `leave_size` bytes. Returns whether the target was reached.
    pub async fn cleanup(&self, leave_size: u64) -> Result<bool> {
        let Some(tx) = &self.tx else { return Ok(true) };
        let (reply, rx) = oneshot::channel();
        tx.send(LedgerCommand::Cleanup { leave_size, reply })
            .await
            .map_err(|_| CacheError::Shutdown)?;
        rx.await.map_err(|_| CacheError::Shutdown)
    }

    /// Paths of all regular entries.
    pub async fn list(&self) -> Result<Vec<String>> {
        self.list_of(ListKind::Regular).await
    }

    /// Paths of all pinned entries.
    pub async fn list_pinned(&self) -> Result<Vec<String>> {
        self.list_of(ListKind::Pinned).await
    }

    /// Paths of all catalog entries.
    pub async fn list_catalogs(&self) -> Result<Vec<String>> {
        self.list_of(ListKind::Catalogs).await
    }

    async fn list_of(&self, kind: ListKind) -> Result<Vec<String>> {
        let Some(tx) = &self.tx else {
            return Ok(Vec::new());
        };
        let (reply, rx) = oneshot::channel();
        tx.send(LedgerCommand::List { kind, reply })
            .await
            .map_err(|_| CacheError::Shutdown)?;
        rx.await.map_err(|_| CacheError::Shutdown)
    }

    /// Current `(gauge, pinned)` byte counts, read atomically.
    pub async fn status(&self) -> Result<(u64, u64)> {
        let Some(tx) = &self.tx else { return Ok((0, 0)) };
        let (reply, rx) = oneshot::channel();
        tx.send(LedgerCommand::Status { reply })
            .await
            .map_err(|_| CacheError::Shutdown)?;
        rx.await.map_err(|_| CacheError::Shutdown)
    }

    /// Flush outstanding commands and stop the server task.
    pub async fn shutdown(mut self) {
        self.tx.take();
        if let Some(handle) = self.server.take() {
            let _ = handle.await;
        }
    }
}

fn checked_path(path: &str) -> Result<String> {
    if path.len() > MAX_CACHE_PATH {
        return Err(CacheError::Input(format!(
            "cache path exceeds {MAX_CACHE_PATH} bytes: {path}"
        )));
    }
    Ok(path.to_string())
}

/// Create or open the ledger database, retrying once from scratch when the
/// schema cannot be set up (a corrupted file is deleted and recreated).
async fn bootstrap_database(cache_dir: &Path) -> Result<Pool<Sqlite>> {
    let db_file = cache_dir.join(crate::LEDGER_DB_NAME);
    let mut retried = false;
    loop {
        match try_bootstrap(&db_file).await {
            Ok(pool) => return Ok(pool),
            Err(err) if !retried => {
                retried = true;
                tracing::warn!(error = %err, "ledger database corrupted, re-building");
                let _ = std::fs::remove_file(&db_file);
                let _ = std::fs::remove_file(db_file.with_extension("cache-journal"));
            }
            Err(err) => return Err(err),
        }
    }
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS cache_catalog (sha1 TEXT, size INTEGER NOT NULL, \
     acseq INTEGER NOT NULL, path TEXT NOT NULL, type INTEGER NOT NULL, pinned INTEGER NOT NULL, \
     CONSTRAINT pk_cache_catalog PRIMARY KEY (sha1))",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_cache_catalog_acseq ON cache_catalog (acseq)",
    "CREATE TEMP TABLE fscache (sha1 TEXT, size INTEGER, actime INTEGER, \
     CONSTRAINT pk_fscache PRIMARY KEY (sha1))",
    "CREATE INDEX idx_fscache_actime ON fscache (actime)",
    "CREATE TABLE IF NOT EXISTS properties (key TEXT, value TEXT, \
     CONSTRAINT pk_properties PRIMARY KEY (key))",
    "INSERT OR REPLACE INTO properties (key, value) VALUES ('schema', '1.0')",
];

async fn try_bootstrap(db_file: &Path) -> Result<Pool<Sqlite>> {
    let opts = SqliteConnectOptions::new()
        .filename(db_file)
        .create_if_missing(true)
        .pragma("synchronous", "0")
        .pragma("locking_mode", "EXCLUSIVE")
        .pragma("auto_vacuum", "1");

    // One connection only: the temp `fscache` table and the exclusive lock
    // are connection-scoped state.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(opts)
        .await?;

    for statement in SCHEMA {
        if let Err(err) = sqlx::query(statement).execute(&pool).await {
            pool.close().await;
            return Err(err.into());
        }
    }
    Ok(pool)
}

struct Server {
    pool: Pool<Sqlite>,
    cache_dir: PathBuf,
    limit: u64,
    cleanup_threshold: u64,
    gauge: u64,
    pinned: u64,
    seq: u64,
    pinned_set: HashSet<ChunkDigest>,
}

enum QueuedOp {
    Touch {
        digest: ChunkDigest,
    },
    Insert {
        digest: ChunkDigest,
        size: u64,
        path: String,
    },
}

impl Server {
    async fn run(mut self, mut rx: mpsc::Receiver<LedgerCommand>) {
        tracing::debug!("ledger command server started");
        let mut batch: Vec<QueuedOp> = Vec::with_capacity(COMMAND_BATCH_SIZE);

        while let Some(command) = rx.recv().await {
            match command {
                LedgerCommand::Touch { digest } => {
                    batch.push(QueuedOp::Touch { digest });
                    if batch.len() == COMMAND_BATCH_SIZE {
                        self.flush(&mut batch).await;
                    }
                }
                LedgerCommand::Insert { digest, size, path } => {
                    batch.push(QueuedOp::Insert { digest, size, path });
                    if batch.len() == COMMAND_BATCH_SIZE {
                        self.flush(&mut batch).await;
                    }
                }
                // Reservations touch only the in-memory pin accounting.
                LedgerCommand::Reserve {
                    digest,
                    size,
                    reply,
                } => {
                    let _ = reply.send(self.reserve(digest, size));
                }
                immediate => {
                    // Everything below observes the database: flush first so
                    // the reply reflects all commands submitted before it.
                    self.flush(&mut batch).await;
                    self.handle_immediate(immediate).await;
                }
            }
        }

        self.flush(&mut batch).await;
        self.pool.close().await;
        tracing::debug!("ledger command server stopped");
    }

    async fn handle_immediate(&mut self, command: LedgerCommand) {
        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(err) => die(&err),
        };
        match command {
            LedgerCommand::Pin {
                digest,
                size,
                path,
                reply,
            } => {
                let result = self.do_pin(&mut *conn, digest, size, &path).await;
                let _ = reply.send(unwrap_or_die(result));
            }
            LedgerCommand::Remove { digest, reply } => {
                unwrap_or_die(self.do_remove(&mut *conn, digest).await);
                let _ = reply.send(());
            }
            LedgerCommand::Cleanup { leave_size, reply } => {
                let result = self.do_cleanup(&mut *conn, leave_size).await;
                let _ = reply.send(unwrap_or_die(result));
            }
            LedgerCommand::List { kind, reply } => {
                let query = match kind {
                    ListKind::Regular => "SELECT path FROM cache_catalog WHERE type = 0",
                    ListKind::Pinned => "SELECT path FROM cache_catalog WHERE pinned = 1",
                    ListKind::Catalogs => "SELECT path FROM cache_catalog WHERE type = 1",
                };
                let rows = sqlx::query_scalar::<_, String>(query)
                    .fetch_all(&mut *conn)
                    .await;
                let _ = reply.send(unwrap_or_die(rows));
            }
            LedgerCommand::Status { reply } => {
                let _ = reply.send((self.gauge, self.pinned));
            }
            LedgerCommand::Touch { .. }
            | LedgerCommand::Insert { .. }
            | LedgerCommand::Reserve { .. } => unreachable!("handled by the batch path"),
        }
    }

    async fn flush(&mut self, batch: &mut Vec<QueuedOp>) {
        if batch.is_empty() {
            return;
        }
        if let Err(err) = self.flush_inner(batch).await {
            die(&err);
        }
        batch.clear();
    }

    async fn flush_inner(&mut self, batch: &[QueuedOp]) -> sqlx::Result<()> {
        let mut tx = self.pool.begin().await?;
        for op in batch {
            match op {
                QueuedOp::Touch { digest } => {
                    let seq = self.next_seq();
                    sqlx::query("UPDATE cache_catalog SET acseq = ? WHERE sha1 = ?")
                        .bind(seq as i64)
                        .bind(digest.to_hex())
                        .execute(&mut *tx)
                        .await?;
                }
                QueuedOp::Insert { digest, size, path } => {
                    let hex = digest.to_hex();
                    let exists: Option<i64> =
                        sqlx::query_scalar("SELECT size FROM cache_catalog WHERE sha1 = ?")
                            .bind(&hex)
                            .fetch_optional(&mut *tx)
                            .await?;

                    if exists.is_none() && self.gauge + size > self.limit {
                        tracing::debug!(
                            gauge = self.gauge,
                            size,
                            "cache over limit, evicting before insert"
                        );
                        // The incoming file counts against the threshold.
                        let target = self.cleanup_threshold.saturating_sub(*size);
                        if !self.do_cleanup(&mut *tx, target).await? {
                            tracing::warn!(
                                leave_size = target,
                                "eviction could not reach cleanup threshold"
                            );
                        }
                    }

                    let seq = self.next_seq();
                    sqlx::query(
                        "INSERT OR REPLACE INTO cache_catalog \
                         (sha1, size, acseq, path, type, pinned) VALUES (?, ?, ?, ?, ?, 0)",
                    )
                    .bind(&hex)
                    .bind(*size as i64)
                    .bind(seq as i64)
                    .bind(path)
                    .bind(FileKind::Regular as i64)
                    .execute(&mut *tx)
                    .await?;

                    if exists.is_none() {
                        self.gauge += size;
                    }
                }
            }
        }
        tx.commit().await
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }

    fn reserve(&mut self, digest: ChunkDigest, size: u64) -> bool {
        if self.pinned_set.contains(&digest) {
            return true;
        }
        if self.cleanup_threshold > 0 && self.pinned + size > self.cleanup_threshold {
            tracing::debug!(digest = %digest, size, "pin reservation denied, no space");
            return false;
        }
        self.pinned_set.insert(digest);
        self.pinned += size;
        true
    }

    async fn do_pin(
        &mut self,
        conn: &mut SqliteConnection,
        digest: ChunkDigest,
        size: u64,
        path: &str,
    ) -> sqlx::Result<bool> {
        if self.pinned_set.contains(&digest) {
            return Ok(true);
        }
        if self.cleanup_threshold > 0 && self.pinned + size > self.cleanup_threshold {
            tracing::debug!(digest = %digest, size, "pin denied, no space");
            return Ok(false);
        }

        let hex = digest.to_hex();
        let exists: Option<i64> =
            sqlx::query_scalar("SELECT size FROM cache_catalog WHERE sha1 = ?")
                .bind(&hex)
                .fetch_optional(&mut *conn)
                .await?;

        // Make room before committing to the pin, so a failed cleanup
        // leaves the ledger untouched.
        if exists.is_none()
            && self.gauge + size > self.limit
            && !self
                .do_cleanup(conn, self.cleanup_threshold.saturating_sub(size))
                .await?
        {
            tracing::debug!(digest = %digest, size, "pin denied, eviction failed");
            return Ok(false);
        }

        self.pinned_set.insert(digest);
        self.pinned += size;

        let seq = self.next_seq();
        sqlx::query(
            "INSERT OR REPLACE INTO cache_catalog \
             (sha1, size, acseq, path, type, pinned) VALUES (?, ?, ?, ?, ?, 1)",
        )
        .bind(&hex)
        .bind(size as i64)
        .bind(seq as i64)
        .bind(path)
        .bind(FileKind::Catalog as i64)
        .execute(&mut *conn)
        .await?;

        if exists.is_none() {
            self.gauge += size;
        }
        Ok(true)
    }

    async fn do_remove(
        &mut self,
        conn: &mut SqliteConnection,
        digest: ChunkDigest,
    ) -> sqlx::Result<()> {
        let hex = digest.to_hex();
        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT size, pinned FROM cache_catalog WHERE sha1 = ?")
                .bind(&hex)
                .fetch_optional(&mut *conn)
                .await?;

        if let Some((size, pinned)) = row {
            sqlx::query("DELETE FROM cache_catalog WHERE sha1 = ?")
                .bind(&hex)
                .execute(&mut *conn)
                .await?;
            self.gauge = self.gauge.saturating_sub(size as u64);
            if pinned != 0 {
                self.pinned_set.remove(&digest);
                self.pinned = self.pinned.saturating_sub(size as u64);
            }
        }

        let _ = std::fs::remove_file(self.cache_dir.join(digest.to_cache_path()));
        Ok(())
    }

    /// Evict unpinned rows in ascending access order until the gauge drops
    /// to `leave_size` or nothing evictable remains.
    async fn do_cleanup(
        &mut self,
        conn: &mut SqliteConnection,
        leave_size: u64,
    ) -> sqlx::Result<bool> {
        if self.gauge <= leave_size {
            return Ok(true);
        }
        tracing::info!(leave_kb = leave_size / 1024, "cleaning up cache");

        while self.gauge > leave_size {
            let victim: Option<(String, i64)> = sqlx::query_as(
                "SELECT sha1, size FROM cache_catalog WHERE pinned = 0 \
                 ORDER BY acseq LIMIT 1",
            )
            .fetch_optional(&mut *conn)
            .await?;
            let Some((sha1, size)) = victim else {
                tracing::debug!("no evictable entry left");
                break;
            };

            let _ = std::fs::remove_file(
                self.cache_dir
                    .join(format!("{}/{}", &sha1[..2], &sha1[2..])),
            );
            sqlx::query("DELETE FROM cache_catalog WHERE sha1 = ?")
                .bind(&sha1)
                .execute(&mut *conn)
                .await?;
            self.gauge = self.gauge.saturating_sub(size as u64);
            tracing::debug!(digest = %sha1, size, "evicted");
        }

        Ok(self.gauge <= leave_size)
    }
}

/// A failed ledger write leaves the database in an unknown state; the
/// invariants tying the counters to the table cannot be re-established, so
/// the process must not continue.
fn die(err: &sqlx::Error) -> ! {
    tracing::error!(error = %err, "ledger database failure, aborting");
    std::process::abort();
}

fn unwrap_or_die<T>(result: sqlx::Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => die(&err),
    }
}
