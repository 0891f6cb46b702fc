//! Catalog download worker pool.
//!
//! A fixed-size group of workers drains a queue of catalog digests, fetches
//! each catalog through the [`CatalogFetcher`] seam, and multicasts results
//! to registered listeners. An in-flight counter lets callers wait until
//! the queue has drained; listeners may enqueue further catalogs from their
//! callback (the counter is decremented only after the callbacks ran).

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use strata_core::ChunkDigest;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;

/// Number of download workers; downloads are cheap to parallelise.
pub const DEFAULT_DOWNLOAD_WORKERS: usize = 32;

/// Fetches one catalog blob into the local cache.
#[async_trait]
pub trait CatalogFetcher: Send + Sync + 'static {
    async fn fetch(&self, digest: &ChunkDigest) -> crate::Result<PathBuf>;
}

/// Outcome of one completed catalog download.
#[derive(Clone, Debug)]
pub struct CatalogDownloadResult {
    pub digest: ChunkDigest,
    pub db_path: PathBuf,
}

type Listener = Arc<dyn Fn(&CatalogDownloadResult) + Send + Sync>;

struct Shared {
    fetcher: Arc<dyn CatalogFetcher>,
    listeners: Vec<Listener>,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Fixed-size worker pool for catalog downloads.
pub struct CatalogDownloadPool {
    shared: Arc<Shared>,
    tx: Option<mpsc::Sender<ChunkDigest>>,
    workers: Vec<JoinHandle<()>>,
}

impl CatalogDownloadPool {
    /// Create a pool; listeners must be registered before [`Self::spawn`].
    pub fn new(fetcher: Arc<dyn CatalogFetcher>) -> Self {
        Self {
            shared: Arc::new(Shared {
                fetcher,
                listeners: Vec::new(),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
            tx: None,
            workers: Vec::new(),
        }
    }

    /// Register a completion listener. Panics after [`Self::spawn`].
    pub fn register_listener(
        &mut self,
        listener: impl Fn(&CatalogDownloadResult) + Send + Sync + 'static,
    ) {
        let shared = Arc::get_mut(&mut self.shared)
            .expect("listeners must be registered before spawning workers");
        shared.listeners.push(Arc::new(listener));
    }

    /// Start the worker tasks.
    pub fn spawn(&mut self) {
        self.spawn_workers(DEFAULT_DOWNLOAD_WORKERS);
    }

    /// Start a specific number of worker tasks.
    pub fn spawn_workers(&mut self, count: usize) {
        assert!(self.tx.is_none(), "pool already spawned");
        let (tx, rx) = mpsc::channel::<ChunkDigest>(count * 4);
        let rx = Arc::new(Mutex::new(rx));
        for _ in 0..count.max(1) {
            let shared = self.shared.clone();
            let rx = rx.clone();
            self.workers.push(tokio::spawn(async move {
                loop {
                    let digest = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(digest) = digest else { break };
                    shared.process(digest).await;
                }
            }));
        }
        self.tx = Some(tx);
    }

    /// Enqueue a catalog for download.
    pub async fn process(&self, digest: ChunkDigest) -> crate::Result<()> {
        let tx = self.tx.as_ref().ok_or(crate::CacheError::Shutdown)?;
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        tx.send(digest)
            .await
            .map_err(|_| crate::CacheError::Shutdown)
    }

    /// Wait until every enqueued download (including downloads enqueued by
    /// listeners) has completed.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.shared.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting work and join the workers.
    pub async fn shutdown(mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
    }
}

impl Shared {
    async fn process(&self, digest: ChunkDigest) {
        match self.fetcher.fetch(&digest).await {
            Ok(db_path) => {
                let result = CatalogDownloadResult { digest, db_path };
                for listener in &self.listeners {
                    listener(&result);
                }
            }
            Err(err) => {
                tracing::error!(digest = %digest, error = %err, "catalog download failed");
            }
        }
        // Decrement after the callbacks: a listener may have enqueued more
        // work that must keep wait_idle() blocked.
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct StubFetcher;

    #[async_trait]
    impl CatalogFetcher for StubFetcher {
        async fn fetch(&self, digest: &ChunkDigest) -> crate::Result<PathBuf> {
            Ok(PathBuf::from(format!("/cache/{}", digest.to_cache_path())))
        }
    }

    fn digest(n: u8) -> ChunkDigest {
        ChunkDigest::from_hex(&format!("{n:040x}")).unwrap()
    }

    #[tokio::test]
    async fn test_pool_processes_and_drains() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let mut pool = CatalogDownloadPool::new(Arc::new(StubFetcher));
        let seen_by_listener = seen.clone();
        pool.register_listener(move |result: &CatalogDownloadResult| {
            seen_by_listener.lock().unwrap().push(result.digest);
        });
        pool.spawn_workers(4);

        for n in 0..10 {
            pool.process(digest(n)).await.unwrap();
        }
        pool.wait_idle().await;

        assert_eq!(seen.lock().unwrap().len(), 10);
        assert_eq!(pool.shared.in_flight.load(Ordering::Acquire), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_idle_on_empty_pool_returns() {
        let mut pool = CatalogDownloadPool::new(Arc::new(StubFetcher));
        pool.spawn_workers(2);
        pool.wait_idle().await;
        pool.shutdown().await;
    }
}
