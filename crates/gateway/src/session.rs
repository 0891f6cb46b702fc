//! Lease session lifecycle: background refresh and idempotent cancellation.

use crate::client::{GatewayClient, RefreshOutcome};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Shared cancellation state, usable from the session, the signal task,
/// and error paths alike. Cancelling is idempotent: the gateway sees at
/// most one DELETE.
#[derive(Clone)]
pub struct CancelHandle {
    client: Arc<GatewayClient>,
    token: String,
    token_file: Option<PathBuf>,
    cancelled: Arc<AtomicBool>,
    stop_refresh: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Cancel the lease and remove the session-token file.
    pub async fn cancel(&self) {
        self.stop_refresh.store(true, Ordering::Release);
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.client.cancel(&self.token).await {
            Ok(()) => tracing::info!("lease cancelled"),
            Err(err) => tracing::error!(error = %err, "lease cancellation failed"),
        }
        if let Some(file) = &self.token_file {
            let _ = std::fs::remove_file(file);
        }
    }
}

/// An acquired lease together with its refresh actor.
pub struct LeaseSession {
    handle: CancelHandle,
    refresh_task: Option<JoinHandle<()>>,
}

impl LeaseSession {
    pub fn new(
        client: Arc<GatewayClient>,
        token: String,
        token_file: Option<PathBuf>,
    ) -> Self {
        Self {
            handle: CancelHandle {
                client,
                token,
                token_file,
                cancelled: Arc::new(AtomicBool::new(false)),
                stop_refresh: Arc::new(AtomicBool::new(false)),
            },
            refresh_task: None,
        }
    }

    pub fn token(&self) -> &str {
        &self.handle.token
    }

    /// A cheap handle for signal handlers and error paths.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    /// Start the refresh actor: poll every two seconds, refresh once the
    /// lease is ninety seconds old.
    pub fn spawn_refresh(&mut self) {
        assert!(self.refresh_task.is_none(), "refresh actor already running");
        let client = self.handle.client.clone();
        let token = self.handle.token.clone();
        let stop = self.handle.stop_refresh.clone();
        self.refresh_task = Some(tokio::spawn(async move {
            let mut last_refresh = Instant::now();
            loop {
                tokio::time::sleep(Duration::from_secs(crate::REFRESH_POLL_INTERVAL_SECS)).await;
                if stop.load(Ordering::Acquire) {
                    break;
                }
                if last_refresh.elapsed()
                    < Duration::from_secs(crate::LEASE_REFRESH_INTERVAL_SECS)
                {
                    continue;
                }
                match client.refresh(&token).await {
                    Ok(RefreshOutcome::Refreshed) => {
                        tracing::debug!("lease refreshed");
                        last_refresh = Instant::now();
                    }
                    Ok(RefreshOutcome::NotSupported) => {
                        tracing::warn!("this gateway does not support lease refresh");
                        // pretend it worked so we do not retry every poll
                        last_refresh = Instant::now();
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "lease refresh failed");
                    }
                }
            }
        }));
    }

    /// Cancel the lease (idempotent) and join the refresh actor.
    pub async fn cancel(mut self) {
        self.handle.cancel().await;
        self.join_refresh().await;
    }

    /// Successful end of session: the lease was consumed by the commit, so
    /// only stop refreshing and drop the token file.
    pub async fn finish(mut self) {
        self.handle.stop_refresh.store(true, Ordering::Release);
        self.handle.cancelled.store(true, Ordering::Release);
        if let Some(file) = &self.handle.token_file {
            let _ = std::fs::remove_file(file);
        }
        self.join_refresh().await;
    }

    async fn join_refresh(&mut self) {
        if let Some(task) = self.refresh_task.take() {
            let _ = task.await;
        }
    }
}

/// Cancel the lease and exit on SIGINT, SIGTERM, or SIGABRT.
///
/// The catalog machinery asserts liberally; catching SIGABRT keeps an
/// aborted publish from leaving a dangling lease behind.
pub fn install_signal_handlers(handle: CancelHandle) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigabrt = signal(SignalKind::from_raw(libc::SIGABRT))?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
            _ = sigabrt.recv() => {}
        }
        tracing::info!("signal received, cancelling lease");
        handle.cancel().await;
        std::process::exit(1);
    }))
}
