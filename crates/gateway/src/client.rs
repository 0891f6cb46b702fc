//! The gateway HTTP client.

use crate::error::{GatewayError, Result};
use crate::protocol::{AcquireRequest, CommitRequest, GatewayReply};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{Duration, Instant};
use strata_core::config::GatewayKey;

type HmacSha256 = Hmac<Sha256>;

/// How lease-busy and transport errors are retried.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Fixed wait between attempts.
    pub interval: Duration,
    /// Give up once this instant has passed; `None` retries indefinitely.
    /// A deadline already in the past means a single attempt.
    pub deadline: Option<Instant>,
}

impl RetryPolicy {
    pub fn indefinite(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
        }
    }

    pub fn until(interval: Duration, deadline: Instant) -> Self {
        Self {
            interval,
            deadline: Some(deadline),
        }
    }

    fn expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// A successfully acquired lease.
#[derive(Clone, Debug)]
pub struct LeaseGrant {
    pub session_token: String,
    /// Revision the gateway currently serves; 0 when not reported.
    pub revision: u64,
    /// Root hash the gateway currently serves; empty when not reported.
    pub root_hash: String,
}

/// Outcome of a refresh attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    /// The gateway answered "Method Not Allowed": it predates lease
    /// refresh. Callers treat this as refreshed to avoid log spam.
    NotSupported,
}

/// Client for one gateway endpoint, authenticated with an API key.
///
/// Requests carry `Authorization: <key_id> <hex hmac-sha256(body)>`.
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
    key: GatewayKey,
}

impl GatewayClient {
    pub fn new(base_url: &str, key: GatewayKey) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            key,
        }
    }

    fn auth_header(&self, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.key.secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(body.as_bytes());
        let tag: String = mac
            .finalize()
            .into_bytes()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        format!("{} {tag}", self.key.id)
    }

    async fn post_json(&self, url: &str, body: String) -> Result<GatewayReply> {
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header(&body))
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await?;
        Ok(response.json().await?)
    }

    /// Acquire an exclusive lease on `repo_path` (`<repo><lease path>`).
    ///
    /// Busy replies and transport errors are retried on the given policy.
    pub async fn acquire(
        &self,
        repo_path: &str,
        metadata: Option<serde_json::Value>,
        retry: RetryPolicy,
    ) -> Result<LeaseGrant> {
        loop {
            match self.acquire_once(repo_path, metadata.clone()).await {
                Ok(grant) => return Ok(grant),
                Err(err @ (GatewayError::LeaseBusy | GatewayError::Transport(_)))
                    if !retry.expired() =>
                {
                    tracing::warn!(
                        error = %err,
                        retry_secs = retry.interval.as_secs(),
                        "lease not acquired, retrying"
                    );
                    tokio::time::sleep(retry.interval).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn acquire_once(
        &self,
        repo_path: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<LeaseGrant> {
        let url = format!("{}/leases/{}", self.base_url, repo_path.trim_start_matches('/'));
        let body = serde_json::to_string(&AcquireRequest { metadata })
            .expect("acquire request always serializes");
        let reply = self.post_json(&url, body).await?;

        if reply.is_busy() {
            return Err(GatewayError::LeaseBusy);
        }
        if !reply.is_ok() {
            return Err(GatewayError::LeaseDenied(reply.reason()));
        }
        let session_token = reply
            .session_token
            .ok_or_else(|| GatewayError::Protocol("ok reply without session token".into()))?;
        Ok(LeaseGrant {
            session_token,
            revision: reply.revision.unwrap_or(0),
            root_hash: reply.root_hash.unwrap_or_default(),
        })
    }

    /// Refresh the lease held by `session_token`.
    pub async fn refresh(&self, session_token: &str) -> Result<RefreshOutcome> {
        let url = format!("{}/leases/{session_token}", self.base_url);
        let response = self
            .http
            .patch(&url)
            .header("Authorization", self.auth_header(""))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED {
            return Ok(RefreshOutcome::NotSupported);
        }
        let reply: GatewayReply = response.json().await?;
        if reply.is_ok() {
            Ok(RefreshOutcome::Refreshed)
        } else {
            Err(GatewayError::Protocol(format!(
                "lease refresh failed: {}",
                reply.reason()
            )))
        }
    }

    /// Drop the lease held by `session_token`.
    pub async fn cancel(&self, session_token: &str) -> Result<()> {
        let url = format!("{}/leases/{session_token}", self.base_url);
        let response = self
            .http
            .delete(&url)
            .header("Authorization", self.auth_header(""))
            .send()
            .await?;
        let reply: GatewayReply = response.json().await?;
        if reply.is_ok() {
            Ok(())
        } else {
            Err(GatewayError::Protocol(format!(
                "lease cancellation failed: {}",
                reply.reason()
            )))
        }
    }

    /// Publish the transaction: the gateway advances the repository from
    /// `old_root_hash` to `new_root_hash`.
    pub async fn commit(
        &self,
        session_token: &str,
        old_root_hash: &str,
        new_root_hash: &str,
        priority: i64,
    ) -> Result<()> {
        let url = format!("{}/commit", self.base_url);
        let body = serde_json::to_string(&CommitRequest {
            old_root_hash: old_root_hash.to_string(),
            new_root_hash: new_root_hash.to_string(),
            priority,
        })
        .expect("commit request always serializes");
        let response = self
            .http
            .post(&url)
            .header("Authorization", self.auth_header(&body))
            .header("Content-Type", "application/json")
            .header("Session-Token", session_token)
            .body(body)
            .send()
            .await?;
        let reply: GatewayReply = response.json().await?;
        if reply.is_ok() {
            Ok(())
        } else {
            Err(GatewayError::LeaseDenied(format!(
                "commit rejected: {}",
                reply.reason()
            )))
        }
    }
}
