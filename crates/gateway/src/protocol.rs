//! Wire types of the gateway HTTP API.

use serde::{Deserialize, Serialize};

/// Body of a lease acquisition request.
#[derive(Debug, Serialize)]
pub struct AcquireRequest {
    /// Free-form publisher metadata, forwarded verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Body of a commit request.
#[derive(Debug, Serialize, Deserialize)]
pub struct CommitRequest {
    pub old_root_hash: String,
    pub new_root_hash: String,
    pub priority: i64,
}

/// Generic gateway reply envelope.
#[derive(Debug, Deserialize)]
pub struct GatewayReply {
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub revision: Option<u64>,
    #[serde(default)]
    pub root_hash: Option<String>,
}

impl GatewayReply {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    pub fn is_busy(&self) -> bool {
        self.status == "path_busy"
    }

    pub fn reason(&self) -> String {
        self.reason.clone().unwrap_or_else(|| self.status.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_states() {
        let ok: GatewayReply = serde_json::from_str(
            r#"{"status":"ok","session_token":"t","revision":3,"root_hash":"aa"}"#,
        )
        .unwrap();
        assert!(ok.is_ok());
        assert_eq!(ok.revision, Some(3));

        let busy: GatewayReply = serde_json::from_str(r#"{"status":"path_busy"}"#).unwrap();
        assert!(busy.is_busy());

        let denied: GatewayReply =
            serde_json::from_str(r#"{"status":"error","reason":"invalid key"}"#).unwrap();
        assert!(!denied.is_ok());
        assert_eq!(denied.reason(), "invalid key");
    }

    #[test]
    fn test_acquire_request_omits_empty_metadata() {
        let body = serde_json::to_string(&AcquireRequest { metadata: None }).unwrap();
        assert_eq!(body, "{}");
    }
}
