//! Gateway client configuration types.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default directory holding per-repository client configuration.
pub const DEFAULT_CONFIG_DIR: &str = "/etc/strata/gateway-client";

/// Per-repository gateway client configuration.
///
/// Loaded from `<config-dir>/<repo>/config.toml` merged with `STRATA_*`
/// environment variables; command-line options override both.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Gateway base URL (e.g. "http://gw.example.org:4929/api/v1").
    pub gateway_url: Option<String>,
    /// Stratum-0 base URL serving the repository manifest.
    pub stratum0: Option<String>,
    /// Path to the gateway key file; defaults to `gatewaykey` next to the
    /// config file.
    pub key_path: Option<PathBuf>,
}

impl ClientConfig {
    /// Location of the config file for a repository.
    pub fn config_file(config_dir: &Path, repo_name: &str) -> PathBuf {
        config_dir.join(repo_name).join("config.toml")
    }

    /// Default key file location for a repository.
    pub fn default_key_path(config_dir: &Path, repo_name: &str) -> PathBuf {
        config_dir.join(repo_name).join("gatewaykey")
    }
}

/// API key credentials for the gateway.
#[derive(Clone, Serialize, Deserialize)]
pub struct GatewayKey {
    pub id: String,
    pub secret: String,
}

impl GatewayKey {
    /// Parse the gateway key file format: `plain_text <key_id> <secret>`.
    pub fn parse(contents: &str) -> crate::Result<Self> {
        let mut fields = contents.split_whitespace();
        match (fields.next(), fields.next(), fields.next(), fields.next()) {
            (Some("plain_text"), Some(id), Some(secret), None) => Ok(Self {
                id: id.to_string(),
                secret: secret.to_string(),
            }),
            _ => Err(crate::Error::Config(
                "gateway key file must contain 'plain_text <key_id> <secret>'".to_string(),
            )),
        }
    }

    /// Load credentials from a key file.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            crate::Error::Config(format!("cannot read key file {}: {e}", path.display()))
        })?;
        Self::parse(&contents)
    }
}

impl std::fmt::Debug for GatewayKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayKey")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .finish()
    }
}
