//! Fetch the published manifest from stratum 0.

use crate::error::{GatewayError, Result};
use strata_core::{MANIFEST_NAME, Manifest};

/// Download and parse `.cvmfspublished` for a repository.
///
/// `stratum0` is the repository base URL. When the manifest names its
/// repository, it must match `repo_name`.
pub async fn fetch_manifest(stratum0: &str, repo_name: &str) -> Result<Manifest> {
    let url = format!("{}/{MANIFEST_NAME}", stratum0.trim_end_matches('/'));
    let response = reqwest::get(&url).await?;
    if !response.status().is_success() {
        return Err(GatewayError::Protocol(format!(
            "manifest fetch failed with HTTP {} for {url}",
            response.status()
        )));
    }
    let body = response.text().await?;
    let manifest = Manifest::parse(&body)?;

    if let Some(name) = &manifest.repository_name
        && name != repo_name
    {
        return Err(GatewayError::Protocol(format!(
            "manifest belongs to repository {name}, expected {repo_name}"
        )));
    }
    Ok(manifest)
}
