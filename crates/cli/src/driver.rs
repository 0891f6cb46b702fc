//! Orchestration of one graft run: configuration, lease, read, plan,
//! apply, commit, release.

use crate::Args;
use anyhow::{Context, Result, bail};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use strata_core::config::{ClientConfig, DEFAULT_CONFIG_DIR, GatewayKey};
use strata_core::{Manifest, path};
use strata_gateway::{
    DEFAULT_LEASE_BUSY_RETRY_SECS, GATEWAY_METADATA_ENV, GatewayClient, LeaseSession, RetryPolicy,
    fetch_manifest, install_signal_handlers,
};
use strata_graft::{
    CatalogManager, Changeset, ChangesetPlanner, GraftDb, SqliteCatalogStore, db,
};

pub async fn run(args: Args) -> Result<()> {
    let Some(repo_name) = args.repo_name.clone() else {
        bail!("-N <repository name> is required");
    };
    let Some(input) = args.input.clone() else {
        bail!("-D <graft database> is required");
    };

    let db_files = collect_db_files(&input)?;
    if db_files.is_empty() {
        tracing::info!("no graft databases found, nothing to do");
        return Ok(());
    }

    if args.check_completed_graft {
        if db_files.len() != 1 {
            bail!("-Z requires a single database file");
        }
        if db::is_marked_complete(&db_files[0]).await {
            tracing::info!("database is already marked completed_graft");
            return Ok(());
        }
        tracing::info!("database is not marked completed_graft");
    }

    let temp_dir = match args.temp_dir.clone() {
        Some(dir) => dir,
        None => match std::env::var_os("TMPDIR") {
            Some(dir) => PathBuf::from(dir),
            None => bail!("-t or TMPDIR required"),
        },
    };

    // Command line beats config file beats STRATA_ environment.
    let config_dir = args
        .config_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR));
    let config: ClientConfig = Figment::new()
        .merge(Toml::file(ClientConfig::config_file(&config_dir, &repo_name)))
        .merge(Env::prefixed("STRATA_").split("__"))
        .extract()
        .context("failed to load client configuration")?;

    let gateway_url = args
        .gateway_url
        .clone()
        .or(config.gateway_url)
        .context("gateway URL not given (-g) and not configured")?;
    let stratum0 = args
        .stratum0
        .clone()
        .or(config.stratum0)
        .context("stratum-0 URL not given (-w) and not configured")?;
    let key_path = args
        .key_file
        .clone()
        .or(config.key_path)
        .unwrap_or_else(|| ClientConfig::default_key_path(&config_dir, &repo_name));
    let key = GatewayKey::load(&key_path)?;

    let allow_deletions = args.allow_deletions;
    let allow_additions = !allow_deletions || args.allow_additions;

    // Prefix applied to the lease and every grafted path.
    let prefix = match args.additional_prefix.as_deref() {
        None => String::new(),
        Some(raw) => {
            let clean = path::sanitise_name(raw)?;
            tracing::info!(prefix = %clean, "adding prefix to lease and all paths");
            format!("{clean}/")
        }
    };

    let mut dbs = Vec::with_capacity(db_files.len());
    for file in &db_files {
        dbs.push(
            GraftDb::open(file)
                .await
                .with_context(|| format!("cannot open graft database {}", file.display()))?,
        );
    }

    // Lease path: explicit, or the longest common prefix of everything the
    // databases touch.
    let lease_rel = match args.lease_path.as_deref() {
        Some(lease) => lease.trim_matches('/').to_string(),
        None => {
            let mut affected = Vec::new();
            for graft_db in &dbs {
                affected.extend(
                    graft_db
                        .affected_dirs(allow_additions, allow_deletions)
                        .await?,
                );
            }
            if affected.is_empty() {
                tracing::info!("databases are empty, nothing to do");
                return Ok(());
            }
            let lease = path::lease_path_from(&affected);
            lease.trim_matches('/').to_string()
        }
    };
    let lease_rel = join_prefix(&prefix, &lease_rel);
    let lease_abs = format!("/{lease_rel}");
    tracing::info!(lease = %lease_abs, "lease path");

    if args.force_cancel_lease {
        tracing::warn!("-x given, but the gateway protocol has no forced lease drop; will retry");
    }

    // Acquire the lease and persist the session token for out-of-band
    // inspection and cleanup.
    let client = Arc::new(GatewayClient::new(&gateway_url, key));
    let retry = RetryPolicy::indefinite(Duration::from_secs(
        args.retry_interval.unwrap_or(DEFAULT_LEASE_BUSY_RETRY_SECS),
    ));
    tracing::info!(lease = %lease_abs, "acquiring gateway lease");
    let grant = client
        .acquire(
            &format!("{repo_name}{lease_abs}"),
            gateway_metadata(),
            retry,
        )
        .await?;

    let token_file = write_token_file(&temp_dir, &grant.session_token)?;
    let mut session = LeaseSession::new(
        client.clone(),
        grant.session_token.clone(),
        Some(token_file),
    );
    session.spawn_refresh();
    install_signal_handlers(session.cancel_handle())?;

    let outcome = graft_transaction(
        &args,
        &client,
        &session,
        &repo_name,
        &stratum0,
        &temp_dir,
        &dbs,
        &lease_rel,
        &prefix,
        grant.revision,
        &grant.root_hash,
        allow_additions,
        allow_deletions,
    )
    .await;

    match outcome {
        Ok(()) => {
            session.finish().await;
            if args.check_completed_graft {
                db::mark_complete(&db_files[0]).await?;
            }
            Ok(())
        }
        Err(err) => {
            // The lease is released on every non-success path.
            session.cancel().await;
            Err(err)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn graft_transaction(
    args: &Args,
    client: &GatewayClient,
    session: &LeaseSession,
    repo_name: &str,
    stratum0: &str,
    temp_dir: &Path,
    dbs: &[GraftDb],
    lease_rel: &str,
    prefix: &str,
    gateway_revision: u64,
    gateway_root_hash: &str,
    allow_additions: bool,
    allow_deletions: bool,
) -> Result<()> {
    let mut manifest = fetch_manifest(stratum0, repo_name).await?;
    reconcile_revision(&mut manifest, gateway_revision, gateway_root_hash)?;
    let old_root_hash = manifest.catalog_hash.clone();
    tracing::info!(old_root_hash = %old_root_hash, "starting from published root");

    let store = SqliteCatalogStore::open(temp_dir.join("strata-catalog.db")).await?;

    let mut changeset = Changeset::default();
    for graft_db in dbs {
        graft_db.load_dirs(lease_rel, prefix, &mut changeset).await?;
    }
    tracing::info!(lease = %lease_rel, "precaching existing directories");
    let dir_paths: Vec<String> = changeset.dirs.keys().cloned().collect();
    store.precache(lease_rel, &dir_paths).await?;
    for graft_db in dbs {
        graft_db
            .load_files(lease_rel, prefix, &mut changeset)
            .await?;
        graft_db
            .load_symlinks(lease_rel, prefix, &mut changeset)
            .await?;
    }

    let planner = ChangesetPlanner::new(&store, args.create_missing_catalogs);
    if allow_deletions {
        tracing::info!("processing deletions");
        for graft_db in dbs {
            let deletions = graft_db.load_deletions(lease_rel, prefix).await?;
            planner.apply_deletions(&deletions).await?;
        }
    }
    if allow_additions {
        tracing::info!("processing additions");
        planner.apply_additions(&changeset, lease_rel).await?;
    }

    tracing::info!("committing changes");
    let new_root_hash = store.commit().await?;
    tracing::info!("waiting for all uploads to finish");
    store.wait_for_uploads().await?;

    let priority = args.priority.unwrap_or_else(|| {
        -time::OffsetDateTime::now_utc().unix_timestamp()
    });
    tracing::info!(priority, new_root_hash = %new_root_hash, "committing on gateway");
    client
        .commit(session.token(), &old_root_hash, &new_root_hash, priority)
        .await?;
    Ok(())
}

/// Reconcile the gateway-reported repository state with the published
/// manifest: equal revisions must agree on the root hash, a newer gateway
/// wins, an older gateway is only logged.
fn reconcile_revision(
    manifest: &mut Manifest,
    gateway_revision: u64,
    gateway_root_hash: &str,
) -> Result<()> {
    if gateway_revision == 0 {
        tracing::info!("gateway has not supplied a revision, using the published manifest");
        return Ok(());
    }
    if gateway_revision == manifest.revision {
        if gateway_root_hash != manifest.catalog_hash {
            bail!(
                "revision {} root hash mismatch between manifest and gateway ({} != {})",
                gateway_revision,
                manifest.catalog_hash,
                gateway_root_hash
            );
        }
        tracing::info!(revision = gateway_revision, "gateway and manifest agree");
    } else if gateway_revision > manifest.revision {
        tracing::info!(
            gateway = gateway_revision,
            manifest = manifest.revision,
            "gateway supplied a newer revision than the published manifest"
        );
        manifest.revision = gateway_revision;
        manifest.catalog_hash = gateway_root_hash.to_string();
    } else {
        tracing::info!(
            gateway = gateway_revision,
            manifest = manifest.revision,
            "gateway supplied an older revision than the published manifest"
        );
    }
    Ok(())
}

/// Optional acquire payload from the environment; a value that is not
/// valid JSON is forwarded as a plain string.
fn gateway_metadata() -> Option<serde_json::Value> {
    let raw = std::env::var(GATEWAY_METADATA_ENV).ok()?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(_) => Some(serde_json::Value::String(raw)),
    }
}

/// Resolve `-D`: a single database file, or a directory scanned for `*.db`.
fn collect_db_files(input: &Path) -> Result<Vec<PathBuf>> {
    let metadata = std::fs::metadata(input)
        .with_context(|| format!("cannot stat {}", input.display()))?;
    if !metadata.is_dir() {
        return Ok(vec![input.to_path_buf()]);
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(input)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "db"))
        .collect();
    files.sort();
    Ok(files)
}

/// Combine the sanitised additional prefix (`"pre/"` or empty) with a
/// relative lease path.
fn join_prefix(prefix: &str, lease_rel: &str) -> String {
    if prefix.is_empty() {
        lease_rel.to_string()
    } else if lease_rel.is_empty() {
        prefix.trim_end_matches('/').to_string()
    } else {
        format!("{prefix}{lease_rel}")
    }
}

/// Persist the session token next to the scratch data, for manual cleanup
/// when a run dies hard.
fn write_token_file(temp_dir: &Path, token: &str) -> Result<PathBuf> {
    let mut file = tempfile::Builder::new()
        .prefix("gateway_session_token_")
        .tempfile_in(temp_dir)
        .context("failed to create session token file")?;
    file.write_all(token.as_bytes())?;
    let (_, token_path) = file.keep().context("failed to persist session token file")?;
    Ok(token_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_collect_db_files_scans_directories() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.db"), b"").unwrap();
        std::fs::write(dir.path().join("a.db"), b"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();

        let files = collect_db_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.db", "b.db"]);
    }

    #[test]
    fn test_collect_db_files_accepts_single_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("one.db");
        std::fs::write(&file, b"").unwrap();
        assert_eq!(collect_db_files(&file).unwrap(), vec![file]);
    }

    #[test]
    fn test_join_prefix() {
        assert_eq!(join_prefix("", "a/b"), "a/b");
        assert_eq!(join_prefix("pre/", "a/b"), "pre/a/b");
        assert_eq!(join_prefix("pre/", ""), "pre");
        assert_eq!(join_prefix("", ""), "");
    }

    #[test]
    fn test_reconcile_revision_rules() {
        let mut manifest = Manifest::parse(
            "Caabb\nRd41d8cd98f00b204e9800998ecf8427e\nD240\nS10\n",
        )
        .unwrap();

        // agreeing revision
        reconcile_revision(&mut manifest, 10, "aabb").unwrap();
        assert_eq!(manifest.revision, 10);

        // conflicting hash at the same revision is fatal
        assert!(reconcile_revision(&mut manifest, 10, "ccdd").is_err());

        // newer gateway adopts gateway values
        reconcile_revision(&mut manifest, 12, "ccdd").unwrap();
        assert_eq!(manifest.revision, 12);
        assert_eq!(manifest.catalog_hash, "ccdd");

        // older gateway only logs
        reconcile_revision(&mut manifest, 11, "eeff").unwrap();
        assert_eq!(manifest.revision, 12);

        // absent revision keeps the manifest
        reconcile_revision(&mut manifest, 0, "").unwrap();
        assert_eq!(manifest.revision, 12);
    }

    #[test]
    fn test_write_token_file_persists_token() {
        let dir = TempDir::new().unwrap();
        let token_path = write_token_file(dir.path(), "tok-42").unwrap();
        assert_eq!(std::fs::read_to_string(&token_path).unwrap(), "tok-42");
        assert!(
            token_path
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("gateway_session_token_")
        );
    }
}
