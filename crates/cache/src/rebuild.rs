//! Rebuild the ledger from the cache directory contents.
//!
//! Used when the persisted table is empty (first run, or the database was
//! recreated after corruption) or when a rebuild is explicitly requested.
//! Catalog files are recognised through `cvmfs.checksum*` sidecars in the
//! cache directory; everything else becomes a regular entry. Access order
//! is approximated from file atimes.

use crate::error::Result;
use sqlx::{Pool, Sqlite};
use std::collections::HashSet;
use std::path::Path;
use std::time::UNIX_EPOCH;
use strata_core::ChunkDigest;

pub(crate) async fn rebuild_from_directory(pool: &Pool<Sqlite>, cache_dir: &Path) -> Result<()> {
    tracing::info!(dir = %cache_dir.display(), "re-building cache ledger from directory");

    sqlx::query("DELETE FROM cache_catalog").execute(pool).await?;
    sqlx::query("DELETE FROM fscache").execute(pool).await?;

    let catalogs = collect_catalog_digests(cache_dir)?;

    // Stage all data files into the temp table, keyed by digest.
    for prefix in 0x00..=0xffu32 {
        let subdir = cache_dir.join(format!("{prefix:02x}"));
        for entry in std::fs::read_dir(&subdir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let hex = format!("{prefix:02x}{}", entry.file_name().to_string_lossy());
            let Ok(digest) = ChunkDigest::from_hex(&hex) else {
                tracing::debug!(name = %hex, "skipping non-digest file in cache");
                continue;
            };
            let atime = metadata
                .accessed()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            sqlx::query("INSERT OR REPLACE INTO fscache (sha1, size, actime) VALUES (?, ?, ?)")
                .bind(digest.to_hex())
                .bind(metadata.len() as i64)
                .bind(atime as i64)
                .execute(pool)
                .await?;
        }
    }

    // Transfer in access order, handing out fresh sequence numbers.
    let staged: Vec<(String, i64)> =
        sqlx::query_as("SELECT sha1, size FROM fscache ORDER BY actime")
            .fetch_all(pool)
            .await?;
    for (seq, (sha1, size)) in staged.into_iter().enumerate() {
        let kind = if catalogs.contains(&sha1) { 1i64 } else { 0i64 };
        sqlx::query(
            "INSERT INTO cache_catalog (sha1, size, acseq, path, type, pinned) \
             VALUES (?, ?, ?, 'unknown (automatic rebuild)', ?, 0)",
        )
        .bind(&sha1)
        .bind(size)
        .bind(seq as i64)
        .bind(kind)
        .execute(pool)
        .await?;
    }

    sqlx::query("DELETE FROM fscache").execute(pool).await?;
    Ok(())
}

/// Digests named by `cvmfs.checksum*` sidecar files (loaded catalogs).
fn collect_catalog_digests(cache_dir: &Path) -> Result<HashSet<String>> {
    let mut catalogs = HashSet::new();
    for entry in std::fs::read_dir(cache_dir)? {
        let entry = entry?;
        if !entry.metadata()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if !name
            .to_string_lossy()
            .starts_with(crate::CHECKSUM_SIDECAR_PREFIX)
        {
            continue;
        }
        let contents = std::fs::read_to_string(entry.path())?;
        if let Some(head) = contents.get(..40)
            && ChunkDigest::from_hex(head).is_ok()
        {
            tracing::debug!(digest = head, "catalog digest from checksum sidecar");
            catalogs.insert(head.to_string());
        }
    }
    Ok(catalogs)
}
