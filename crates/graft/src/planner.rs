//! Changeset planner: ordered application of deletions and additions.
//!
//! Deletions run first, children before parents (descending path length).
//! Additions build one ancestor-closed path tree over all directories and
//! file/symlink parents, then traverse it depth-first: directories are
//! ensured in pre-order, content is added and nested catalogs are
//! snapshotted in post-order.

use crate::catalog::{CatalogManager, EntryKind};
use crate::error::{GraftError, Result};
use crate::model::{Changeset, Compression, Deletion, Directory, File, FileChunk, Symlink};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use strata_core::path::parent;
use strata_core::{ChunkDigest, EMPTY_FILE_DIGEST, NESTED_CATALOG_MARKER};

/// Applies changesets to a writable catalog.
pub struct ChangesetPlanner<'a> {
    catalog: &'a dyn CatalogManager,
    /// Create nested catalogs for existing directories that lack one.
    add_missing_nested: bool,
}

/// Progress cadence: report every `10^k` rows, with the smallest `k` that
/// keeps the number of reports at or below fifty.
fn progress_interval(total: usize) -> usize {
    let mut base = 1;
    while base * 50 < total {
        base *= 10;
    }
    base
}

fn show_progress(what: &str, every: usize, current: usize, total: usize) {
    if current % every == 0 || current == total {
        tracing::info!("processed {current}/{total} {what}");
    }
}

impl<'a> ChangesetPlanner<'a> {
    pub fn new(catalog: &'a dyn CatalogManager, add_missing_nested: bool) -> Self {
        Self {
            catalog,
            add_missing_nested,
        }
    }

    /// Apply typed deletions, already ordered children before parents.
    ///
    /// A deletion whose declared type does not match the catalog entry is
    /// skipped and logged, as is a deletion of a non-existent path.
    pub async fn apply_deletions(&self, deletions: &[Deletion]) -> Result<()> {
        let total = deletions.len();
        let every = progress_interval(total);
        for (row, deletion) in deletions.iter().enumerate() {
            match self.catalog.lookup(&deletion.name).await? {
                None => {
                    tracing::debug!(path = %deletion.name, "not removing non-existent entry");
                }
                Some(entry) => {
                    let type_matches = match entry.kind {
                        EntryKind::Directory { .. } => deletion.directory,
                        EntryKind::File => deletion.file,
                        EntryKind::Symlink => deletion.link,
                    };
                    if !type_matches {
                        tracing::debug!(
                            path = %deletion.name,
                            declared_dir = deletion.directory,
                            declared_file = deletion.file,
                            declared_link = deletion.link,
                            actual = ?entry.kind,
                            "deletion type mismatch, not deleting"
                        );
                    } else if entry.kind.is_directory() {
                        self.delete_directory(deletion.name.clone()).await?;
                    } else {
                        tracing::debug!(path = %deletion.name, "removing file/link");
                        self.catalog.remove_file(&deletion.name).await?;
                    }
                }
            }
            show_progress("deletions", every, row + 1, total);
        }
        Ok(())
    }

    /// Recursive directory removal. Nested catalog mountpoints are detached
    /// whole; plain directories are emptied bottom-up first.
    fn delete_directory(
        &self,
        dir_path: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.catalog.is_transition_point(&dir_path).await? {
                tracing::debug!(path = %dir_path, "removing nested catalog");
                self.catalog.remove_nested_catalog(&dir_path).await?;
            } else {
                for child in self.catalog.listing(&dir_path).await? {
                    let child_path = format!("{dir_path}/{}", child.name);
                    if child.kind.is_directory() {
                        tracing::debug!(path = %child_path, "recursing into directory");
                        self.delete_directory(child_path).await?;
                    } else {
                        self.catalog.remove_file(&child_path).await?;
                    }
                }
            }
            tracing::debug!(path = %dir_path, "removing directory");
            self.catalog.remove_directory(&dir_path).await
        })
    }

    /// Apply all additions of the changeset below the lease path.
    pub async fn apply_additions(&self, changeset: &Changeset, lease_path: &str) -> Result<()> {
        // Ancestor-closed tree over everything the changeset touches.
        let mut tree: HashMap<String, BTreeSet<String>> = HashMap::new();
        for dir_path in changeset.dirs.keys() {
            add_to_tree(&mut tree, dir_path, lease_path);
        }
        for parent_path in changeset.files.keys() {
            add_to_tree(&mut tree, parent_path, lease_path);
        }
        for parent_path in changeset.symlinks.keys() {
            add_to_tree(&mut tree, parent_path, lease_path);
        }

        let total = tree.len();
        let every = progress_interval(total);
        tracing::info!(
            dirs = tree.len(),
            files = changeset.file_count(),
            symlinks = changeset.symlink_count(),
            "applying changeset"
        );

        // The roots are the nodes whose parent is outside the tree; a well
        // formed changeset has exactly one.
        let mut stack: Vec<String> = Vec::new();
        for node in tree.keys() {
            if node.is_empty() || !tree.contains_key(parent(node)) {
                if !stack.is_empty() {
                    return Err(GraftError::InputInvalid(
                        "input databases form more than one path tree".to_string(),
                    ));
                }
                stack.push(node.clone());
            }
        }

        let mut visited: HashSet<String> = HashSet::new();
        let mut current_row = 0;
        while let Some(current) = stack.last().cloned() {
            if visited.contains(&current) {
                // post-order: content, then snapshot
                current_row += 1;
                if let Some(symlinks) = changeset.symlinks.get(&current) {
                    self.add_symlinks(symlinks).await?;
                }
                if let Some(files) = changeset.files.get(&current) {
                    self.add_files(files).await?;
                }
                let entry = self.catalog.lookup(&current).await?.ok_or_else(|| {
                    GraftError::Internal(format!("directory {current} vanished during traversal"))
                })?;
                if matches!(entry.kind, EntryKind::Directory { mountpoint: true }) {
                    self.catalog.snapshot_catalog(&current).await?;
                }
                stack.pop();
                show_progress("directories", every, current_row, total);
            } else {
                visited.insert(current.clone());
                if let Some(children) = tree.remove(&current) {
                    stack.extend(children);
                }
                if let Some(dir) = changeset.dirs.get(&current) {
                    // pre-order: the directory itself
                    self.ensure_directory(dir).await?;
                }
            }
        }

        if !tree.is_empty() {
            return Err(GraftError::Internal(
                "not all directories were processed, malformed input databases".to_string(),
            ));
        }
        Ok(())
    }

    async fn ensure_directory(&self, dir: &Directory) -> Result<()> {
        let existing = self.catalog.lookup(&dir.name).await?;
        if let Some(entry) = &existing
            && !entry.kind.is_directory()
        {
            return Err(GraftError::CatalogConflict(format!(
                "refusing to replace existing file/symlink at {} with a directory",
                dir.name
            )));
        }

        let mut add_nested = false;
        match existing {
            Some(entry) => {
                self.catalog.touch_directory(dir).await?;
                let already_mountpoint =
                    matches!(entry.kind, EntryKind::Directory { mountpoint: true });
                if !already_mountpoint && (self.add_missing_nested || dir.nested) {
                    add_nested = true;
                    tracing::debug!(path = %dir.name, "touching directory, adding nested catalog");
                } else {
                    tracing::debug!(path = %dir.name, "touching directory");
                }
            }
            None => {
                tracing::debug!(path = %dir.name, "adding directory");
                self.catalog.add_directory(dir).await?;
                if dir.nested {
                    add_nested = true;
                }
            }
        }

        if add_nested {
            // The marker file keeps manual changes from dropping the
            // nested catalog.
            let marker = File {
                name: format!("{}/{}", dir.name, NESTED_CATALOG_MARKER),
                mtime_ns: dir.mtime_ns,
                size: 0,
                owner: 0,
                group: 0,
                mode: 0o666,
                internal: true,
                compression: Compression::Default,
                chunks: vec![FileChunk {
                    digest: ChunkDigest::from_hex(EMPTY_FILE_DIGEST)?,
                    offset: 0,
                    size: 0,
                }],
            };
            tracing::debug!(path = %dir.name, "placing nested catalog marker");
            self.catalog.add_file(&marker).await?;
            tracing::debug!(path = %dir.name, "creating nested catalog");
            self.catalog.create_nested_catalog(&dir.name).await?;
        }
        Ok(())
    }

    async fn add_files(&self, files: &[File]) -> Result<()> {
        for file in files {
            if let Some(entry) = self.catalog.lookup(&file.name).await? {
                if entry.kind != EntryKind::File {
                    return Err(GraftError::CatalogConflict(format!(
                        "refusing to replace existing dir/symlink at {} with a file",
                        file.name
                    )));
                }
                tracing::debug!(path = %file.name, "removing existing file");
                self.catalog.remove_file(&file.name).await?;
            }
            tracing::debug!(path = %file.name, "adding chunked file");
            self.catalog.add_file(file).await?;
        }
        Ok(())
    }

    async fn add_symlinks(&self, symlinks: &[Symlink]) -> Result<()> {
        for symlink in symlinks {
            let mut noop = false;
            if let Some(entry) = self.catalog.lookup(&symlink.name).await? {
                if symlink.skip_if_file_or_dir {
                    match entry.kind {
                        EntryKind::Directory { .. } | EntryKind::File => {
                            tracing::debug!(
                                path = %symlink.name,
                                "file or directory exists, skipping symlink creation"
                            );
                            noop = true;
                        }
                        EntryKind::Symlink => {
                            tracing::debug!(path = %symlink.name, "removing existing symlink");
                            self.catalog.remove_file(&symlink.name).await?;
                        }
                    }
                } else {
                    if entry.kind.is_directory() {
                        return Err(GraftError::CatalogConflict(format!(
                            "not removing directory {} to create a symlink",
                            symlink.name
                        )));
                    }
                    tracing::debug!(path = %symlink.name, "removing existing file/symlink");
                    self.catalog.remove_file(&symlink.name).await?;
                }
            }
            if !noop {
                tracing::debug!(path = %symlink.name, target = %symlink.target, "adding symlink");
                self.catalog.add_symlink(symlink).await?;
            }
        }
        Ok(())
    }
}

/// Insert a path and its ancestors into the tree, stopping at the lease
/// path or an already-linked ancestor.
fn add_to_tree(tree: &mut HashMap<String, BTreeSet<String>>, dir_path: &str, lease_path: &str) {
    tree.entry(dir_path.to_string()).or_default();
    let mut current = dir_path.to_string();
    loop {
        let parent_path = parent(&current).to_string();
        if current == parent_path || current == lease_path {
            break;
        }
        if !tree
            .entry(parent_path.clone())
            .or_default()
            .insert(current.clone())
        {
            break;
        }
        current = parent_path;
    }
}
