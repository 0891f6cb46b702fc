//! Integration tests for the changeset planner against the local catalog
//! store.

mod common;

use common::{GraftDbBuilder, digest_hex, fresh_store, load_changeset};
use strata_graft::{
    CatalogManager, Changeset, ChangesetPlanner, Compression, Deletion, Directory, EntryKind,
    GraftError,
};
use tempfile::TempDir;

fn make_dir(name: &str, nested: bool) -> Directory {
    Directory {
        name: name.to_string(),
        mtime_ns: 1_700_000_000_000_000_000,
        mode: 0o755,
        owner: 0,
        group: 0,
        nested,
        xattrs: Default::default(),
    }
}

#[tokio::test]
async fn nested_catalog_is_created_with_marker_file() {
    let dir = TempDir::new().unwrap();
    let builder = GraftDbBuilder::new(&dir, "graft.db").await;
    builder.dir("a", 0).await;
    builder.dir("a/b", 1).await;
    builder.file("a/b/f", 10, &digest_hex(1), 1).await;

    let db = builder.open().await;
    let changeset = load_changeset(&db, "", "").await;
    let store = fresh_store(&dir).await;
    ChangesetPlanner::new(&store, false)
        .apply_additions(&changeset, "")
        .await
        .unwrap();

    let mountpoint = store.lookup("a/b").await.unwrap().unwrap();
    assert_eq!(mountpoint.kind, EntryKind::Directory { mountpoint: true });
    assert!(store.is_transition_point("a/b").await.unwrap());

    let marker = store.lookup("a/b/.cvmfscatalog").await.unwrap().unwrap();
    assert_eq!(marker.kind, EntryKind::File);
    assert_eq!(marker.size, 0);

    let file = store.lookup("a/b/f").await.unwrap().unwrap();
    assert_eq!(file.kind, EntryKind::File);
    assert_eq!(file.size, 10);

    // 'a' was not flagged nested
    let plain = store.lookup("a").await.unwrap().unwrap();
    assert_eq!(plain.kind, EntryKind::Directory { mountpoint: false });
}

#[tokio::test]
async fn deletion_type_mismatch_is_skipped() {
    let dir = TempDir::new().unwrap();
    let store = fresh_store(&dir).await;
    store.add_directory(&make_dir("a", false)).await.unwrap();

    let planner = ChangesetPlanner::new(&store, false);
    planner
        .apply_deletions(&[Deletion {
            name: "a".to_string(),
            directory: false,
            file: true,
            link: false,
        }])
        .await
        .unwrap();

    // the directory survives the mistyped deletion
    assert!(store.lookup("a").await.unwrap().is_some());
}

#[tokio::test]
async fn repeated_graft_yields_identical_root_hash() {
    let dir = TempDir::new().unwrap();
    let builder = GraftDbBuilder::new(&dir, "graft.db").await;
    builder.dir("top", 0).await;
    builder.dir("top/sub", 0).await;
    builder.file("top/sub/data", 100, &digest_hex(7), 1).await;
    builder.link("top/current", "sub", 0).await;

    let db = builder.open().await;
    let changeset = load_changeset(&db, "", "").await;
    let store = fresh_store(&dir).await;
    let planner = ChangesetPlanner::new(&store, false);

    planner.apply_additions(&changeset, "").await.unwrap();
    let first = store.commit().await.unwrap();

    planner.apply_additions(&changeset, "").await.unwrap();
    let second = store.commit().await.unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn recursive_deletion_removes_subtree() {
    let dir = TempDir::new().unwrap();
    let builder = GraftDbBuilder::new(&dir, "graft.db").await;
    builder.dir("a", 0).await;
    builder.dir("a/b", 0).await;
    builder.file("a/b/f1", 1, &digest_hex(1), 1).await;
    builder.file("a/f2", 1, &digest_hex(2), 1).await;

    let db = builder.open().await;
    let changeset = load_changeset(&db, "", "").await;
    let store = fresh_store(&dir).await;
    let planner = ChangesetPlanner::new(&store, false);
    planner.apply_additions(&changeset, "").await.unwrap();

    planner
        .apply_deletions(&[Deletion {
            name: "a".to_string(),
            directory: true,
            file: false,
            link: false,
        }])
        .await
        .unwrap();

    for path in ["a", "a/b", "a/b/f1", "a/f2"] {
        assert!(store.lookup(path).await.unwrap().is_none(), "{path} remains");
    }
}

#[tokio::test]
async fn deleting_a_mountpoint_detaches_the_nested_catalog() {
    let dir = TempDir::new().unwrap();
    let builder = GraftDbBuilder::new(&dir, "graft.db").await;
    builder.dir("a", 0).await;
    builder.dir("a/nested", 1).await;
    builder.file("a/nested/f", 1, &digest_hex(1), 1).await;

    let db = builder.open().await;
    let changeset = load_changeset(&db, "", "").await;
    let store = fresh_store(&dir).await;
    let planner = ChangesetPlanner::new(&store, false);
    planner.apply_additions(&changeset, "").await.unwrap();
    assert!(store.is_transition_point("a/nested").await.unwrap());

    planner
        .apply_deletions(&[Deletion {
            name: "a/nested".to_string(),
            directory: true,
            file: false,
            link: false,
        }])
        .await
        .unwrap();

    assert!(store.lookup("a/nested").await.unwrap().is_none());
    assert!(store.lookup("a/nested/f").await.unwrap().is_none());
    assert!(!store.is_transition_point("a/nested").await.unwrap());
    assert!(store.lookup("a").await.unwrap().is_some());
}

#[tokio::test]
async fn file_never_replaces_directory_or_symlink() {
    let dir = TempDir::new().unwrap();
    let builder = GraftDbBuilder::new(&dir, "graft.db").await;
    builder.file("clash", 1, &digest_hex(1), 1).await;

    let db = builder.open().await;
    let changeset = load_changeset(&db, "", "").await;
    let store = fresh_store(&dir).await;
    store.add_directory(&make_dir("clash", false)).await.unwrap();

    let err = ChangesetPlanner::new(&store, false)
        .apply_additions(&changeset, "")
        .await
        .unwrap_err();
    assert!(matches!(err, GraftError::CatalogConflict(_)));
}

#[tokio::test]
async fn directory_never_replaces_file() {
    let dir = TempDir::new().unwrap();
    let builder = GraftDbBuilder::new(&dir, "graft.db").await;
    builder.dir("clash", 0).await;

    let db = builder.open().await;
    let changeset = load_changeset(&db, "", "").await;
    let store = fresh_store(&dir).await;
    // seed a file where the changeset wants a directory
    let seed = GraftDbBuilder::new(&dir, "seed.db").await;
    seed.file("clash", 1, &digest_hex(9), 1).await;
    let seed_changeset = load_changeset(&seed.open().await, "", "").await;
    ChangesetPlanner::new(&store, false)
        .apply_additions(&seed_changeset, "")
        .await
        .unwrap();

    let err = ChangesetPlanner::new(&store, false)
        .apply_additions(&changeset, "")
        .await
        .unwrap_err();
    assert!(matches!(err, GraftError::CatalogConflict(_)));
}

#[tokio::test]
async fn symlink_replaces_file_but_skips_when_asked() {
    let dir = TempDir::new().unwrap();
    let builder = GraftDbBuilder::new(&dir, "graft.db").await;
    builder.file("replaced", 1, &digest_hex(1), 1).await;
    builder.file("kept", 1, &digest_hex(2), 1).await;

    let db = builder.open().await;
    let changeset = load_changeset(&db, "", "").await;
    let store = fresh_store(&dir).await;
    let planner = ChangesetPlanner::new(&store, false);
    planner.apply_additions(&changeset, "").await.unwrap();

    let links = GraftDbBuilder::new(&dir, "links.db").await;
    links.link("replaced", "target-a", 0).await;
    links.link("kept", "target-b", 1).await;
    let link_changeset = load_changeset(&links.open().await, "", "").await;
    planner.apply_additions(&link_changeset, "").await.unwrap();

    assert_eq!(
        store.lookup("replaced").await.unwrap().unwrap().kind,
        EntryKind::Symlink
    );
    assert_eq!(
        store.lookup("kept").await.unwrap().unwrap().kind,
        EntryKind::File
    );
}

#[tokio::test]
async fn add_missing_nested_creates_catalogs_for_existing_dirs() {
    let dir = TempDir::new().unwrap();
    let store = fresh_store(&dir).await;
    store.add_directory(&make_dir("plain", false)).await.unwrap();

    let builder = GraftDbBuilder::new(&dir, "graft.db").await;
    builder.dir("plain", 0).await;
    let changeset = load_changeset(&builder.open().await, "", "").await;

    ChangesetPlanner::new(&store, true)
        .apply_additions(&changeset, "")
        .await
        .unwrap();

    assert!(store.is_transition_point("plain").await.unwrap());
    assert!(store.lookup("plain/.cvmfscatalog").await.unwrap().is_some());
}

#[tokio::test]
async fn disjoint_roots_are_rejected() {
    let dir = TempDir::new().unwrap();
    let store = fresh_store(&dir).await;

    // Hand-built changeset that escapes the lease subtree: one tree stops
    // at the lease path, the other grows from the namespace root.
    let mut changeset = Changeset::default();
    changeset
        .dirs
        .insert("a/b/c".to_string(), make_dir("a/b/c", false));
    changeset
        .dirs
        .insert("x/y".to_string(), make_dir("x/y", false));

    let err = ChangesetPlanner::new(&store, false)
        .apply_additions(&changeset, "a/b")
        .await
        .unwrap_err();
    assert!(matches!(err, GraftError::InputInvalid(_)));
}

#[tokio::test]
async fn compression_mode_is_recorded() {
    let dir = TempDir::new().unwrap();
    let builder = GraftDbBuilder::new(&dir, "graft.db").await;
    builder.file("int", 10, &digest_hex(1), 1).await;
    builder.file("ext", 10, &digest_hex(2), 0).await;

    let db = builder.open().await;
    let changeset = load_changeset(&db, "", "").await;
    // defaults resolve per data locality
    let internal = &changeset.files[""]
        .iter()
        .find(|f| f.name == "int")
        .unwrap();
    assert_eq!(internal.compression, Compression::Default);
    assert!(internal.internal);

    let store = fresh_store(&dir).await;
    ChangesetPlanner::new(&store, false)
        .apply_additions(&changeset, "")
        .await
        .unwrap();
    assert!(store.lookup("int").await.unwrap().is_some());
    assert!(store.lookup("ext").await.unwrap().is_some());
}
