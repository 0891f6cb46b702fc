//! Integration tests for the graft database reader.

mod common;

use common::{GraftDbBuilder, digest_hex, load_changeset, open_rw};
use strata_graft::{Changeset, GraftDb};
use tempfile::TempDir;

#[tokio::test]
async fn changeset_is_grouped_by_parent() {
    let dir = TempDir::new().unwrap();
    let builder = GraftDbBuilder::new(&dir, "graft.db").await;
    builder.dir("top", 0).await;
    builder.file("top/f1", 5, &digest_hex(1), 1).await;
    builder.file("top/f2", 5, &digest_hex(2), 1).await;
    builder.link("top/l1", "f1", 0).await;

    let db = builder.open().await;
    assert_eq!(db.schema_revision(), 4);
    let changeset = load_changeset(&db, "", "").await;

    assert!(changeset.dirs.contains_key("top"));
    assert_eq!(changeset.files["top"].len(), 2);
    assert_eq!(changeset.symlinks["top"].len(), 1);
    assert_eq!(changeset.file_count(), 2);
    assert_eq!(changeset.symlink_count(), 1);
}

#[tokio::test]
async fn names_are_sanitised_and_leading_slashes_stripped() {
    let dir = TempDir::new().unwrap();
    let builder = GraftDbBuilder::new(&dir, "graft.db").await;
    builder.dir("/rooted", 0).await;

    let db = builder.open().await;
    let changeset = load_changeset(&db, "", "").await;
    assert!(changeset.dirs.contains_key("rooted"));
}

#[tokio::test]
async fn malformed_names_fail_the_graft() {
    let dir = TempDir::new().unwrap();
    let builder = GraftDbBuilder::new(&dir, "graft.db").await;
    builder.dir("a//b", 0).await;

    let db = builder.open().await;
    let mut changeset = Changeset::default();
    assert!(db.load_dirs("", "", &mut changeset).await.is_err());
}

#[tokio::test]
async fn entries_outside_the_lease_are_rejected() {
    let dir = TempDir::new().unwrap();
    let builder = GraftDbBuilder::new(&dir, "graft.db").await;
    builder.file("other/f", 1, &digest_hex(1), 1).await;

    let db = builder.open().await;
    let mut changeset = Changeset::default();
    assert!(db.load_files("top", "", &mut changeset).await.is_err());
}

#[tokio::test]
async fn additional_prefix_is_applied_before_the_lease_check() {
    let dir = TempDir::new().unwrap();
    let builder = GraftDbBuilder::new(&dir, "graft.db").await;
    builder.dir("sub", 0).await;

    let db = builder.open().await;
    let mut changeset = Changeset::default();
    db.load_dirs("pre", "pre/", &mut changeset).await.unwrap();
    assert!(changeset.dirs.contains_key("pre/sub"));
}

#[tokio::test]
async fn acl_text_becomes_a_binary_xattr() {
    let dir = TempDir::new().unwrap();
    let builder = GraftDbBuilder::new(&dir, "graft.db").await;
    builder
        .dir_with_acl("with-acl", "u::rwx,g::r-x,g:0:rwx,m::rwx,o::---")
        .await;
    builder.dir_with_acl("mode-only", "u::rw,g::r,o::-").await;
    builder.dir_with_acl("bad", "q::rwx").await;

    let db = builder.open().await;
    let mut changeset = Changeset::default();
    // the malformed ACL poisons the load
    assert!(db.load_dirs("", "", &mut changeset).await.is_err());

    // without the bad row the xattr shows up only where needed
    let builder = GraftDbBuilder::new(&dir, "graft2.db").await;
    builder
        .dir_with_acl("with-acl", "u::rwx,g::r-x,g:0:rwx,m::rwx,o::---")
        .await;
    builder.dir_with_acl("mode-only", "u::rw,g::r,o::-").await;
    let db = builder.open().await;
    let changeset = load_changeset(&db, "", "").await;

    let with_acl = &changeset.dirs["with-acl"];
    let xattr = with_acl.xattrs.get("system.posix_acl_access").unwrap();
    assert_eq!(&xattr[..4], &[0x02, 0x00, 0x00, 0x00]);
    assert!(changeset.dirs["mode-only"].xattrs.is_empty());
}

#[tokio::test]
async fn deletions_come_children_first() {
    let dir = TempDir::new().unwrap();
    let builder = GraftDbBuilder::new(&dir, "graft.db").await;
    builder.deletion("a", 1, 0, 0).await;
    builder.deletion("a/b/c", 0, 1, 0).await;
    builder.deletion("a/b", 1, 0, 0).await;

    let db = builder.open().await;
    let deletions = db.load_deletions("", "").await.unwrap();
    let names: Vec<&str> = deletions.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["a/b/c", "a/b", "a"]);
}

#[tokio::test]
async fn affected_dirs_cover_additions_and_deletions() {
    let dir = TempDir::new().unwrap();
    let builder = GraftDbBuilder::new(&dir, "graft.db").await;
    builder.dir("d1/d2", 0).await;
    builder.file("d1/d2/f", 1, &digest_hex(1), 1).await;
    builder.link("d1/l", "f", 0).await;
    builder.deletion("gone/x", 0, 1, 0).await;

    let db = builder.open().await;

    let additions_only = db.affected_dirs(true, false).await.unwrap();
    assert!(additions_only.contains(&"d1/d2".to_string()));
    assert!(additions_only.contains(&"d1".to_string()));
    assert!(!additions_only.contains(&"gone".to_string()));

    let everything = db.affected_dirs(true, true).await.unwrap();
    assert!(everything.contains(&"gone".to_string()));
}

#[tokio::test]
async fn old_schema_revisions_get_column_defaults() {
    let dir = TempDir::new().unwrap();

    // Revision 2: files lack `compressed`, dirs lack `nested`.
    let db_path = dir.path().join("old.db");
    let pool = open_rw(&db_path).await;
    for statement in [
        "CREATE TABLE dirs (name TEXT PRIMARY KEY, mode INTEGER NOT NULL DEFAULT 493, \
         mtime INTEGER NOT NULL DEFAULT 0, owner INTEGER NOT NULL DEFAULT 0, \
         grp INTEGER NOT NULL DEFAULT 0, acl TEXT NOT NULL DEFAULT '')",
        "CREATE TABLE files (name TEXT PRIMARY KEY, mode INTEGER NOT NULL DEFAULT 420, \
         mtime INTEGER NOT NULL DEFAULT 0, owner INTEGER NOT NULL DEFAULT 0, \
         grp INTEGER NOT NULL DEFAULT 0, size INTEGER NOT NULL DEFAULT 0, \
         hashes TEXT NOT NULL DEFAULT '', internal INTEGER NOT NULL DEFAULT 0)",
        "CREATE TABLE links (name TEXT PRIMARY KEY, target TEXT NOT NULL DEFAULT '', \
         mtime INTEGER NOT NULL DEFAULT 0, owner INTEGER NOT NULL DEFAULT 0, \
         grp INTEGER NOT NULL DEFAULT 0, skip_if_file_or_dir INTEGER NOT NULL DEFAULT 0)",
        "CREATE TABLE properties (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        "INSERT INTO properties VALUES ('schema_revision', '2')",
        "INSERT INTO dirs (name) VALUES ('d')",
    ] {
        sqlx::query(statement).execute(&pool).await.unwrap();
    }
    sqlx::query("INSERT INTO files (name, size, hashes, internal) VALUES ('d/f', 3, ?, 1)")
        .bind(digest_hex(1))
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    let db = GraftDb::open(&db_path).await.unwrap();
    assert_eq!(db.schema_revision(), 2);
    let changeset = load_changeset(&db, "", "").await;

    // nested defaults to set, compression to default
    assert!(changeset.dirs["d"].nested);
    assert_eq!(
        changeset.files["d"][0].compression,
        strata_graft::Compression::Default
    );
}

#[tokio::test]
async fn missing_schema_revision_is_an_error() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("broken.db");
    let pool = open_rw(&db_path).await;
    sqlx::query("CREATE TABLE properties (key TEXT PRIMARY KEY, value TEXT NOT NULL)")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    assert!(GraftDb::open(&db_path).await.is_err());
}
