//! Path sanitisation and lease-path computation.
//!
//! Paths inside the catalog namespace are relative (no leading slash) and
//! every name read from a graft database passes through [`sanitise_name`]
//! before it is used anywhere.

/// Sanitise an entry name from a graft database.
///
/// Leading slashes are stripped; the remainder must be a clean relative
/// path. Returns the normalised name or an error naming the violated rule.
pub fn sanitise_name(name: &str) -> crate::Result<String> {
    let stripped = name.trim_start_matches('/');
    let reject = |reason: &str| {
        Err(crate::Error::InvalidPath(format!(
            "name '{name}' is invalid ({reason})"
        )))
    };

    if stripped.is_empty() {
        return reject("empty");
    }
    if stripped.ends_with('/') {
        return reject("trailing slash");
    }
    if stripped.contains("//") {
        return reject("double slash");
    }
    if stripped.starts_with("./") || stripped.starts_with("../") {
        return reject("relative prefix");
    }
    if stripped.ends_with("/.") || stripped.ends_with("/..") {
        return reject("dot suffix");
    }
    if stripped.contains("/./") || stripped.contains("/../") {
        return reject("dot component");
    }
    Ok(stripped.to_string())
}

/// Parent directory of a relative path; the root parent is `""`.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[..pos],
        None => "",
    }
}

/// Final component of a relative path.
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

/// True when `path` lies within the subtree rooted at `lease` (both
/// relative, slash-free prefixes; an empty lease covers everything).
pub fn is_below(path: &str, lease: &str) -> bool {
    lease.is_empty() || path == lease || path.starts_with(&format!("{lease}/"))
}

/// Compute a lease path covering all given (sanitised, relative) paths:
/// the longest common prefix, truncated at `/` boundaries, with a leading
/// slash restored for the gateway.
pub fn lease_path_from(paths: &[String]) -> String {
    let Some(first) = paths.first() else {
        return "/".to_string();
    };
    let mut lease = first.clone();
    for path in &paths[1..] {
        // shrink the lease until it is an ancestor of `path`
        while !is_below(path, &lease) {
            lease.truncate(lease.rfind('/').unwrap_or(0));
        }
        if lease.is_empty() {
            break;
        }
    }
    format!("/{lease}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitise_accepts_clean_paths() {
        assert_eq!(sanitise_name("a/b/c").unwrap(), "a/b/c");
        assert_eq!(sanitise_name("/a/b").unwrap(), "a/b");
        assert_eq!(sanitise_name("///a").unwrap(), "a");
        assert_eq!(sanitise_name(".hidden/file").unwrap(), ".hidden/file");
    }

    #[test]
    fn test_sanitise_rejects_bad_paths() {
        for bad in [
            "", "/", "a//b", "./a", "../a", "a/.", "a/..", "a/./b", "a/../b", "a/b/",
        ] {
            assert!(sanitise_name(bad).is_err(), "should reject {bad:?}");
        }
    }

    #[test]
    fn test_parent_and_basename() {
        assert_eq!(parent("a/b/c"), "a/b");
        assert_eq!(parent("a"), "");
        assert_eq!(basename("a/b/c"), "c");
        assert_eq!(basename("a"), "a");
    }

    #[test]
    fn test_is_below() {
        assert!(is_below("a/b/c", "a/b"));
        assert!(is_below("a/b", "a/b"));
        assert!(is_below("anything", ""));
        assert!(!is_below("a/bc", "a/b"));
        assert!(!is_below("a", "a/b"));
    }

    #[test]
    fn test_lease_path_common_prefix() {
        let paths = ["a/b/c", "a/b/d", "a/e"].map(String::from);
        assert_eq!(lease_path_from(&paths), "/a");
    }

    #[test]
    fn test_lease_path_single_entry() {
        assert_eq!(lease_path_from(&["x".to_string()]), "/x");
    }

    #[test]
    fn test_lease_path_disjoint_falls_to_root() {
        let paths = ["a/b", "c/d"].map(String::from);
        assert_eq!(lease_path_from(&paths), "/");
        assert_eq!(lease_path_from(&[]), "/");
    }
}
