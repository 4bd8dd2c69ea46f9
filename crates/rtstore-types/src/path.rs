//! Hierarchical path algebra: `/`-joined segments alternating collection and
//! document level. A path with an odd segment count addresses a collection;
//! an even segment count addresses a document.

use crate::error::{Error, Result};

fn segments(path: &str) -> Result<Vec<&str>> {
    if path.is_empty() {
        return Err(Error::InvalidPath("empty path".into()));
    }
    let parts: Vec<&str> = path.split('/').collect();
    if parts.iter().any(|s| s.is_empty()) {
        return Err(Error::InvalidPath(format!("path has an empty segment: {path}")));
    }
    Ok(parts)
}

/// True iff `path` addresses a collection (odd segment count).
pub fn is_collection(path: &str) -> Result<bool> {
    Ok(segments(path)?.len() % 2 == 1)
}

/// True iff `path` addresses a document (even segment count, at least two segments).
pub fn is_document(path: &str) -> Result<bool> {
    let n = segments(path)?.len();
    Ok(n % 2 == 0 && n >= 2)
}

/// Strip the last segment off a document path, yielding its parent collection.
///
/// Returns `InvalidPath` rather than aborting when `path` is not a document
/// path; callers that already know statically they hold a document path may
/// discard the error, but nothing here panics on caller input.
pub fn parent_collection(path: &str) -> Result<String> {
    if !is_document(path)? {
        return Err(Error::InvalidPath(format!(
            "parent_collection called on a non-document path: {path}"
        )));
    }
    match path.rfind('/') {
        Some(idx) => Ok(path[..idx].to_string()),
        None => Err(Error::InvalidPath(format!("no parent segment in: {path}"))),
    }
}

/// Build the key of the `n`th document added under `collection`.
pub fn child_document(collection: &str, n: u64) -> String {
    format!("{collection}/{n}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_parity() {
        assert!(matches!(is_collection("users"), Ok(true)));
        assert!(matches!(is_document("users"), Ok(false)));
        assert!(matches!(is_document("users/u1"), Ok(true)));
        assert!(matches!(is_collection("users/u1"), Ok(false)));
        assert!(matches!(is_collection("users/u1/posts"), Ok(true)));
        assert!(matches!(is_document("users/u1/posts/p1"), Ok(true)));
    }

    #[test]
    fn empty_path_is_invalid() {
        assert!(is_collection("").is_err());
        assert!(is_document("").is_err());
    }

    #[test]
    fn empty_segment_is_invalid() {
        assert!(is_document("users//u1").is_err());
        assert!(is_collection("users/").is_err());
    }

    #[test]
    fn parent_collection_strips_last_segment() {
        let parent = parent_collection("users/u1");
        assert!(matches!(parent.as_deref(), Ok("users")));

        let parent = parent_collection("users/u1/posts/p1");
        assert!(matches!(parent.as_deref(), Ok("users/u1/posts")));
    }

    #[test]
    fn parent_collection_rejects_collection_path() {
        assert!(parent_collection("users").is_err());
    }

    #[test]
    fn round_trip_via_child_document() {
        let parent = "users";
        let child = child_document(parent, 7);
        assert_eq!(child, "users/7");
        let recovered = parent_collection(&child);
        assert!(matches!(recovered.as_deref(), Ok("users")));
    }
}
