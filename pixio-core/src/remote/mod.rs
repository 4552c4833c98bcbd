//! Typed operations against the remote repository API
//!
//! The [`RemoteRepository`] trait is the narrow seam between the sync core
//! and the contents/git API of the hosting provider. [`http::HttpRemote`]
//! is the production implementation; [`memory::MemoryRemote`] is an
//! in-memory implementation for tests.

pub mod http;
pub mod memory;

pub use http::HttpRemote;
pub use memory::{MemoryRemote, PutRecord, RemoteCall};

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// A freshly fetched remote object: path, content hash, decoded bytes.
///
/// Handles are never cached across writes; a stale `sha` guarantees a CAS
/// conflict on the next conditional PUT.
#[derive(Debug, Clone)]
pub struct ObjectHandle {
    pub path: String,
    pub sha: String,
    pub content: Bytes,
}

/// Head of a branch: the commit it points at and that commit's root tree.
#[derive(Debug, Clone)]
pub struct BranchHead {
    pub commit_sha: String,
    pub tree_sha: String,
}

/// One entry of a tree to create. Mode is always `100644` (regular blob).
#[derive(Debug, Clone, Serialize)]
pub struct TreeEntry {
    pub path: String,
    pub sha: String,
}

/// One item of a fetched tree listing.
#[derive(Debug, Clone, Deserialize)]
pub struct TreeItem {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub sha: String,
    #[serde(default)]
    pub size: u64,
}

/// Body of a conditional contents PUT.
#[derive(Debug, Clone)]
pub struct PutObject {
    pub message: String,
    /// Raw bytes; the transport encodes them as base64 on the wire
    pub content: Bytes,
    /// CAS token of the version being replaced; `None` creates the object
    pub sha: Option<String>,
}

/// Outcome of a contents PUT.
///
/// Conflicts are values, not errors: the CAS loop in the document store and
/// the tolerance option of the single uploader both branch on them.
#[derive(Debug, Clone)]
pub enum PutResponse {
    /// The write landed; the handle carries the new content sha.
    Committed(ObjectHandle),
    /// The remote rejected the precondition (sha mismatch class).
    Conflict { message: String },
    /// Transport-level success but no recognizable content payload, e.g. a
    /// connection dropped after server-side completion. The caller decides
    /// whether to probe for the object.
    Ambiguous,
}

/// Operations the sync core needs from the remote repository (contents API
/// plus the low-level blob/tree/commit/ref primitives).
#[async_trait]
pub trait RemoteRepository: Debug + Send + Sync {
    /// Fetch one object, bypassing caches. `None` when the path is absent.
    async fn get_object(&self, path: &str) -> Result<Option<ObjectHandle>>;

    /// Conditional PUT of one object. `body.sha` carries the CAS token.
    async fn put_object(&self, path: &str, body: &PutObject) -> Result<PutResponse>;

    /// Create a content blob; returns its sha.
    async fn create_blob(&self, content: &[u8]) -> Result<String>;

    /// Fetch a tree, recursively. Used for post-commit listing refresh.
    async fn get_tree(&self, sha: &str) -> Result<Vec<TreeItem>>;

    /// Create a tree with `entries`, anchored on `base_tree` when present
    /// (additive: unrelated existing paths are preserved). Returns its sha.
    async fn create_tree(&self, base_tree: Option<&str>, entries: &[TreeEntry]) -> Result<String>;

    /// Create a commit referencing `tree` with a single `parent`.
    async fn create_commit(&self, tree: &str, parent: &str, message: &str) -> Result<String>;

    /// Point the branch ref at `commit_sha`. The update is forced
    /// (non-fast-forward overwrite), so a concurrent external update of the
    /// branch is silently discarded rather than detected.
    async fn update_ref(&self, branch: &str, commit_sha: &str) -> Result<()>;

    /// Fetch the branch head (commit sha + root tree sha).
    async fn get_branch(&self, branch: &str) -> Result<BranchHead>;
}

/// Classify a PUT rejection as a CAS conflict.
///
/// The contents API reports precondition failures as 409, or as 422 with a
/// message naming the stale sha / non-fast-forward head.
pub fn is_cas_conflict(status: u16, message: &str) -> bool {
    if status == 409 {
        return true;
    }
    if status == 422 {
        let message = message.to_ascii_lowercase();
        return message.contains("sha") || message.contains("conflict") || message.contains("head");
    }
    false
}

/// Join a destination directory and filename into a repository-relative
/// path. `/` or an empty directory means the repository root; leading
/// slashes are never part of a path key.
pub fn join_path(dir: &str, filename: &str) -> String {
    let dir = dir.trim_matches('/');
    if dir.is_empty() {
        filename.trim_start_matches('/').to_string()
    } else {
        format!("{}/{}", dir, filename.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_cas_conflict() {
        assert!(is_cas_conflict(409, "anything"));
        assert!(is_cas_conflict(422, "does not match expected SHA"));
        assert!(is_cas_conflict(422, "update is not a fast forward of head"));
        assert!(is_cas_conflict(422, "merge conflict detected"));
        assert!(!is_cas_conflict(422, "content is too large"));
        assert!(!is_cas_conflict(500, "sha"));
        assert!(!is_cas_conflict(404, "not found"));
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/", "a.png"), "a.png");
        assert_eq!(join_path("", "a.png"), "a.png");
        assert_eq!(join_path("img", "a.png"), "img/a.png");
        assert_eq!(join_path("img/", "/a.png"), "img/a.png");
        assert_eq!(join_path("/img/2024/", "a.png"), "img/2024/a.png");
    }
}
