//! In-memory implementation of [`RemoteRepository`] for testing
//!
//! Models the full blob/tree/commit/ref graph plus CAS-checked contents
//! writes, records every call, and supports scripted fault injection so
//! conflict, fallback and ambiguous-response behavior can be exercised
//! without a network.

use super::{
    BranchHead, ObjectHandle, PutObject, PutResponse, RemoteRepository, TreeEntry, TreeItem,
};
use crate::error::{PixError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;

/// One recorded remote call, in invocation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    GetObject { path: String },
    PutObject { path: String, sha: Option<String> },
    CreateBlob,
    GetTree { sha: String },
    CreateTree { base: Option<String>, entries: usize },
    CreateCommit,
    UpdateRef { branch: String, commit_sha: String },
    GetBranch,
}

#[derive(Debug, Clone)]
struct StoredObject {
    sha: String,
    content: Vec<u8>,
}

#[derive(Debug, Clone)]
struct CommitNode {
    tree: String,
}

#[derive(Debug, Default)]
struct Faults {
    /// Remaining contents PUTs to reject with a conflict (not applied)
    put_conflicts: u32,
    /// Remaining contents PUTs to apply but answer ambiguously
    ambiguous_puts: u32,
    /// 1-based create_blob call indices that fail
    blob_failures: Vec<u32>,
}

/// A contents PUT as the remote saw it: the CAS token it carried and the
/// sha it produced (`None` when the write was rejected).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRecord {
    pub path: String,
    pub carried_sha: Option<String>,
    pub result_sha: Option<String>,
}

#[derive(Debug)]
struct Inner {
    objects: HashMap<String, StoredObject>,
    blobs: HashMap<String, Vec<u8>>,
    trees: HashMap<String, Vec<TreeItem>>,
    commits: HashMap<String, CommitNode>,
    branch: BranchHead,
    log: Vec<RemoteCall>,
    puts: Vec<PutRecord>,
    faults: Faults,
    blob_calls: u32,
}

#[derive(Debug)]
pub struct MemoryRemote {
    inner: Mutex<Inner>,
}

fn sha_of(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        let empty_tree = sha_of(&[b"tree:"]);
        let genesis = sha_of(&[b"commit:", empty_tree.as_bytes()]);

        let mut trees = HashMap::new();
        trees.insert(empty_tree.clone(), Vec::new());
        let mut commits = HashMap::new();
        commits.insert(
            genesis.clone(),
            CommitNode {
                tree: empty_tree.clone(),
            },
        );

        Self {
            inner: Mutex::new(Inner {
                objects: HashMap::new(),
                blobs: HashMap::new(),
                trees,
                commits,
                branch: BranchHead {
                    commit_sha: genesis,
                    tree_sha: empty_tree,
                },
                log: Vec::new(),
                puts: Vec::new(),
                faults: Faults::default(),
                blob_calls: 0,
            }),
        }
    }

    /// Reject the next `n` contents PUTs with a CAS conflict.
    pub fn inject_put_conflicts(&self, n: u32) {
        self.inner.lock().unwrap().faults.put_conflicts = n;
    }

    /// Apply the next `n` contents PUTs but answer without a payload.
    pub fn inject_ambiguous_puts(&self, n: u32) {
        self.inner.lock().unwrap().faults.ambiguous_puts = n;
    }

    /// Fail the `index`-th (1-based) blob creation call.
    pub fn fail_blob_call(&self, index: u32) {
        self.inner.lock().unwrap().faults.blob_failures.push(index);
    }

    /// Seed an object directly, bypassing the log and CAS checks.
    pub fn seed_object(&self, path: &str, content: &[u8]) -> String {
        let sha = sha_of(&[b"object:", content]);
        self.inner.lock().unwrap().objects.insert(
            path.to_string(),
            StoredObject {
                sha: sha.clone(),
                content: content.to_vec(),
            },
        );
        sha
    }

    pub fn object_content(&self, path: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(path)
            .map(|o| o.content.clone())
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.inner.lock().unwrap().log.clone()
    }

    pub fn count<F>(&self, pred: F) -> usize
    where
        F: Fn(&RemoteCall) -> bool,
    {
        self.inner.lock().unwrap().log.iter().filter(|c| pred(c)).count()
    }

    pub fn put_records(&self) -> Vec<PutRecord> {
        self.inner.lock().unwrap().puts.clone()
    }

    pub fn branch_head(&self) -> BranchHead {
        self.inner.lock().unwrap().branch.clone()
    }
}

#[async_trait]
impl RemoteRepository for MemoryRemote {
    async fn get_object(&self, path: &str) -> Result<Option<ObjectHandle>> {
        let mut inner = self.inner.lock().unwrap();
        inner.log.push(RemoteCall::GetObject {
            path: path.to_string(),
        });
        Ok(inner.objects.get(path).map(|o| ObjectHandle {
            path: path.to_string(),
            sha: o.sha.clone(),
            content: Bytes::from(o.content.clone()),
        }))
    }

    async fn put_object(&self, path: &str, body: &PutObject) -> Result<PutResponse> {
        let mut inner = self.inner.lock().unwrap();
        inner.log.push(RemoteCall::PutObject {
            path: path.to_string(),
            sha: body.sha.clone(),
        });

        if inner.faults.put_conflicts > 0 {
            inner.faults.put_conflicts -= 1;
            inner.puts.push(PutRecord {
                path: path.to_string(),
                carried_sha: body.sha.clone(),
                result_sha: None,
            });
            return Ok(PutResponse::Conflict {
                message: "injected: is at head but expected a different sha".to_string(),
            });
        }

        let rejection = match (inner.objects.get(path), &body.sha) {
            (Some(existing), Some(sha)) if &existing.sha != sha => {
                Some(format!("{} does not match expected sha", sha))
            }
            (Some(_), None) => Some("sha required to update an existing path".to_string()),
            _ => None,
        };
        if let Some(message) = rejection {
            inner.puts.push(PutRecord {
                path: path.to_string(),
                carried_sha: body.sha.clone(),
                result_sha: None,
            });
            return Ok(PutResponse::Conflict { message });
        }

        let sha = sha_of(&[b"object:", &body.content]);
        inner.objects.insert(
            path.to_string(),
            StoredObject {
                sha: sha.clone(),
                content: body.content.to_vec(),
            },
        );
        inner.puts.push(PutRecord {
            path: path.to_string(),
            carried_sha: body.sha.clone(),
            result_sha: Some(sha.clone()),
        });

        if inner.faults.ambiguous_puts > 0 {
            inner.faults.ambiguous_puts -= 1;
            return Ok(PutResponse::Ambiguous);
        }

        Ok(PutResponse::Committed(ObjectHandle {
            path: path.to_string(),
            sha,
            content: body.content.clone(),
        }))
    }

    async fn create_blob(&self, content: &[u8]) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.log.push(RemoteCall::CreateBlob);
        inner.blob_calls += 1;
        let call_index = inner.blob_calls;

        if inner.faults.blob_failures.contains(&call_index) {
            return Err(PixError::Remote {
                status: 500,
                message: "injected blob failure".to_string(),
            });
        }

        let sha = sha_of(&[b"blob:", content]);
        inner.blobs.insert(sha.clone(), content.to_vec());
        Ok(sha)
    }

    async fn get_tree(&self, sha: &str) -> Result<Vec<TreeItem>> {
        let mut inner = self.inner.lock().unwrap();
        inner.log.push(RemoteCall::GetTree {
            sha: sha.to_string(),
        });
        inner
            .trees
            .get(sha)
            .cloned()
            .ok_or_else(|| PixError::Internal(format!("unknown tree: {}", sha)))
    }

    async fn create_tree(&self, base_tree: Option<&str>, entries: &[TreeEntry]) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.log.push(RemoteCall::CreateTree {
            base: base_tree.map(str::to_string),
            entries: entries.len(),
        });

        for entry in entries {
            if !inner.blobs.contains_key(&entry.sha) {
                return Err(PixError::Internal(format!(
                    "tree references unknown blob: {}",
                    entry.sha
                )));
            }
        }

        let mut items = match base_tree {
            Some(base) => inner
                .trees
                .get(base)
                .cloned()
                .ok_or_else(|| PixError::Internal(format!("unknown base tree: {}", base)))?,
            None => Vec::new(),
        };
        for entry in entries {
            items.retain(|item| item.path != entry.path);
            items.push(TreeItem {
                path: entry.path.clone(),
                kind: "blob".to_string(),
                sha: entry.sha.clone(),
                size: 0,
            });
        }

        let mut digest_parts: Vec<Vec<u8>> = vec![b"tree:".to_vec()];
        for item in &items {
            digest_parts.push(item.path.clone().into_bytes());
            digest_parts.push(item.sha.clone().into_bytes());
        }
        let parts: Vec<&[u8]> = digest_parts.iter().map(|p| p.as_slice()).collect();
        let sha = sha_of(&parts);

        inner.trees.insert(sha.clone(), items);
        Ok(sha)
    }

    async fn create_commit(&self, tree: &str, parent: &str, message: &str) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.log.push(RemoteCall::CreateCommit);

        if !inner.trees.contains_key(tree) {
            return Err(PixError::Internal(format!("unknown tree: {}", tree)));
        }
        let sha = sha_of(&[
            b"commit:",
            tree.as_bytes(),
            parent.as_bytes(),
            message.as_bytes(),
        ]);
        inner.commits.insert(
            sha.clone(),
            CommitNode {
                tree: tree.to_string(),
            },
        );
        Ok(sha)
    }

    async fn update_ref(&self, branch: &str, commit_sha: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.log.push(RemoteCall::UpdateRef {
            branch: branch.to_string(),
            commit_sha: commit_sha.to_string(),
        });

        let tree = inner
            .commits
            .get(commit_sha)
            .map(|c| c.tree.clone())
            .ok_or_else(|| PixError::Internal(format!("unknown commit: {}", commit_sha)))?;
        inner.branch = BranchHead {
            commit_sha: commit_sha.to_string(),
            tree_sha: tree,
        };
        Ok(())
    }

    async fn get_branch(&self, _branch: &str) -> Result<BranchHead> {
        let mut inner = self.inner.lock().unwrap();
        inner.log.push(RemoteCall::GetBranch);
        Ok(inner.branch.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_requires_matching_sha() {
        let remote = MemoryRemote::new();
        let sha = remote.seed_object("a.txt", b"one");

        // Stale sha is rejected.
        let resp = remote
            .put_object(
                "a.txt",
                &PutObject {
                    message: "m".to_string(),
                    content: Bytes::from_static(b"two"),
                    sha: Some("deadbeef".to_string()),
                },
            )
            .await
            .unwrap();
        assert!(matches!(resp, PutResponse::Conflict { .. }));

        // Matching sha lands.
        let resp = remote
            .put_object(
                "a.txt",
                &PutObject {
                    message: "m".to_string(),
                    content: Bytes::from_static(b"two"),
                    sha: Some(sha),
                },
            )
            .await
            .unwrap();
        assert!(matches!(resp, PutResponse::Committed(_)));
        assert_eq!(remote.object_content("a.txt").unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_put_without_sha_conflicts_on_existing_path() {
        let remote = MemoryRemote::new();
        remote.seed_object("a.txt", b"one");

        let resp = remote
            .put_object(
                "a.txt",
                &PutObject {
                    message: "m".to_string(),
                    content: Bytes::from_static(b"two"),
                    sha: None,
                },
            )
            .await
            .unwrap();
        assert!(matches!(resp, PutResponse::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_commit_graph_round_trip() {
        let remote = MemoryRemote::new();
        let head = remote.get_branch("main").await.unwrap();

        let blob = remote.create_blob(b"img-bytes").await.unwrap();
        let tree = remote
            .create_tree(
                Some(&head.tree_sha),
                &[TreeEntry {
                    path: "img/a.png".to_string(),
                    sha: blob,
                }],
            )
            .await
            .unwrap();
        let commit = remote
            .create_commit(&tree, &head.commit_sha, "upload")
            .await
            .unwrap();
        remote.update_ref("main", &commit).await.unwrap();

        let new_head = remote.get_branch("main").await.unwrap();
        assert_eq!(new_head.commit_sha, commit);
        let items = remote.get_tree(&new_head.tree_sha).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].path, "img/a.png");
    }

    #[tokio::test]
    async fn test_tree_rejects_unknown_blob() {
        let remote = MemoryRemote::new();
        let result = remote
            .create_tree(
                None,
                &[TreeEntry {
                    path: "a.png".to_string(),
                    sha: "missing".to_string(),
                }],
            )
            .await;
        assert!(result.is_err());
    }
}
