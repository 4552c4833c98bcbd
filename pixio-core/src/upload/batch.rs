//! Multi-file atomic upload through blob/tree/commit/ref composition
//!
//! The happy path lands N files in one commit: blobs first, then a tree
//! anchored on the current branch head, a single-parent commit, and a
//! forced ref update. When any blob creation fails the batch abandons the
//! atomic path entirely and falls back to sequential per-file uploads
//! through the contents API, since a tree cannot reference a blob that
//! does not exist.

use super::single::{SingleUploadOperation, SingleUploadRequest};
use super::{UPLOAD_COMMIT_MESSAGE, UploadEvent};
use crate::error::Result;
use crate::remote::{RemoteRepository, TreeEntry, join_path};
use crate::tags::TagStore;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::broadcast;

/// One file to upload.
#[derive(Debug, Clone)]
pub struct UploadItem {
    pub filename: String,
    /// Already-encoded image bytes
    pub content: Bytes,
    /// Tags to attach after the upload lands
    pub tags: Vec<String>,
    /// Content hash of the existing object for re-uploads
    pub prior_sha: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BatchUploadRequest {
    pub items: Vec<UploadItem>,
    /// Destination directory; "/" or "" targets the repository root
    pub destination_dir: String,
}

#[derive(Debug, Clone)]
pub enum BatchUploadOutcome {
    /// All items landed atomically in one commit.
    Committed {
        commit_sha: String,
        uploaded: Vec<String>,
    },
    /// The atomic path was abandoned; every item went through the per-file
    /// uploader. `results` holds (destination path, success) per item.
    FellBack { results: Vec<(String, bool)> },
}

impl BatchUploadOutcome {
    pub fn is_success(&self) -> bool {
        match self {
            BatchUploadOutcome::Committed { .. } => true,
            BatchUploadOutcome::FellBack { results } => results.iter().all(|(_, ok)| *ok),
        }
    }
}

pub struct BatchUploadOperation {
    remote: Arc<dyn RemoteRepository>,
    tags: TagStore,
    branch: String,
    events: broadcast::Sender<UploadEvent>,
}

impl BatchUploadOperation {
    pub fn new(remote: Arc<dyn RemoteRepository>, tags: TagStore, branch: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            remote,
            tags,
            branch: branch.into(),
            events,
        }
    }

    /// Observe post-commit side effect outcomes.
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.events.subscribe()
    }

    pub async fn run(&self, request: BatchUploadRequest) -> Result<BatchUploadOutcome> {
        let dir = request.destination_dir.as_str();

        // Stage 1: create a content blob per item. A failure does not stop
        // the loop, but it marks the whole batch ineligible for the atomic
        // commit.
        let mut blobs: Vec<(usize, String)> = Vec::with_capacity(request.items.len());
        let mut any_blob_failed = false;
        for (index, item) in request.items.iter().enumerate() {
            match self.remote.create_blob(&item.content).await {
                Ok(sha) => blobs.push((index, sha)),
                Err(error) => {
                    tracing::warn!("blob creation failed for {}: {}", item.filename, error);
                    any_blob_failed = true;
                }
            }
        }

        if any_blob_failed || blobs.is_empty() {
            return self.fall_back(&request).await;
        }

        // Stage 2: head -> tree -> commit -> ref, strictly ordered. Failures
        // here abort the batch and are reported, not retried: retrying past
        // a created commit risks duplicate history.
        let head = self.remote.get_branch(&self.branch).await?;

        let entries: Vec<TreeEntry> = blobs
            .iter()
            .map(|(index, sha)| TreeEntry {
                path: join_path(dir, &request.items[*index].filename),
                sha: sha.clone(),
            })
            .collect();
        let tree = self
            .remote
            .create_tree(Some(&head.tree_sha), &entries)
            .await?;
        let commit = self
            .remote
            .create_commit(&tree, &head.commit_sha, UPLOAD_COMMIT_MESSAGE)
            .await?;
        // Forced: a benign race with concurrent external history movement
        // must not wedge the upload. A genuinely conflicting concurrent
        // update is silently discarded.
        self.remote.update_ref(&self.branch, &commit).await?;

        let uploaded: Vec<String> = entries.iter().map(|e| e.path.clone()).collect();
        let tagged: Vec<(String, Vec<String>)> = blobs
            .iter()
            .map(|(index, _)| {
                (
                    join_path(dir, &request.items[*index].filename),
                    request.items[*index].tags.clone(),
                )
            })
            .collect();
        self.spawn_post_upload(tagged, dir.to_string());

        Ok(BatchUploadOutcome::Committed {
            commit_sha: commit,
            uploaded,
        })
    }

    /// Per-file fallback: every item goes through the contents API, in
    /// order, tolerating idempotent duplicate writes.
    async fn fall_back(&self, request: &BatchUploadRequest) -> Result<BatchUploadOutcome> {
        let dir = request.destination_dir.as_str();
        let uploader = SingleUploadOperation::new(self.remote.clone());

        let mut results = Vec::with_capacity(request.items.len());
        let mut tagged = Vec::new();
        for item in &request.items {
            let destination = join_path(dir, &item.filename);
            let ok = match uploader
                .run(SingleUploadRequest {
                    content: item.content.clone(),
                    destination: destination.clone(),
                    prior_sha: item.prior_sha.clone(),
                    tolerate_conflict: true,
                })
                .await
            {
                Ok(outcome) => outcome.is_success(),
                Err(error) => {
                    tracing::warn!("fallback upload failed for {}: {}", destination, error);
                    false
                }
            };
            if ok {
                tagged.push((destination.clone(), item.tags.clone()));
            }
            results.push((destination, ok));
        }

        if !tagged.is_empty() {
            self.spawn_post_upload(tagged, dir.to_string());
        }
        Ok(BatchUploadOutcome::FellBack { results })
    }

    /// Detached post-upload side effects: attach pending tags, then refresh
    /// the listing. Their failure never reverts the landed writes; outcomes
    /// are published for observers.
    fn spawn_post_upload(&self, tagged: Vec<(String, Vec<String>)>, dir: String) {
        let tags = self.tags.clone();
        let remote = self.remote.clone();
        let branch = self.branch.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            for (path, item_tags) in tagged {
                if item_tags.is_empty() {
                    continue;
                }
                let ok = match tags.set_tags(&path, item_tags).await {
                    Ok(outcome) => outcome.is_success(),
                    Err(error) => {
                        tracing::warn!("tag attachment failed for {}: {}", path, error);
                        false
                    }
                };
                let _ = events.send(UploadEvent::TagsAttached { path, ok });
            }

            let refreshed = refresh_listing(&remote, &branch, &dir).await;
            let (images, ok) = match refreshed {
                Ok(count) => (count, true),
                Err(error) => {
                    tracing::warn!("listing refresh failed for {}: {}", dir, error);
                    (0, false)
                }
            };
            let _ = events.send(UploadEvent::ListingRefreshed { dir, images, ok });
        });
    }
}

/// Re-read the branch tree and count the blobs under `dir`.
async fn refresh_listing(
    remote: &Arc<dyn RemoteRepository>,
    branch: &str,
    dir: &str,
) -> Result<usize> {
    let head = remote.get_branch(branch).await?;
    let items = remote.get_tree(&head.tree_sha).await?;
    let prefix = join_path(dir, "");
    Ok(items
        .iter()
        .filter(|item| item.kind == "blob" && item.path.starts_with(&prefix))
        .count())
}
