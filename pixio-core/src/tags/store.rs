//! Remote-backed store for the per-repository tag document
//!
//! The store keeps one in-memory [`TagDocument`] and persists it to the
//! remote through a write-serialization queue: a dedicated worker task
//! drains write jobs in FIFO enqueue order, so at most one remote write
//! for the document is ever in flight and later writes observe the effect
//! of earlier ones. Remote conflicts are resolved by a bounded CAS retry
//! loop against a freshly fetched content hash.

use crate::config::RepoConfig;
use crate::error::{PixError, Result};
use crate::remote::{PutObject, PutResponse, RemoteRepository};
use crate::retry::Backoff;
use crate::tags::document::TagDocument;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, mpsc, oneshot};

/// Bound on conditional PUT attempts for one document write.
const WRITE_ATTEMPTS: u32 = 5;
/// Backoff between conflicted attempts: 200ms * 2^attempt, capped.
const WRITE_BACKOFF_BASE_MS: u64 = 200;
const WRITE_BACKOFF_MAX_MS: u64 = 3_200;

/// Outcome of one persistence request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// The merged document was written to the remote.
    Saved,
    /// The merged document was byte-identical to the remote (ignoring the
    /// timestamp); no write was performed.
    NoOp,
    /// The request was not user-triggered; the remote was not contacted.
    Skipped,
    /// The CAS retry bound was exhausted. The local mutation stays applied
    /// but is not guaranteed persisted.
    Exhausted,
}

impl PersistOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, PersistOutcome::Exhausted)
    }
}

struct WriteJob {
    snapshot: TagDocument,
    done: oneshot::Sender<Result<PersistOutcome>>,
}

struct StoreInner {
    remote: Arc<dyn RemoteRepository>,
    config: RepoConfig,
    document_path: String,
    doc: RwLock<TagDocument>,
    initialized: AtomicBool,
    init_gate: Mutex<()>,
    queue: mpsc::UnboundedSender<WriteJob>,
}

/// Handle to the tag document of one repository. Cheap to clone.
#[derive(Clone)]
pub struct TagStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for TagStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagStore")
            .field("document_path", &self.inner.document_path)
            .field(
                "initialized",
                &self.inner.initialized.load(Ordering::Acquire),
            )
            .finish()
    }
}

impl TagStore {
    pub fn new(remote: Arc<dyn RemoteRepository>, config: RepoConfig) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteJob>();
        let document_path = config.document_path();

        let inner = Arc::new(StoreInner {
            remote,
            config,
            document_path,
            doc: RwLock::new(TagDocument::empty()),
            initialized: AtomicBool::new(false),
            init_gate: Mutex::new(()),
            queue: tx,
        });

        // Write worker: drains jobs strictly in enqueue order. A job runs to
        // completion even when the caller that enqueued it has gone away.
        let worker = inner.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let result = write_remote(&worker, job.snapshot).await;
                if let Err(error) = &result {
                    tracing::warn!("tag document write failed: {}", error);
                }
                let _ = job.done.send(result);
            }
        });

        Self { inner }
    }

    /// Load the remote document into memory, once.
    ///
    /// Idempotent and safe under concurrency: callers racing an in-flight
    /// initialization await that same attempt instead of starting another.
    /// An absent remote document seeds an empty in-memory document without
    /// writing anything remotely. Incomplete credentials only log; the
    /// store then stays uninitialized.
    pub async fn initialize(&self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        if !self.inner.config.credentials_complete() {
            tracing::warn!("tag store initialization skipped: incomplete credentials");
            return Ok(());
        }

        let _gate = self.inner.init_gate.lock().await;
        if self.is_initialized() {
            return Ok(());
        }

        let fetched = self
            .inner
            .remote
            .get_object(&self.inner.document_path)
            .await?;
        let doc = match fetched {
            Some(handle) => match TagDocument::from_bytes(&handle.content) {
                Ok(doc) => doc,
                Err(error) => {
                    tracing::warn!(
                        "tag document at {} is unreadable, starting empty: {}",
                        self.inner.document_path,
                        error
                    );
                    TagDocument::empty()
                }
            },
            None => TagDocument::empty(),
        };

        *self.inner.doc.write().unwrap() = doc;
        self.inner.initialized.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::Acquire)
    }

    /// Tags for `path`, empty when unmapped or uninitialized.
    pub fn tags_for(&self, path: &str) -> Vec<String> {
        if !self.is_initialized() {
            return Vec::new();
        }
        self.inner.doc.read().unwrap().tags_for(path)
    }

    /// Snapshot of the current document, `None` before initialization.
    pub fn document(&self) -> Option<TagDocument> {
        if !self.is_initialized() {
            return None;
        }
        Some(self.inner.doc.read().unwrap().clone())
    }

    /// Replace the tag list for `path` and persist.
    pub async fn set_tags(&self, path: &str, tags: Vec<String>) -> Result<PersistOutcome> {
        self.mutate(|doc| doc.set_tags(path, tags)).await
    }

    /// Drop `path` from the document and persist.
    pub async fn remove_path(&self, path: &str) -> Result<PersistOutcome> {
        self.mutate(|doc| doc.remove_path(path)).await
    }

    async fn mutate<F>(&self, apply: F) -> Result<PersistOutcome>
    where
        F: FnOnce(&mut TagDocument),
    {
        if !self.is_initialized() {
            tracing::warn!("tag mutation rejected: store not initialized");
            return Err(PixError::Config("tag store not initialized".to_string()));
        }
        apply(&mut self.inner.doc.write().unwrap());
        self.persist(true).await
    }

    /// Persist the current in-memory document.
    ///
    /// Non-user-triggered requests succeed without contacting the remote.
    /// The write itself runs on the queue worker, so a caller that stops
    /// awaiting does not cancel it.
    pub async fn persist(&self, user_triggered: bool) -> Result<PersistOutcome> {
        if !user_triggered {
            return Ok(PersistOutcome::Skipped);
        }
        let pending = self.queue_write()?;
        pending
            .await
            .map_err(|_| PixError::Internal("write queue dropped the job".to_string()))?
    }

    /// Snapshot the document and take a queue position, synchronously:
    /// jobs are ordered by the moment this is called, not by when the
    /// caller first awaits.
    fn queue_write(&self) -> Result<oneshot::Receiver<Result<PersistOutcome>>> {
        let snapshot = self.inner.doc.read().unwrap().clone();
        let (done, pending) = oneshot::channel();
        self.inner
            .queue
            .send(WriteJob { snapshot, done })
            .map_err(|_| PixError::Internal("write queue worker gone".to_string()))?;
        Ok(pending)
    }
}

/// One queued write: fresh fetch, merge, no-op detection, bounded CAS loop.
async fn write_remote(inner: &StoreInner, snapshot: TagDocument) -> Result<PersistOutcome> {
    let path = inner.document_path.as_str();

    // The handle is always fetched fresh; a cached sha would guarantee a
    // conflict on the conditional PUT.
    let fetched = inner.remote.get_object(path).await?;
    let (mut current_sha, remote_doc) = match fetched {
        Some(handle) => {
            let doc = match TagDocument::from_bytes(&handle.content) {
                Ok(doc) => Some(doc),
                Err(error) => {
                    tracing::warn!("remote tag document unreadable, overwriting: {}", error);
                    None
                }
            };
            (Some(handle.sha), doc)
        }
        None => (None, None),
    };

    let merged = snapshot.merged_onto(remote_doc.as_ref());

    if let Some(remote_doc) = &remote_doc {
        if remote_doc.normalized_bytes()? == merged.normalized_bytes()? {
            *inner.doc.write().unwrap() = merged;
            return Ok(PersistOutcome::NoOp);
        }
    }

    let content = Bytes::from(merged.to_bytes()?);
    let message = format!(
        "Update pixio tags data - {}",
        merged.last_updated.to_rfc3339()
    );

    let mut backoff = Backoff::new(WRITE_BACKOFF_BASE_MS, WRITE_BACKOFF_MAX_MS);
    for attempt in 1..=WRITE_ATTEMPTS {
        let body = PutObject {
            message: message.clone(),
            content: content.clone(),
            sha: current_sha.clone(),
        };
        match inner.remote.put_object(path, &body).await? {
            PutResponse::Committed(_) => {
                *inner.doc.write().unwrap() = merged;
                return Ok(PersistOutcome::Saved);
            }
            PutResponse::Conflict { message } => {
                tracing::debug!(
                    "tag document conflict on attempt {}/{}: {}",
                    attempt,
                    WRITE_ATTEMPTS,
                    message
                );
                if attempt == WRITE_ATTEMPTS {
                    break;
                }
                current_sha = inner.remote.get_object(path).await?.map(|h| h.sha);
                tokio::time::sleep(backoff.next_delay()).await;
            }
            PutResponse::Ambiguous => {
                return Err(PixError::Internal(
                    "document write returned no payload".to_string(),
                ));
            }
        }
    }

    tracing::warn!(
        "tag document write exhausted {} attempts at {}",
        WRITE_ATTEMPTS,
        path
    );
    Ok(PersistOutcome::Exhausted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteCall;
    use crate::remote::memory::MemoryRemote;

    fn config() -> RepoConfig {
        RepoConfig {
            api_base: "https://api.github.com".to_string(),
            owner: "octo".to_string(),
            repo: "images".to_string(),
            branch: "main".to_string(),
            token: "tok".to_string(),
            metadata_dir: ".pixio".to_string(),
            upload_dir: "/".to_string(),
            timeout_secs: 30,
            committer: None,
        }
    }

    fn store_over(remote: Arc<MemoryRemote>) -> TagStore {
        TagStore::new(remote, config())
    }

    fn put_count(remote: &MemoryRemote) -> usize {
        remote.count(|c| matches!(c, RemoteCall::PutObject { .. }))
    }

    #[tokio::test]
    async fn test_initialize_without_remote_document_writes_nothing() {
        let remote = Arc::new(MemoryRemote::new());
        let store = store_over(remote.clone());

        store.initialize().await.unwrap();

        assert!(store.is_initialized());
        assert!(store.tags_for("a.png").is_empty());
        assert_eq!(put_count(&remote), 0);
        assert!(remote.object_content(".pixio/tags.json").is_none());
    }

    #[tokio::test]
    async fn test_initialize_loads_existing_document() {
        let remote = Arc::new(MemoryRemote::new());
        remote.seed_object(
            ".pixio/tags.json",
            br#"{"version":"2.0.0","lastUpdated":"2024-01-01T00:00:00Z","images":{"a.png":["cat"]}}"#,
        );
        let store = store_over(remote.clone());

        store.initialize().await.unwrap();

        assert_eq!(store.tags_for("a.png"), vec!["cat".to_string()]);
        assert_eq!(store.document().unwrap().version, "2.0.0");
    }

    #[tokio::test]
    async fn test_initialize_deduplicates_concurrent_callers() {
        let remote = Arc::new(MemoryRemote::new());
        let store = store_over(remote.clone());

        let (a, b, c) = tokio::join!(store.initialize(), store.initialize(), store.initialize());
        a.unwrap();
        b.unwrap();
        c.unwrap();

        assert_eq!(
            remote.count(|call| matches!(call, RemoteCall::GetObject { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_initialize_incomplete_credentials_is_silent() {
        let remote = Arc::new(MemoryRemote::new());
        let mut incomplete = config();
        incomplete.token = String::new();
        let store = TagStore::new(remote.clone(), incomplete);

        store.initialize().await.unwrap();

        assert!(!store.is_initialized());
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_set_tags_persists_document() {
        let remote = Arc::new(MemoryRemote::new());
        let store = store_over(remote.clone());
        store.initialize().await.unwrap();

        let outcome = store
            .set_tags("img/a.png", vec!["cat".to_string()])
            .await
            .unwrap();
        assert_eq!(outcome, PersistOutcome::Saved);

        let written = remote.object_content(".pixio/tags.json").unwrap();
        let doc = TagDocument::from_bytes(&written).unwrap();
        assert_eq!(doc.tags_for("img/a.png"), vec!["cat".to_string()]);
    }

    #[tokio::test]
    async fn test_mutation_rejected_before_initialization() {
        let remote = Arc::new(MemoryRemote::new());
        let store = store_over(remote.clone());

        let result = store.set_tags("a.png", vec!["x".to_string()]).await;
        assert!(result.is_err());
        assert_eq!(put_count(&remote), 0);
    }

    #[tokio::test]
    async fn test_non_user_triggered_persist_contacts_nothing() {
        let remote = Arc::new(MemoryRemote::new());
        let store = store_over(remote.clone());
        store.initialize().await.unwrap();
        let calls_before = remote.calls().len();

        let outcome = store.persist(false).await.unwrap();

        assert_eq!(outcome, PersistOutcome::Skipped);
        assert_eq!(remote.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn test_noop_write_performs_zero_puts() {
        let remote = Arc::new(MemoryRemote::new());
        let store = store_over(remote.clone());
        store.initialize().await.unwrap();

        store
            .set_tags("a.png", vec!["cat".to_string()])
            .await
            .unwrap();
        assert_eq!(put_count(&remote), 1);

        // Semantically identical mutation: only the timestamp differs.
        let outcome = store
            .set_tags("a.png", vec!["cat".to_string()])
            .await
            .unwrap();
        assert_eq!(outcome, PersistOutcome::NoOp);
        assert_eq!(put_count(&remote), 1);
    }

    #[tokio::test]
    async fn test_cas_retry_converges_after_conflicts() {
        let remote = Arc::new(MemoryRemote::new());
        let store = store_over(remote.clone());
        store.initialize().await.unwrap();

        remote.inject_put_conflicts(2);
        let outcome = store
            .set_tags("a.png", vec!["cat".to_string()])
            .await
            .unwrap();

        assert_eq!(outcome, PersistOutcome::Saved);
        assert_eq!(put_count(&remote), 3);

        let written =
            TagDocument::from_bytes(&remote.object_content(".pixio/tags.json").unwrap()).unwrap();
        assert_eq!(written.tags_for("a.png"), vec!["cat".to_string()]);
    }

    #[tokio::test]
    async fn test_write_exhaustion_keeps_local_mutation() {
        let remote = Arc::new(MemoryRemote::new());
        let store = store_over(remote.clone());
        store.initialize().await.unwrap();

        remote.inject_put_conflicts(5);
        let outcome = store
            .set_tags("a.png", vec!["cat".to_string()])
            .await
            .unwrap();

        assert_eq!(outcome, PersistOutcome::Exhausted);
        assert!(!outcome.is_success());
        // Local mutation is not rolled back.
        assert_eq!(store.tags_for("a.png"), vec!["cat".to_string()]);
        // Nothing landed remotely.
        assert!(remote.object_content(".pixio/tags.json").is_none());
    }

    #[tokio::test]
    async fn test_writes_serialize_in_enqueue_order() {
        let remote = Arc::new(MemoryRemote::new());
        let store = store_over(remote.clone());
        store.initialize().await.unwrap();

        // Enqueue two writes back to back, before awaiting either: the
        // worker must execute them in enqueue order, the second observing
        // the content hash produced by the first.
        store
            .inner
            .doc
            .write()
            .unwrap()
            .set_tags("a.png", vec!["first".to_string()]);
        let first = store.queue_write().unwrap();

        store
            .inner
            .doc
            .write()
            .unwrap()
            .set_tags("b.png", vec!["second".to_string()]);
        let second = store.queue_write().unwrap();

        assert_eq!(first.await.unwrap().unwrap(), PersistOutcome::Saved);
        assert_eq!(second.await.unwrap().unwrap(), PersistOutcome::Saved);

        let puts = remote.put_records();
        assert_eq!(puts.len(), 2);
        // The first write created the document; the second carried exactly
        // the content hash the first write produced.
        assert_eq!(puts[0].carried_sha, None);
        assert_eq!(puts[1].carried_sha, puts[0].result_sha);

        let written =
            TagDocument::from_bytes(&remote.object_content(".pixio/tags.json").unwrap()).unwrap();
        assert_eq!(written.tags_for("a.png"), vec!["first".to_string()]);
        assert_eq!(written.tags_for("b.png"), vec!["second".to_string()]);
    }

    #[tokio::test]
    async fn test_merge_preserves_remote_version_on_write() {
        let remote = Arc::new(MemoryRemote::new());
        remote.seed_object(
            ".pixio/tags.json",
            br#"{"version":"2.0.0","lastUpdated":"2024-01-01T00:00:00Z","images":{"a.png":["x"]}}"#,
        );
        let store = store_over(remote.clone());
        store.initialize().await.unwrap();

        // Local document diverges: drop a.png, tag b.png instead.
        store.remove_path("a.png").await.unwrap();
        store
            .set_tags("b.png", vec!["y".to_string()])
            .await
            .unwrap();

        let written =
            TagDocument::from_bytes(&remote.object_content(".pixio/tags.json").unwrap()).unwrap();
        assert_eq!(written.version, "2.0.0");
        assert!(written.images.get("a.png").is_none());
        assert_eq!(written.tags_for("b.png"), vec!["y".to_string()]);
    }
}
