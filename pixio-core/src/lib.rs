//! Pixio Core - image hosting on a git-backed remote repository
//!
//! The core is two synchronization mechanisms over a content-addressed
//! blob/tree/commit API:
//! - a CAS-based read-merge-write store for the per-repository tag
//!   document, with FIFO write serialization and bounded conflict retry
//! - a batch commit pipeline composing blob -> tree -> commit -> ref,
//!   with a per-file contents-API fallback when atomic composition is
//!   not possible

pub mod config;
pub mod error;
pub mod remote;
pub mod retry;
pub mod tags;
pub mod upload;

pub use config::{CommitterConfig, RepoConfig};
pub use error::{PixError, Result};
pub use remote::{
    BranchHead, HttpRemote, MemoryRemote, ObjectHandle, PutObject, PutResponse, RemoteRepository,
    TreeEntry, TreeItem, join_path,
};
pub use retry::{Attempt, Backoff, run_bounded};
pub use tags::{PersistOutcome, TagCount, TagDocument, TagStore};
pub use upload::{
    BatchUploadOperation, BatchUploadOutcome, BatchUploadRequest, SingleUploadOperation,
    SingleUploadOutcome, SingleUploadRequest, UPLOAD_COMMIT_MESSAGE, UploadEvent, UploadItem,
};
