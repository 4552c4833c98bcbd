pub mod batch;
pub mod single;

pub use batch::{BatchUploadOperation, BatchUploadOutcome, BatchUploadRequest, UploadItem};
pub use single::{SingleUploadOperation, SingleUploadOutcome, SingleUploadRequest};

/// Commit message for image uploads, single-file and batched alike.
pub const UPLOAD_COMMIT_MESSAGE: &str = "Upload images via pixio";

/// Outcome of a detached post-commit side effect.
///
/// Side effects (tag attachment, listing refresh) run on their own task and
/// never revert a landed commit; subscribers observe how they went here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    TagsAttached { path: String, ok: bool },
    ListingRefreshed { dir: String, images: usize, ok: bool },
}
