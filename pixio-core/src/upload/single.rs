//! Per-file upload through the contents API with retry and recovery

use super::UPLOAD_COMMIT_MESSAGE;
use crate::error::Result;
use crate::remote::{ObjectHandle, PutObject, PutResponse, RemoteRepository};
use crate::retry::{Attempt, Backoff, run_bounded};
use bytes::Bytes;
use std::sync::Arc;

const UPLOAD_ATTEMPTS: u32 = 3;
/// Backoff between attempts: 300ms * 2^(attempt-1).
const UPLOAD_BACKOFF_BASE_MS: u64 = 300;
const UPLOAD_BACKOFF_MAX_MS: u64 = 1_200;

#[derive(Debug, Clone)]
pub struct SingleUploadRequest {
    /// Already-encoded file bytes
    pub content: Bytes,
    /// Repository-relative destination path
    pub destination: String,
    /// Content hash of the existing object when the destination is known to
    /// pre-exist (overwrite / re-upload)
    pub prior_sha: Option<String>,
    /// Accept a precondition-failed response as an idempotent duplicate
    /// write instead of a failure
    pub tolerate_conflict: bool,
}

#[derive(Debug, Clone)]
pub enum SingleUploadOutcome {
    Uploaded(ObjectHandle),
    /// Every attempt failed without a success payload or a presence
    /// confirmation.
    Exhausted,
}

impl SingleUploadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SingleUploadOutcome::Uploaded(_))
    }
}

#[derive(Debug, Clone)]
pub struct SingleUploadOperation {
    remote: Arc<dyn RemoteRepository>,
}

impl SingleUploadOperation {
    pub fn new(remote: Arc<dyn RemoteRepository>) -> Self {
        Self { remote }
    }

    pub async fn run(&self, request: SingleUploadRequest) -> Result<SingleUploadOutcome> {
        let remote = &self.remote;
        let destination = request.destination.as_str();
        let content = &request.content;
        let prior_sha = &request.prior_sha;
        let tolerate_conflict = request.tolerate_conflict;

        let uploaded = run_bounded(
            UPLOAD_ATTEMPTS,
            Backoff::new(UPLOAD_BACKOFF_BASE_MS, UPLOAD_BACKOFF_MAX_MS),
            |attempt| async move {
                let body = PutObject {
                    message: UPLOAD_COMMIT_MESSAGE.to_string(),
                    content: content.clone(),
                    sha: prior_sha.clone(),
                };

                match remote.put_object(destination, &body).await {
                    Ok(PutResponse::Committed(handle)) => return Ok(Attempt::Done(handle)),
                    Ok(PutResponse::Conflict { message }) => {
                        if !tolerate_conflict {
                            tracing::warn!(
                                "upload conflict at {} (attempt {}/{}): {}",
                                destination,
                                attempt,
                                UPLOAD_ATTEMPTS,
                                message
                            );
                            return Ok(Attempt::Retry);
                        }
                        // Tolerated: the destination likely already carries
                        // this content. Fall through to the presence probe.
                    }
                    Ok(PutResponse::Ambiguous) => {
                        // Transport-level success without a payload, e.g. the
                        // connection dropped after server-side completion.
                        // Fall through to the presence probe.
                    }
                    Err(error) => {
                        tracing::warn!(
                            "upload to {} failed (attempt {}/{}): {}",
                            destination,
                            attempt,
                            UPLOAD_ATTEMPTS,
                            error
                        );
                        // The write may still have landed server-side; probe
                        // before burning the next attempt.
                    }
                }

                // Existence probe: the client and the server can disagree on
                // the outcome. A present object with a valid identifier
                // counts as success.
                match remote.get_object(destination).await {
                    Ok(Some(handle)) if !handle.sha.is_empty() => Ok(Attempt::Done(handle)),
                    Ok(_) => Ok(Attempt::Retry),
                    Err(error) => {
                        tracing::debug!("presence probe at {} failed: {}", destination, error);
                        Ok(Attempt::Retry)
                    }
                }
            },
        )
        .await?;

        Ok(match uploaded {
            Some(handle) => SingleUploadOutcome::Uploaded(handle),
            None => SingleUploadOutcome::Exhausted,
        })
    }
}
