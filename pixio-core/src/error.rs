use thiserror::Error;

/// Error type for pixio core operations.
///
/// Absence of a remote object is not an error: lookups return `Ok(None)`.
/// CAS conflicts are not errors either: conditional writes report them as
/// [`crate::remote::PutResponse::Conflict`] and callers retry up to a
/// bound. Every variant here aborts the operation that raised it.
#[derive(Debug, Error)]
pub enum PixError {
    /// Missing or invalid configuration (required credentials, bad paths)
    #[error("config error: {0}")]
    Config(String),

    /// Network-level failure: no usable response from the remote
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Remote answered with a status that is neither success, absence,
    /// nor a recognizable CAS conflict
    #[error("remote error: status {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed base64 payload in a remote response
    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PixError>;
