use std::io;

use thiserror::Error;

/// An error that happens while serving a cache operation.
///
/// [`NotFound`](Self::NotFound) is special: it is the remote tier's way of reporting that a key
/// does not exist, and is turned into a cache miss instead of being reported as a failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The object was not found at the remote source.
    #[error("not found")]
    NotFound,
    /// The remote store rejected the request due to missing permissions.
    ///
    /// The attached string contains the remote store's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// A remote request timed out.
    ///
    /// Timeouts are enforced by the remote clients, which do not report how long they waited.
    #[error("remote request timed out")]
    Timeout,
    /// Fetching from the remote store failed for another reason, like connection loss, DNS
    /// resolution, or a 5xx server response.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// Storing an object in the remote store failed.
    #[error("upload failed: {0}")]
    UploadError(String),
    /// A local file system operation failed.
    ///
    /// The attached string names the operation and the underlying error.
    #[error("{0}")]
    Io(String),
    /// An unexpected error in cachebucket itself.
    #[error("internal error")]
    InternalError,
}

impl From<io::Error> for CacheError {
    #[track_caller]
    fn from(err: io::Error) -> Self {
        Self::io("file system error", err)
    }
}

impl CacheError {
    /// Wraps a local I/O error, prefixing it with the operation that failed.
    pub fn io(context: &str, err: io::Error) -> Self {
        tracing::debug!(error = &err as &dyn std::error::Error, "{context}");
        Self::Io(format!("{context}: {err}"))
    }

    /// Creates a [`DownloadError`](Self::DownloadError) from any error type.
    pub fn download_error(err: &dyn std::error::Error) -> Self {
        Self::DownloadError(err.to_string())
    }
}

/// The result of a cache operation, either `Ok(T)` or the reason it failed.
pub type CacheContents<T = ()> = Result<T, CacheError>;
