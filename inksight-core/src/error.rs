use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Error taxonomy for the hybrid access / sync core.
///
/// Per-document faults (`ListingError`/`DownloadError`) never abort a batch
/// operation; they are caught at the call site and folded into a
/// `SyncReport`'s `failed` list instead of propagating.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("could not connect to device: {0}")]
    ConnectionFailed(String),

    #[error("authentication failed: {0}")]
    AuthenticationError(String),

    #[error("listing failed: {0}")]
    ListingFailed(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("archive missing required member: {0}")]
    InvalidArchive(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("executor error: {0}")]
    Executor(String),
}
