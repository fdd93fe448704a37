use thiserror::Error;

/// Errors surfaced by the sync engine and remote store implementations.
///
/// None of these interrupt the local read/write path: the engine degrades
/// to `Offline` and the repository keeps serving local state.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    #[error("remote store unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("remote operation timed out")]
    RemoteTimeout,

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("local document store error: {0}")]
    Local(String),

    #[error("sync engine is not running")]
    NotRunning,
}
