use thiserror::Error;

use quiz_core::model::SessionError;
use storage::StorageError;

/// Errors surfaced by the service layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServiceError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error("stored progress document for {identity} is malformed: {reason}")]
    MalformedDocument { identity: String, reason: String },
}
