#![forbid(unsafe_code)]

pub mod error;
pub mod events;
pub mod repository;

pub use error::ServiceError;
pub use events::{EventSubscription, ProgressEvent};
pub use repository::{
    AnswerContext, CompletedSession, OvercomePolicy, ProgressRepository, RepositoryConfig,
    ResetOutcome, attach_sync_engine,
};
