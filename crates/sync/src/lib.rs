#![forbid(unsafe_code)]

pub mod engine;
pub mod error;
pub mod remote;

pub use engine::{LocalDocumentStore, SyncConfig, SyncHandle, SyncState, spawn};
pub use error::SyncError;
pub use remote::{HttpRemoteStore, MemoryRemoteStore, RemoteStore};
