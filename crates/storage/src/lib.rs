#![forbid(unsafe_code)]

pub mod backend;
pub mod gateway;
pub mod keys;
pub mod migrate;
pub mod sqlite;

pub use backend::{KeyValueBackend, MemoryBackend, StorageError};
pub use gateway::{QuotaConfig, StorageGateway, StorageInfo};
pub use keys::{KeyKind, StorageKey};
pub use migrate::{MigrationEngine, MigrationReport, detect_schema_version};
