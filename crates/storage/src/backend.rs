use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors surfaced by storage backends and the gateway.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The persistent medium cannot be opened at all; callers fall back to
    /// the in-memory backend.
    #[error("persistent storage unavailable: {0}")]
    Unavailable(String),

    /// The write cannot fit even after cleanup.
    #[error("storage quota exceeded: write of {needed} bytes over a {budget} byte budget")]
    QuotaExceeded { needed: u64, budget: u64 },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Raw key/value persistence under the quota gateway.
///
/// Values are JSON text; backends store and measure them as opaque strings.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    /// Fetch the value stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend cannot be read.
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the write fails.
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove `key` if present.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the delete fails.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// All stored keys.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend cannot be read.
    async fn keys(&self) -> Result<Vec<String>, StorageError>;

    /// Total stored size in bytes (keys plus values).
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend cannot be read.
    async fn used_bytes(&self) -> Result<u64, StorageError>;

    /// Whether data survives process restarts.
    fn persistent(&self) -> bool;
}

/// Non-persistent fallback backend, also used in tests.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>, StorageError> {
        self.entries
            .lock()
            .map_err(|e| StorageError::Backend(e.to_string()))
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.lock()?.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.lock()?.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    async fn used_bytes(&self) -> Result<u64, StorageError> {
        Ok(self
            .lock()?
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum())
    }

    fn persistent(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_round_trip() {
        let backend = MemoryBackend::new();
        backend.set("a", "hello").await.unwrap();

        assert_eq!(backend.get("a").await.unwrap().as_deref(), Some("hello"));
        assert_eq!(backend.used_bytes().await.unwrap(), 6);

        backend.remove("a").await.unwrap();
        assert_eq!(backend.get("a").await.unwrap(), None);
        assert!(!backend.persistent());
    }
}
