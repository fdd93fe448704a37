//! Quota-aware persistence gateway.
//!
//! All reads and writes of JSON documents go through here. Writes that
//! would push the store over its size budget trigger bounded cleanup in a
//! strict order (scratch keys, history truncation, embedded-field
//! stripping) before the write is retried; a write that still cannot fit
//! fails with [`StorageError::QuotaExceeded`] rather than being dropped.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use quiz_core::model::{EXAM_HISTORY_RETENTION, SESSION_RETENTION};

use crate::backend::{KeyValueBackend, MemoryBackend, StorageError};
use crate::keys::{KeyKind, StorageKey};
use crate::sqlite::SqliteBackend;

/// Size budget and retention limits for one identity's data.
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    pub budget_bytes: u64,
    pub max_exam_history: usize,
    pub max_sessions: usize,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 5 * 1024 * 1024,
            max_exam_history: EXAM_HISTORY_RETENTION,
            max_sessions: SESSION_RETENTION,
        }
    }
}

/// Snapshot of current storage usage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StorageInfo {
    pub used: u64,
    pub total: u64,
    pub percentage: f64,
}

/// Quota-aware key/value gateway over a [`KeyValueBackend`].
#[derive(Clone)]
pub struct StorageGateway {
    backend: Arc<dyn KeyValueBackend>,
    quota: QuotaConfig,
}

impl StorageGateway {
    #[must_use]
    pub fn new(backend: Arc<dyn KeyValueBackend>, quota: QuotaConfig) -> Self {
        Self { backend, quota }
    }

    /// Gateway over the non-persistent in-memory backend.
    #[must_use]
    pub fn in_memory(quota: QuotaConfig) -> Self {
        Self::new(Arc::new(MemoryBackend::new()), quota)
    }

    /// Open SQLite-backed storage, falling back to the in-memory backend
    /// when the persistent medium is unavailable. The fallback is visible
    /// through [`StorageGateway::persistent`].
    pub async fn open_sqlite(database_url: &str, quota: QuotaConfig) -> Self {
        match SqliteBackend::connect(database_url).await {
            Ok(backend) => Self::new(Arc::new(backend), quota),
            Err(err) => {
                warn!(%database_url, error = %err, "persistent storage unavailable, using in-memory fallback");
                Self::in_memory(quota)
            }
        }
    }

    /// Whether writes survive process restarts.
    #[must_use]
    pub fn persistent(&self) -> bool {
        self.backend.persistent()
    }

    /// Fetch and parse the document stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend or parse failure.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        match self.backend.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Store a document under `key`, running quota cleanup first if the
    /// projected total would exceed the budget.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::QuotaExceeded` if the write cannot fit even
    /// after cleanup; other `StorageError` variants on backend failure.
    pub async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        let serialized = serde_json::to_string(value)?;
        let write_size = (key.len() + serialized.len()) as u64;

        if self.projected_usage(key, write_size).await? > self.quota.budget_bytes {
            self.run_cleanup(key, write_size).await?;
        }

        let projected = self.projected_usage(key, write_size).await?;
        if projected > self.quota.budget_bytes {
            return Err(StorageError::QuotaExceeded {
                needed: write_size,
                budget: self.quota.budget_bytes,
            });
        }

        self.backend.set(key, &serialized).await
    }

    /// Remove `key` if present.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    pub async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.backend.remove(key).await
    }

    /// All stored keys.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    pub async fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.backend.keys().await
    }

    /// Current usage against the configured budget.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    pub async fn storage_info(&self) -> Result<StorageInfo, StorageError> {
        let used = self.backend.used_bytes().await?;
        let total = self.quota.budget_bytes;
        let percentage = if total == 0 {
            100.0
        } else {
            used as f64 * 100.0 / total as f64
        };
        Ok(StorageInfo {
            used,
            total,
            percentage,
        })
    }

    async fn projected_usage(&self, key: &str, write_size: u64) -> Result<u64, StorageError> {
        let used = self.backend.used_bytes().await?;
        let existing = self
            .backend
            .get(key)
            .await?
            .map_or(0, |v| (key.len() + v.len()) as u64);
        Ok(used - existing + write_size)
    }

    /// Bounded cleanup, in strict order. Stops as soon as the pending write
    /// fits.
    async fn run_cleanup(&self, pending_key: &str, write_size: u64) -> Result<(), StorageError> {
        debug!(key = pending_key, write_size, "quota pressure, running cleanup");

        self.drop_ephemeral_keys().await?;
        if self.projected_usage(pending_key, write_size).await? <= self.quota.budget_bytes {
            return Ok(());
        }

        self.shrink_documents(pending_key, ShrinkStage::Truncate)
            .await?;
        if self.projected_usage(pending_key, write_size).await? <= self.quota.budget_bytes {
            return Ok(());
        }

        self.shrink_documents(pending_key, ShrinkStage::StripEmbedded)
            .await?;
        Ok(())
    }

    /// Stage (a): scratch and cache keys go unconditionally.
    async fn drop_ephemeral_keys(&self) -> Result<(), StorageError> {
        for key in self.backend.keys().await? {
            if matches!(
                StorageKey::classify(&key),
                KeyKind::Scratch | KeyKind::Cache
            ) {
                debug!(%key, "evicting ephemeral key");
                self.backend.remove(&key).await?;
            }
        }
        Ok(())
    }

    /// Stages (b) and (c): rewrite stored documents in place.
    ///
    /// The key being written is skipped; its old value is replaced by the
    /// pending write anyway, so shrinking it would not free anything.
    async fn shrink_documents(
        &self,
        pending_key: &str,
        stage: ShrinkStage,
    ) -> Result<(), StorageError> {
        for key in self.backend.keys().await? {
            if key == pending_key || StorageKey::classify(&key) != KeyKind::Document {
                continue;
            }
            let Some(raw) = self.backend.get(&key).await? else {
                continue;
            };
            let mut doc: Value = serde_json::from_str(&raw)?;
            let changed = match stage {
                ShrinkStage::Truncate => truncate_history(
                    &mut doc,
                    self.quota.max_sessions,
                    self.quota.max_exam_history,
                ),
                ShrinkStage::StripEmbedded => strip_embedded_questions(&mut doc),
            };
            if changed {
                debug!(%key, ?stage, "shrank stored document");
                self.backend.set(&key, &serde_json::to_string(&doc)?).await?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum ShrinkStage {
    Truncate,
    StripEmbedded,
}

/// Keep only the most recent entries of the historical collections.
fn truncate_history(doc: &mut Value, max_sessions: usize, max_exams: usize) -> bool {
    let mut changed = false;
    for (field, limit) in [("studySessions", max_sessions), ("examHistory", max_exams)] {
        if let Some(Value::Array(entries)) = doc.get_mut(field) {
            if entries.len() > limit {
                let excess = entries.len() - limit;
                entries.drain(..excess);
                changed = true;
            }
        }
    }
    changed
}

/// Replace embedded question payloads in retained history with id lists.
///
/// Old clients persisted full question objects inside sessions; those
/// documents can reach the gateway before migration has run.
fn strip_embedded_questions(doc: &mut Value) -> bool {
    let Some(Value::Array(sessions)) = doc.get_mut("studySessions") else {
        return false;
    };
    let mut changed = false;
    for session in sessions {
        let Value::Object(entry) = session else {
            continue;
        };
        for heavy_field in ["questions", "answers"] {
            let Some(Value::Array(items)) = entry.get(heavy_field) else {
                continue;
            };
            let ids: Vec<Value> = items
                .iter()
                .filter_map(|q| q.get("questionId").cloned())
                .collect();
            if !entry.contains_key("questionIds") {
                entry.insert("questionIds".to_owned(), Value::Array(ids));
            }
            entry.remove(heavy_field);
            changed = true;
        }
    }
    changed
}
