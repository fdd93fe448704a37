//! Remote document store: one aggregate per identity, plus a change feed.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use quiz_core::model::UserProgress;

use crate::error::SyncError;

/// The remote side of the merge. No schema beyond the aggregate shape is
/// assumed.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch the remote aggregate for `identity`, if one exists.
    ///
    /// # Errors
    ///
    /// Returns `SyncError` if the remote cannot be reached.
    async fn get_document(&self, identity: &str) -> Result<Option<UserProgress>, SyncError>;

    /// Replace the remote aggregate for `identity`.
    ///
    /// # Errors
    ///
    /// Returns `SyncError` if the remote cannot be reached or rejects the
    /// write.
    async fn put_document(&self, identity: &str, doc: &UserProgress) -> Result<(), SyncError>;

    /// Subscribe to change notifications for `identity`. Each tick means
    /// "the remote document may have changed; pull if you care".
    ///
    /// # Errors
    ///
    /// Returns `SyncError` if the subscription cannot be established.
    async fn changes(&self, identity: &str) -> Result<mpsc::Receiver<()>, SyncError>;
}

/// REST client for the remote document store.
#[derive(Debug, Clone)]
pub struct HttpRemoteStore {
    client: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
}

impl HttpRemoteStore {
    /// Build a client against `base_url`. The change feed is realized by
    /// polling at `poll_interval`.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Http` if the HTTP client cannot be constructed.
    pub fn new(base_url: impl Into<String>, poll_interval: Duration) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            poll_interval,
        })
    }

    fn document_url(&self, identity: &str) -> String {
        format!("{}/progress/{identity}", self.base_url)
    }
}

fn classify(err: reqwest::Error) -> SyncError {
    if err.is_timeout() {
        SyncError::RemoteTimeout
    } else {
        SyncError::Http(err)
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn get_document(&self, identity: &str) -> Result<Option<UserProgress>, SyncError> {
        let response = self
            .client
            .get(self.document_url(identity))
            .send()
            .await
            .map_err(classify)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(SyncError::RemoteUnavailable(format!(
                "GET returned {}",
                response.status()
            )));
        }
        // Decode failures are `Json`, distinct from transport errors: the
        // remote was reachable but served a malformed document.
        let body = response.bytes().await.map_err(classify)?;
        Ok(Some(serde_json::from_slice(&body)?))
    }

    async fn put_document(&self, identity: &str, doc: &UserProgress) -> Result<(), SyncError> {
        let response = self
            .client
            .put(self.document_url(identity))
            .json(doc)
            .send()
            .await
            .map_err(classify)?;
        if !response.status().is_success() {
            return Err(SyncError::RemoteUnavailable(format!(
                "PUT returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn changes(&self, identity: &str) -> Result<mpsc::Receiver<()>, SyncError> {
        let (tx, rx) = mpsc::channel(4);
        let interval = self.poll_interval;
        let identity = identity.to_owned();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if tx.send(()).await.is_err() {
                    debug!(%identity, "change feed subscriber dropped, stopping poll");
                    break;
                }
            }
        });
        Ok(rx)
    }
}

/// In-memory remote store for tests and offline development.
///
/// `set_available(false)` simulates an outage: every operation fails with
/// `RemoteUnavailable` until availability is restored.
pub struct MemoryRemoteStore {
    documents: Mutex<HashMap<String, UserProgress>>,
    changed: broadcast::Sender<String>,
    available: AtomicBool,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteStore {
    #[must_use]
    pub fn new() -> Self {
        let (changed, _) = broadcast::channel(16);
        Self {
            documents: Mutex::new(HashMap::new()),
            changed,
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Direct read of the stored document, bypassing availability.
    #[must_use]
    pub fn document(&self, identity: &str) -> Option<UserProgress> {
        self.documents
            .lock()
            .ok()
            .and_then(|docs| docs.get(identity).cloned())
    }

    /// Direct write, bypassing availability; notifies subscribers.
    pub fn insert_document(&self, identity: &str, doc: UserProgress) {
        if let Ok(mut docs) = self.documents.lock() {
            docs.insert(identity.to_owned(), doc);
        }
        let _ = self.changed.send(identity.to_owned());
    }

    fn check_available(&self) -> Result<(), SyncError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::RemoteUnavailable("simulated outage".to_owned()))
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn get_document(&self, identity: &str) -> Result<Option<UserProgress>, SyncError> {
        self.check_available()?;
        Ok(self.document(identity))
    }

    async fn put_document(&self, identity: &str, doc: &UserProgress) -> Result<(), SyncError> {
        self.check_available()?;
        self.documents
            .lock()
            .map_err(|e| SyncError::RemoteUnavailable(e.to_string()))?
            .insert(identity.to_owned(), doc.clone());
        let _ = self.changed.send(identity.to_owned());
        Ok(())
    }

    async fn changes(&self, identity: &str) -> Result<mpsc::Receiver<()>, SyncError> {
        self.check_available()?;
        let mut feed = self.changed.subscribe();
        let (tx, rx) = mpsc::channel(4);
        let identity = identity.to_owned();
        tokio::spawn(async move {
            while let Ok(changed_identity) = feed.recv().await {
                if changed_identity != identity {
                    continue;
                }
                if tx.send(()).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_body_maps_to_json_error() {
        let err = serde_json::from_slice::<UserProgress>(b"not a document").unwrap_err();
        assert!(matches!(SyncError::from(err), SyncError::Json(_)));
    }

    #[tokio::test]
    async fn memory_store_round_trips_documents() {
        let store = MemoryRemoteStore::new();
        assert_eq!(store.get_document("u1").await.unwrap(), None);

        let doc = UserProgress::default();
        store.put_document("u1", &doc).await.unwrap();
        assert_eq!(store.get_document("u1").await.unwrap(), Some(doc));
    }

    #[tokio::test]
    async fn outage_fails_operations_until_restored() {
        let store = MemoryRemoteStore::new();
        store.set_available(false);
        assert!(matches!(
            store.get_document("u1").await.unwrap_err(),
            SyncError::RemoteUnavailable(_)
        ));

        store.set_available(true);
        assert!(store.get_document("u1").await.is_ok());
    }

    #[tokio::test]
    async fn change_feed_ticks_on_put() {
        let store = MemoryRemoteStore::new();
        let mut feed = store.changes("u1").await.unwrap();

        store.put_document("u1", &UserProgress::default()).await.unwrap();
        assert_eq!(feed.recv().await, Some(()));

        // Other identities do not tick this feed.
        store.put_document("u2", &UserProgress::default()).await.unwrap();
        store.put_document("u1", &UserProgress::default()).await.unwrap();
        assert_eq!(feed.recv().await, Some(()));
    }
}
