//! End-to-end engine flows against the in-memory remote store.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;

use quiz_core::model::UserProgress;
use sync::{
    LocalDocumentStore, MemoryRemoteStore, SyncConfig, SyncError, SyncHandle, SyncState, spawn,
};

struct MemoryLocalStore {
    doc: Mutex<Option<UserProgress>>,
}

impl MemoryLocalStore {
    fn new(doc: Option<UserProgress>) -> Self {
        Self {
            doc: Mutex::new(doc),
        }
    }

    fn snapshot(&self) -> Option<UserProgress> {
        self.doc.lock().unwrap().clone()
    }
}

#[async_trait]
impl LocalDocumentStore for MemoryLocalStore {
    async fn load_local(&self) -> Result<Option<UserProgress>, SyncError> {
        Ok(self.snapshot())
    }

    async fn store_local(&self, doc: &UserProgress) -> Result<(), SyncError> {
        *self.doc.lock().unwrap() = Some(doc.clone());
        Ok(())
    }
}

fn test_config() -> SyncConfig {
    SyncConfig {
        debounce: Duration::from_millis(20),
        connect_timeout: Duration::from_millis(500),
        reconnect_timeout: Duration::from_millis(500),
        ..SyncConfig::default()
    }
}

async fn wait_for_state(handle: &SyncHandle, wanted: SyncState) {
    let mut rx = handle.subscribe_state();
    timeout(Duration::from_secs(2), async {
        while *rx.borrow() != wanted {
            rx.changed().await.expect("engine dropped state channel");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("engine never reached {wanted:?}"));
}

/// A mutation made while the engine is offline reaches the remote after a
/// single reconnect cycle, merged with whatever landed remotely meanwhile.
#[tokio::test]
async fn offline_mutation_survives_reconnect() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let local = Arc::new(MemoryLocalStore::new(Some(UserProgress::default())));

    let handle = spawn(
        "u1",
        test_config(),
        Arc::clone(&remote) as _,
        Arc::clone(&local) as _,
    );
    wait_for_state(&handle, SyncState::Synced).await;

    // The network drops.
    remote.set_available(false);
    handle.set_online(false).await.unwrap();
    wait_for_state(&handle, SyncState::Offline).await;

    // A local mutation lands while offline; it must not block.
    let mut mutated = local.snapshot().unwrap();
    mutated.total_questions_answered = 12;
    mutated.correct_answers = 9;
    local.store_local(&mutated).await.unwrap();
    handle.notify_change();

    // Meanwhile another device pushed progress of its own.
    let mut other_device = UserProgress::default();
    other_device.best_streak = 4;
    remote.insert_document("u1", other_device);

    // Connectivity returns: one pull-merge-push cycle.
    remote.set_available(true);
    handle.set_online(true).await.unwrap();
    wait_for_state(&handle, SyncState::Synced).await;

    let remote_doc = remote.document("u1").expect("remote document after reconnect");
    assert_eq!(remote_doc.total_questions_answered, 12);
    assert_eq!(remote_doc.correct_answers, 9);
    assert_eq!(remote_doc.best_streak, 4);

    let local_doc = local.snapshot().unwrap();
    assert_eq!(local_doc.best_streak, 4);

    handle.stop().await.unwrap();
    wait_for_state(&handle, SyncState::Disconnected).await;
}

/// A remote change while synced is pulled, merged, and only pushed back if
/// the merge actually changed the remote side. This keeps two engines from
/// ping-ponging the same document forever.
#[tokio::test]
async fn remote_change_is_pulled_without_echo() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let local = Arc::new(MemoryLocalStore::new(Some(UserProgress::default())));

    let handle = spawn(
        "u1",
        test_config(),
        Arc::clone(&remote) as _,
        Arc::clone(&local) as _,
    );
    wait_for_state(&handle, SyncState::Synced).await;

    let mut remote_doc = UserProgress::default();
    remote_doc.total_questions_answered = 30;
    remote.insert_document("u1", remote_doc);

    timeout(Duration::from_secs(2), async {
        loop {
            if local
                .snapshot()
                .is_some_and(|d| d.total_questions_answered == 30)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("remote change never reached the local store");

    assert_eq!(handle.state(), SyncState::Synced);
    handle.stop().await.unwrap();
}

/// An explicit retry while offline runs one fresh cycle and recovers.
#[tokio::test]
async fn explicit_retry_recovers_from_offline() {
    let remote = Arc::new(MemoryRemoteStore::new());
    remote.set_available(false);
    let local = Arc::new(MemoryLocalStore::new(Some(UserProgress::default())));

    let handle = spawn(
        "u1",
        test_config(),
        Arc::clone(&remote) as _,
        Arc::clone(&local) as _,
    );
    wait_for_state(&handle, SyncState::Offline).await;

    // Retrying against a dead remote stays offline.
    handle.retry().await.unwrap();
    wait_for_state(&handle, SyncState::Offline).await;

    remote.set_available(true);
    handle.retry().await.unwrap();
    wait_for_state(&handle, SyncState::Synced).await;
    assert!(remote.document("u1").is_some());

    handle.stop().await.unwrap();
}
