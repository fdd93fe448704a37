//! Repository wired into a live sync engine.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use quiz_core::catalog::{CatalogEntry, CategoryCatalog};
use quiz_core::model::{CategoryId, MistakeSource, QuestionId, UserProgress};
use services::{AnswerContext, ProgressRepository, RepositoryConfig, attach_sync_engine};
use storage::{QuotaConfig, StorageGateway, StorageKey};
use sync::{MemoryRemoteStore, SyncConfig, SyncHandle, SyncState};

fn catalog() -> CategoryCatalog {
    CategoryCatalog::new(vec![CatalogEntry::new(CategoryId::new("grammar"), 42)])
}

fn fast_sync() -> SyncConfig {
    SyncConfig {
        debounce: Duration::from_millis(20),
        ..SyncConfig::default()
    }
}

async fn wait_for_synced(handle: &SyncHandle) {
    let mut states = handle.subscribe_state();
    timeout(Duration::from_secs(2), async {
        while *states.borrow() != SyncState::Synced {
            states.changed().await.unwrap();
        }
    })
    .await
    .expect("engine never connected");
}

#[tokio::test]
async fn recorded_answers_reach_the_remote_store() {
    let repo = Arc::new(ProgressRepository::new(
        "u1",
        StorageGateway::in_memory(QuotaConfig::default()),
        catalog(),
        RepositoryConfig::default(),
    ));
    repo.load().await.unwrap();

    let remote = Arc::new(MemoryRemoteStore::new());
    let handle = attach_sync_engine(Arc::clone(&repo), fast_sync(), Arc::clone(&remote) as _);
    wait_for_synced(&handle).await;

    repo.record_answer(
        QuestionId::new("Q1"),
        CategoryId::new("grammar"),
        true,
        AnswerContext::default(),
    )
    .await
    .unwrap();

    timeout(Duration::from_secs(2), async {
        loop {
            if remote
                .document("u1")
                .is_some_and(|d| d.total_questions_answered == 1)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("answer never reached the remote");

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn legacy_document_keeps_mock_mistakes_when_synced_before_first_load() {
    let gateway = StorageGateway::in_memory(QuotaConfig::default());
    gateway
        .set(
            &StorageKey::progress("u1"),
            &json!({
                "incorrectQuestions": [],
                "mockIncorrectQuestions": [
                    {"questionId": "Q1", "category": "grammar", "incorrectCount": 2,
                     "lastIncorrectDate": "2023-11-14T22:13:20Z", "mockNumber": 1}
                ]
            }),
        )
        .await
        .unwrap();

    let repo = Arc::new(ProgressRepository::new(
        "u1",
        gateway,
        catalog(),
        RepositoryConfig::default(),
    ));

    // Another device already pushed a document; the first cycle merges.
    let remote = Arc::new(MemoryRemoteStore::new());
    let mut other_device = UserProgress::default();
    other_device.best_streak = 4;
    remote.insert_document("u1", other_device);

    let handle = attach_sync_engine(Arc::clone(&repo), fast_sync(), Arc::clone(&remote) as _);
    wait_for_synced(&handle).await;

    // The mock mistake survived the merge with its provenance intact.
    let progress = repo.progress().await.unwrap();
    assert_eq!(progress.best_streak, 4);
    let entry = progress
        .incorrect_entry(&QuestionId::new("Q1"))
        .expect("mock mistake lost during sync");
    assert_eq!(entry.source, MistakeSource::Mock);
    assert_eq!(entry.mock_number, Some(1));

    timeout(Duration::from_secs(2), async {
        loop {
            if remote
                .document("u1")
                .is_some_and(|d| d.incorrect_entry(&QuestionId::new("Q1")).is_some())
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("merged document never pushed");

    handle.stop().await.unwrap();
}
