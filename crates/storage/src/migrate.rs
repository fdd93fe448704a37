//! Document-shape migrations for the progress aggregate.
//!
//! Runs on the raw JSON before deserialization. Legacy documents carry no
//! version stamp at all, so detection falls back to an explicit shape rule;
//! documents written by this implementation are stamped with
//! `schemaVersion` and skip the pipeline entirely.

use serde_json::Value;
use tracing::{debug, info, warn};

use quiz_core::model::{CURRENT_SCHEMA_VERSION, ExamResult, MockCategoryProgress};

use crate::backend::StorageError;
use crate::gateway::StorageGateway;
use crate::keys::{KeyKind, StorageKey};

/// Result object for a migration run. Migrations never throw: a pipeline
/// that cannot complete leaves the document usable against its legacy
/// fields and reports `incomplete`.
#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub version_before: u32,
    pub applied: Vec<&'static str>,
    pub changed: bool,
    pub incomplete: bool,
    pub message: String,
}

impl MigrationReport {
    fn untouched(version: u32, message: impl Into<String>) -> Self {
        Self {
            version_before: version,
            applied: Vec::new(),
            changed: false,
            incomplete: false,
            message: message.into(),
        }
    }
}

/// Explicit schema version if stamped; 0 (legacy) otherwise.
#[must_use]
pub fn detect_schema_version(doc: &Value) -> u32 {
    doc.get("schemaVersion")
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0)
}

/// Shape rule for unversioned documents: mock-specific mistake collections,
/// or incorrect entries without a provenance tag, mark a legacy shape.
#[must_use]
pub fn looks_legacy(doc: &Value) -> bool {
    if doc.get("mockIncorrectQuestions").is_some() || doc.get("mockOvercomeQuestions").is_some() {
        return true;
    }
    doc.get("incorrectQuestions")
        .and_then(Value::as_array)
        .is_some_and(|entries| entries.iter().any(|e| e.get("source").is_none()))
}

/// Idempotent, ordered schema migrations over the raw document.
#[derive(Debug, Clone, Copy, Default)]
pub struct MigrationEngine;

impl MigrationEngine {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Run every applicable step and stamp the current schema version.
    ///
    /// Running the pipeline twice on the same document produces zero
    /// further changes.
    pub fn run(&self, doc: &mut Value) -> MigrationReport {
        let version = detect_schema_version(doc);
        if !doc.is_object() {
            warn!("progress document is not a JSON object, skipping migration");
            let mut report = MigrationReport::untouched(version, "document is not an object");
            report.incomplete = true;
            return report;
        }
        // An explicit version stamp is trusted outright; the shape rule only
        // applies to unversioned documents.
        if version >= CURRENT_SCHEMA_VERSION {
            return MigrationReport::untouched(version, "already at current schema");
        }

        // The mistake-unification steps only make sense on the legacy
        // shape; the rollup rebuild guards itself against fresh summaries.
        let unify_mistakes = looks_legacy(doc);

        let mut report = MigrationReport::untouched(version, "");
        let steps: [(&'static str, fn(&mut Value) -> bool, bool); 3] = [
            ("merge-mock-collections", merge_mock_collections, unify_mistakes),
            ("backfill-source", backfill_source, unify_mistakes),
            ("rebuild-mock-rollups", rebuild_mock_rollups, true),
        ];
        for (name, step, applicable) in steps {
            if applicable && step(doc) {
                debug!(step = name, "migration step changed document");
                report.applied.push(name);
                report.changed = true;
            }
        }

        if detect_schema_version(doc) != CURRENT_SCHEMA_VERSION {
            if let Some(obj) = doc.as_object_mut() {
                obj.insert(
                    "schemaVersion".to_owned(),
                    Value::from(CURRENT_SCHEMA_VERSION),
                );
                report.changed = true;
            }
        }

        report.message = if report.applied.is_empty() {
            "stamped schema version".to_owned()
        } else {
            format!("applied: {}", report.applied.join(", "))
        };
        info!(
            version_before = report.version_before,
            changed = report.changed,
            "migration pipeline finished"
        );
        report
    }
}

/// Step 1: fold `mockIncorrectQuestions`/`mockOvercomeQuestions` into the
/// unified collections, tagging provenance, matched by `questionId`.
fn merge_mock_collections(doc: &mut Value) -> bool {
    let Some(obj) = doc.as_object_mut() else {
        return false;
    };
    let mut changed = false;

    if let Some(Value::Array(mock_entries)) = obj.remove("mockIncorrectQuestions") {
        changed = true;
        let unified = obj
            .entry("incorrectQuestions")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(unified) = unified {
            for mut entry in mock_entries {
                let Some(id) = entry.get("questionId").cloned() else {
                    continue;
                };
                let already_present = unified
                    .iter()
                    .any(|e| e.get("questionId") == Some(&id));
                if already_present {
                    continue;
                }
                if let Some(e) = entry.as_object_mut() {
                    e.insert("source".to_owned(), Value::from("mock"));
                }
                unified.push(entry);
            }
        }
    }

    if let Some(Value::Array(mock_entries)) = obj.remove("mockOvercomeQuestions") {
        changed = true;
        let unified = obj
            .entry("overcomeQuestions")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(unified) = unified {
            for entry in mock_entries {
                let Some(id) = entry.get("questionId").cloned() else {
                    continue;
                };
                if !unified.iter().any(|e| e.get("questionId") == Some(&id)) {
                    unified.push(entry);
                }
            }
        }
    }

    changed
}

/// Step 2: untagged legacy entries default to category practice.
fn backfill_source(doc: &mut Value) -> bool {
    let Some(Value::Array(entries)) = doc.get_mut("incorrectQuestions") else {
        return false;
    };
    let mut changed = false;
    for entry in entries {
        if let Some(e) = entry.as_object_mut() {
            if !e.contains_key("source") {
                e.insert("source".to_owned(), Value::from("category"));
                changed = true;
            }
        }
    }
    changed
}

/// Step 3: rebuild `mockCategoryProgress` rollups from raw exam records
/// when the summary is absent or older than the latest attempt.
fn rebuild_mock_rollups(doc: &mut Value) -> bool {
    let results: Vec<ExamResult> = doc
        .get("examHistory")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| serde_json::from_value(e.clone()).ok())
                .collect()
        })
        .unwrap_or_default();
    if results.is_empty() {
        return false;
    }

    let Some(obj) = doc.as_object_mut() else {
        return false;
    };
    let rollups = obj
        .entry("mockCategoryProgress")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    let Some(rollups) = rollups.as_object_mut() else {
        return false;
    };

    let mut categories: Vec<_> = results.iter().map(|r| r.category.clone()).collect();
    categories.sort();
    categories.dedup();

    let mut changed = false;
    for category in categories {
        let for_category: Vec<ExamResult> = results
            .iter()
            .filter(|r| r.category == category)
            .cloned()
            .collect();
        let latest_attempt = for_category.iter().map(|r| r.taken_at).max();

        let existing = rollups.get(category.as_str());
        let summary_date = existing
            .and_then(|s| s.get("lastAttemptDate"))
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<chrono::DateTime<chrono::Utc>>().ok());
        let stale = match (summary_date, latest_attempt) {
            (None, _) => true,
            (Some(summary), Some(latest)) => summary < latest,
            (Some(_), None) => false,
        };
        if !stale {
            continue;
        }

        let total_questions = existing
            .and_then(|s| s.get("totalQuestions"))
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or_else(|| {
                for_category
                    .iter()
                    .map(|r| r.total_questions)
                    .max()
                    .unwrap_or(0)
            });
        let rebuilt = MockCategoryProgress::from_results(total_questions, &for_category);
        match serde_json::to_value(&rebuilt) {
            Ok(value) => {
                rollups.insert(category.as_str().to_owned(), value);
                changed = true;
            }
            Err(err) => warn!(category = %category, error = %err, "failed to encode rebuilt rollup"),
        }
    }
    changed
}

/// Name of the persisted guard for the one-time dataset-wide migration.
pub const FULL_RESET_FLAG: &str = "full-reset-applied";

/// One-time dataset-wide cleanup: drops every ephemeral key left behind by
/// pre-migration clients. Guarded by a persisted meta flag so it never
/// re-runs across reloads.
///
/// Returns whether the purge ran on this call.
///
/// # Errors
///
/// Returns `StorageError` on gateway failure.
pub async fn run_one_time_reset(
    gateway: &StorageGateway,
    identity: &str,
) -> Result<bool, StorageError> {
    let flag_key = StorageKey::meta(identity, FULL_RESET_FLAG);
    if gateway.get(&flag_key).await?.is_some() {
        return Ok(false);
    }

    let prefix = format!("{identity}:");
    for key in gateway.keys().await? {
        if !key.starts_with(&prefix) {
            continue;
        }
        if matches!(
            StorageKey::classify(&key),
            KeyKind::Scratch | KeyKind::Cache | KeyKind::Unknown
        ) {
            debug!(%key, "one-time reset removing stale key");
            gateway.remove(&key).await?;
        }
    }

    gateway.set(&flag_key, &Value::Bool(true)).await?;
    info!(%identity, "one-time dataset reset applied");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn legacy_mock_entry_merges_with_provenance() {
        let mut doc = json!({
            "incorrectQuestions": [],
            "mockIncorrectQuestions": [
                {"questionId": "Q1", "category": "grammar", "incorrectCount": 1,
                 "lastIncorrectDate": "2023-11-14T22:13:20Z", "mockNumber": 2}
            ]
        });

        let report = MigrationEngine::new().run(&mut doc);

        assert!(report.changed);
        assert!(report.applied.contains(&"merge-mock-collections"));
        assert!(doc.get("mockIncorrectQuestions").is_none());
        let unified = doc["incorrectQuestions"].as_array().unwrap();
        assert_eq!(unified.len(), 1);
        assert_eq!(unified[0]["source"], "mock");
        assert_eq!(unified[0]["mockNumber"], 2);
        assert_eq!(detect_schema_version(&doc), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn merge_skips_questions_already_unified() {
        let mut doc = json!({
            "incorrectQuestions": [
                {"questionId": "Q1", "source": "category"}
            ],
            "mockIncorrectQuestions": [
                {"questionId": "Q1", "mockNumber": 3}
            ]
        });

        MigrationEngine::new().run(&mut doc);

        let unified = doc["incorrectQuestions"].as_array().unwrap();
        assert_eq!(unified.len(), 1);
        assert_eq!(unified[0]["source"], "category");
    }

    #[test]
    fn untagged_entries_backfilled_as_category() {
        let mut doc = json!({
            "incorrectQuestions": [
                {"questionId": "Q1"},
                {"questionId": "Q2", "source": "mock"}
            ]
        });

        let report = MigrationEngine::new().run(&mut doc);

        assert!(report.applied.contains(&"backfill-source"));
        let entries = doc["incorrectQuestions"].as_array().unwrap();
        assert_eq!(entries[0]["source"], "category");
        assert_eq!(entries[1]["source"], "mock");
    }

    #[test]
    fn rollup_rebuilt_from_exam_history() {
        let mut doc = json!({
            "examHistory": [
                {"mockNumber": 1, "category": "grammar", "totalQuestions": 10,
                 "correctCount": 8, "scorePercent": 80.0, "passed": true,
                 "takenAt": "2023-11-14T22:13:20Z"},
                {"mockNumber": 2, "category": "grammar", "totalQuestions": 10,
                 "correctCount": 5, "scorePercent": 50.0, "passed": false,
                 "takenAt": "2023-11-15T22:13:20Z"}
            ]
        });

        let report = MigrationEngine::new().run(&mut doc);

        assert!(report.applied.contains(&"rebuild-mock-rollups"));
        let rollup = &doc["mockCategoryProgress"]["grammar"];
        assert_eq!(rollup["attemptsCount"], 2);
        assert_eq!(rollup["bestScore"], 80.0);
        assert_eq!(rollup["latestScore"], 50.0);
        assert_eq!(rollup["passedCount"], 1);
    }

    #[test]
    fn fresh_summary_is_not_rebuilt() {
        let mut doc = json!({
            "examHistory": [
                {"mockNumber": 1, "category": "grammar", "totalQuestions": 10,
                 "correctCount": 8, "scorePercent": 80.0, "passed": true,
                 "takenAt": "2023-11-14T22:13:20Z"}
            ],
            "mockCategoryProgress": {
                "grammar": {
                    "totalQuestions": 10, "attemptsCount": 5, "bestScore": 90.0,
                    "latestScore": 80.0, "averageScore": 85.0, "passedCount": 5,
                    "lastAttemptDate": "2023-11-20T00:00:00Z"
                }
            }
        });

        MigrationEngine::new().run(&mut doc);

        // Summary is newer than the last recorded attempt; left alone.
        assert_eq!(doc["mockCategoryProgress"]["grammar"]["attemptsCount"], 5);
    }

    #[test]
    fn pipeline_is_idempotent() {
        let mut doc = json!({
            "incorrectQuestions": [{"questionId": "Q1"}],
            "mockIncorrectQuestions": [{"questionId": "Q2", "mockNumber": 1}],
            "examHistory": [
                {"mockNumber": 1, "category": "grammar", "totalQuestions": 10,
                 "correctCount": 8, "scorePercent": 80.0, "passed": true,
                 "takenAt": "2023-11-14T22:13:20Z"}
            ]
        });

        let first = MigrationEngine::new().run(&mut doc);
        assert!(first.changed);
        let snapshot = doc.clone();

        let second = MigrationEngine::new().run(&mut doc);
        assert!(!second.changed);
        assert!(second.applied.is_empty());
        assert_eq!(doc, snapshot);
    }

    #[test]
    fn stamped_document_skips_pipeline() {
        let mut doc = json!({
            "schemaVersion": CURRENT_SCHEMA_VERSION,
            "incorrectQuestions": [{"questionId": "Q1", "source": "category"}]
        });
        let report = MigrationEngine::new().run(&mut doc);
        assert!(!report.changed);
    }

    #[test]
    fn unified_shape_is_stamped_without_rewrites() {
        let mut doc = json!({
            "incorrectQuestions": [
                {"questionId": "Q1", "source": "category"}
            ]
        });

        let report = MigrationEngine::new().run(&mut doc);

        // Unversioned but already unified: only the version stamp changes.
        assert!(report.changed);
        assert!(report.applied.is_empty());
        assert_eq!(report.message, "stamped schema version");
        assert_eq!(detect_schema_version(&doc), CURRENT_SCHEMA_VERSION);
        assert_eq!(doc["incorrectQuestions"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn shape_detection_flags_legacy_documents() {
        assert!(looks_legacy(&json!({"mockIncorrectQuestions": []})));
        assert!(looks_legacy(&json!({
            "incorrectQuestions": [{"questionId": "Q1"}]
        })));
        assert!(!looks_legacy(&json!({
            "incorrectQuestions": [{"questionId": "Q1", "source": "mock"}]
        })));
        assert!(!looks_legacy(&json!({"totalQuestionsAnswered": 3})));
    }
}
