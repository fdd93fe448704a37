//! The progress repository: single entry point for reading and mutating
//! one identity's learning progress.
//!
//! Every mutation follows the same shape: clone the cached aggregate,
//! apply the change, persist through the quota-aware gateway, then commit
//! the cache, emit an event, and nudge the sync engine. A persist failure
//! leaves the cached aggregate untouched.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use async_trait::async_trait;
use quiz_core::catalog::CategoryCatalog;
use quiz_core::model::{
    Answer, CategoryId, CategoryProgress, EXAM_HISTORY_RETENTION, ExamResult, IncorrectQuestion,
    MistakeSource, MockCategoryProgress, OvercomeQuestion, PersistedSession, QuestionId,
    SESSION_RETENTION, StudySession, UserProgress,
};
use quiz_core::repair::{RepairOptions, RepairOutcome, repair};
use quiz_core::time::{Clock, calendar_days_between};
use storage::migrate::{MigrationEngine, run_one_time_reset};
use storage::{KeyKind, StorageGateway, StorageInfo, StorageKey};
use sync::{LocalDocumentStore, SyncError, SyncHandle};

use crate::error::ServiceError;
use crate::events::{EventBus, EventSubscription, ProgressEvent};

/// What happens to a mistake entry once the question is answered correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OvercomePolicy {
    /// Move the entry to the overcome list.
    #[default]
    RemoveResolved,
    /// Keep the entry in review rotation; only bump its review count.
    RetainIncorrect,
}

#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    pub overcome_policy: OvercomePolicy,
    pub repair: RepairOptions,
    pub clock: Clock,
    /// Retention caps applied on write, mirroring quota cleanup.
    pub max_sessions: usize,
    pub max_exam_history: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            overcome_policy: OvercomePolicy::default(),
            repair: RepairOptions::default(),
            clock: Clock::default(),
            max_sessions: SESSION_RETENTION,
            max_exam_history: EXAM_HISTORY_RETENTION,
        }
    }
}

/// Provenance attached to a recorded answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnswerContext {
    pub source: MistakeSource,
    pub mock_number: Option<u32>,
}

/// Result of completing a session.
#[derive(Debug, Clone)]
pub struct CompletedSession {
    pub session: PersistedSession,
    /// Present for timed-exam sessions only.
    pub exam_result: Option<ExamResult>,
    pub current_streak: u32,
}

/// Result object for `reset_all`. Reset never throws.
#[derive(Debug, Clone)]
pub struct ResetOutcome {
    pub success: bool,
    pub message: String,
    pub changes: Vec<String>,
}

pub struct ProgressRepository {
    identity: String,
    gateway: StorageGateway,
    catalog: CategoryCatalog,
    config: RepositoryConfig,
    state: Mutex<Option<UserProgress>>,
    events: EventBus,
    sync: std::sync::Mutex<Option<SyncHandle>>,
}

impl ProgressRepository {
    #[must_use]
    pub fn new(
        identity: impl Into<String>,
        gateway: StorageGateway,
        catalog: CategoryCatalog,
        config: RepositoryConfig,
    ) -> Self {
        Self {
            identity: identity.into(),
            gateway,
            catalog,
            config,
            state: Mutex::new(None),
            events: EventBus::new(),
            sync: std::sync::Mutex::new(None),
        }
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    #[must_use]
    pub fn gateway(&self) -> &StorageGateway {
        &self.gateway
    }

    /// Subscribe to progress events. Dropping the subscription unsubscribes.
    #[must_use]
    pub fn subscribe(&self) -> EventSubscription {
        self.events.subscribe()
    }

    /// Wire up a running sync engine; committed mutations nudge it.
    pub fn attach_sync(&self, handle: SyncHandle) {
        if let Ok(mut slot) = self.sync.lock() {
            *slot = Some(handle);
        }
    }

    fn notify_sync(&self) {
        if let Ok(slot) = self.sync.lock() {
            if let Some(handle) = slot.as_ref() {
                handle.notify_change();
            }
        }
    }

    fn progress_key(&self) -> String {
        StorageKey::progress(&self.identity)
    }

    async fn persist(&self, aggregate: &UserProgress) -> Result<(), ServiceError> {
        let value = serde_json::to_value(aggregate)?;
        self.gateway.set(&self.progress_key(), &value).await?;
        Ok(())
    }

    /// Full load pipeline: one-time reset guard, migration, repair, seed.
    async fn load_from_storage(&self) -> Result<UserProgress, ServiceError> {
        if run_one_time_reset(&self.gateway, &self.identity).await? {
            debug!(identity = %self.identity, "one-time storage cleanup ran");
        }

        match self.read_normalized().await? {
            Some(aggregate) => Ok(aggregate),
            None => {
                info!(identity = %self.identity, "no stored progress, seeding from catalog");
                let seeded = UserProgress::seeded(&self.catalog);
                self.persist(&seeded).await?;
                Ok(seeded)
            }
        }
    }

    /// Read the stored document through migration and repair, persisting
    /// any corrections. Every read path goes through here so a legacy
    /// shape is never deserialized raw.
    async fn read_normalized(&self) -> Result<Option<UserProgress>, ServiceError> {
        let Some(mut raw) = self.gateway.get(&self.progress_key()).await? else {
            return Ok(None);
        };

        let report = MigrationEngine::new().run(&mut raw);
        let aggregate: UserProgress =
            serde_json::from_value(raw).map_err(|err| ServiceError::MalformedDocument {
                identity: self.identity.clone(),
                reason: err.to_string(),
            })?;

        let outcome = repair(&aggregate, &self.catalog, &self.config.repair);
        if !outcome.violations.is_empty() {
            warn!(
                identity = %self.identity,
                violations = outcome.violations.len(),
                "repaired invariant violations on load"
            );
        }
        let repaired_changed = outcome.changed(&aggregate);
        let aggregate = outcome.aggregate;

        if report.changed || repaired_changed {
            self.persist(&aggregate).await?;
        }
        Ok(Some(aggregate))
    }

    /// Load (or reload) the aggregate from storage.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError` on storage failure or a malformed document.
    pub async fn load(&self) -> Result<UserProgress, ServiceError> {
        let mut guard = self.state.lock().await;
        let aggregate = self.load_from_storage().await?;
        *guard = Some(aggregate.clone());
        drop(guard);
        self.events.emit(ProgressEvent::Loaded {
            identity: self.identity.clone(),
        });
        Ok(aggregate)
    }

    /// Current aggregate, loading it on first access.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError` on storage failure or a malformed document.
    pub async fn progress(&self) -> Result<UserProgress, ServiceError> {
        {
            let guard = self.state.lock().await;
            if let Some(aggregate) = guard.as_ref() {
                return Ok(aggregate.clone());
            }
        }
        self.load().await
    }

    /// Record one answered question.
    ///
    /// Per-category counters clamp at the catalog totals; the global
    /// counters are recomputed from the category sums so they never drift
    /// on the write path.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError` on storage failure.
    pub async fn record_answer(
        &self,
        question_id: QuestionId,
        category: CategoryId,
        correct: bool,
        context: AnswerContext,
    ) -> Result<(), ServiceError> {
        let now = self.config.clock.now();
        let mut guard = self.state.lock().await;
        let mut next = match guard.as_ref() {
            Some(aggregate) => aggregate.clone(),
            None => self.load_from_storage().await?,
        };

        // Categories outside the catalog stay unbounded until the catalog
        // learns them.
        let total = self
            .catalog
            .total_questions(&category)
            .unwrap_or(u32::MAX);
        next.category_progress
            .entry(category.clone())
            .or_insert_with(|| CategoryProgress::seeded(total))
            .record_answer(correct, now);
        next.answered_ids
            .entry(category.clone())
            .or_default()
            .insert(question_id.clone());

        let (answered, correct_sum) = next.category_sums();
        next.total_questions_answered = answered;
        next.correct_answers = correct_sum;

        self.apply_mistake_bookkeeping(&mut next, &question_id, &category, correct, context, now);

        self.persist(&next).await?;
        *guard = Some(next);
        drop(guard);

        self.events.emit(ProgressEvent::AnswerRecorded {
            category,
            correct,
        });
        self.notify_sync();
        Ok(())
    }

    /// Append an answer to a running session and record it in the
    /// aggregate in one step. Provenance is derived from the session:
    /// timed-exam sessions tag their mistakes with the mock number.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::AlreadyCompleted` for a finished session,
    /// or `ServiceError` on storage failure.
    pub async fn record_session_answer(
        &self,
        session: &mut StudySession,
        answer: Answer,
    ) -> Result<(), ServiceError> {
        session.push_answer(answer.clone())?;
        let context = if session.mode.is_timed_exam() {
            AnswerContext {
                source: MistakeSource::Mock,
                mock_number: session.mock_number,
            }
        } else {
            AnswerContext::default()
        };
        self.record_answer(answer.question_id, answer.category, answer.correct, context)
            .await
    }

    fn apply_mistake_bookkeeping(
        &self,
        next: &mut UserProgress,
        question_id: &QuestionId,
        category: &CategoryId,
        correct: bool,
        context: AnswerContext,
        now: DateTime<Utc>,
    ) {
        let position = next
            .incorrect_questions
            .iter()
            .position(|e| &e.question_id == question_id);

        if correct {
            let Some(idx) = position else { return };
            match self.config.overcome_policy {
                OvercomePolicy::RemoveResolved => {
                    let resolved = next.incorrect_questions.remove(idx);
                    upsert_overcome(&mut next.overcome_questions, resolved, now);
                }
                OvercomePolicy::RetainIncorrect => {
                    let entry = &mut next.incorrect_questions[idx];
                    entry.review_count = entry.review_count.saturating_add(1);
                }
            }
        } else {
            match position {
                Some(idx) => next.incorrect_questions[idx].record_miss(
                    context.source,
                    context.mock_number,
                    now,
                ),
                None => next.incorrect_questions.push(IncorrectQuestion::first(
                    question_id.clone(),
                    category.clone(),
                    context.source,
                    context.mock_number,
                    now,
                )),
            }
            // A question missed again is no longer overcome.
            next.overcome_questions
                .retain(|e| &e.question_id != question_id);
        }
    }

    /// Complete a session: persist its id-only shape, advance the daily
    /// streak, and for timed-exam modes record the attempt and refresh the
    /// category rollup.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError` on storage failure.
    pub async fn complete_session(
        &self,
        mut session: StudySession,
    ) -> Result<CompletedSession, ServiceError> {
        if session.completed_at.is_none() {
            session.completed_at = Some(self.config.clock.now());
        }
        let persisted = session.to_persisted()?;
        let completed_at = persisted.completed_at;

        let mut guard = self.state.lock().await;
        let mut next = match guard.as_ref() {
            Some(aggregate) => aggregate.clone(),
            None => self.load_from_storage().await?,
        };

        advance_streak(&mut next, completed_at);

        let exam_result = if session.mode.is_timed_exam() {
            let total = u32::try_from(session.answers.len()).unwrap_or(u32::MAX);
            let result = ExamResult::from_counts(
                session.mock_number.unwrap_or(1),
                persisted.category.clone(),
                total,
                session.correct_count(),
                self.catalog.pass_threshold(&persisted.category),
                completed_at,
            );
            next.exam_history.push(result.clone());
            truncate_front(&mut next.exam_history, self.config.max_exam_history);
            self.refresh_rollup(&mut next, &persisted.category);
            Some(result)
        } else {
            None
        };

        next.study_sessions.push(persisted.clone());
        truncate_front(&mut next.study_sessions, self.config.max_sessions);

        self.persist(&next).await?;
        let current_streak = next.current_streak;
        *guard = Some(next);
        drop(guard);

        self.events.emit(ProgressEvent::SessionCompleted {
            session_id: persisted.id,
            mode: persisted.mode,
        });
        self.notify_sync();
        Ok(CompletedSession {
            session: persisted,
            exam_result,
            current_streak,
        })
    }

    fn refresh_rollup(&self, next: &mut UserProgress, category: &CategoryId) {
        let results: Vec<ExamResult> = next
            .exam_results_for(category)
            .into_iter()
            .cloned()
            .collect();
        let total = self
            .catalog
            .total_questions(category)
            .or_else(|| results.iter().map(|r| r.total_questions).max())
            .unwrap_or(0);
        next.mock_category_progress.insert(
            category.clone(),
            MockCategoryProgress::from_results(total, &results),
        );
    }

    /// Reset everything except preferences back to the seeded zero state.
    ///
    /// Repeating a reset is harmless and reports no changes.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError` on storage failure.
    pub async fn reset_all(&self) -> Result<ResetOutcome, ServiceError> {
        let mut guard = self.state.lock().await;
        let current = match guard.as_ref() {
            Some(aggregate) => aggregate.clone(),
            None => self.load_from_storage().await?,
        };

        let mut fresh = UserProgress::seeded(&self.catalog);
        fresh.preferences = current.preferences.clone();

        let mut changes = Vec::new();
        if current.total_questions_answered > 0 {
            changes.push(format!(
                "cleared {} answered questions",
                current.total_questions_answered
            ));
        }
        if !current.study_sessions.is_empty() {
            changes.push(format!("removed {} sessions", current.study_sessions.len()));
        }
        if !current.exam_history.is_empty() {
            changes.push(format!(
                "removed {} exam attempts",
                current.exam_history.len()
            ));
        }
        if !current.incorrect_questions.is_empty() || !current.overcome_questions.is_empty() {
            changes.push(format!(
                "cleared {} mistake records",
                current.incorrect_questions.len() + current.overcome_questions.len()
            ));
        }
        if current.current_streak > 0 || current.best_streak > 0 {
            changes.push("reset streaks".to_owned());
        }

        if current == fresh {
            return Ok(ResetOutcome {
                success: true,
                message: "progress already at zero state".to_owned(),
                changes,
            });
        }

        self.persist(&fresh).await?;
        self.drop_ephemeral_keys().await?;
        *guard = Some(fresh);
        drop(guard);

        info!(identity = %self.identity, "progress reset");
        self.events.emit(ProgressEvent::Reset);
        self.notify_sync();
        Ok(ResetOutcome {
            success: true,
            message: "progress reset, preferences kept".to_owned(),
            changes,
        })
    }

    async fn drop_ephemeral_keys(&self) -> Result<(), ServiceError> {
        let prefix = format!("{}:", self.identity);
        for key in self.gateway.keys().await? {
            if key.starts_with(&prefix)
                && matches!(
                    StorageKey::classify(&key),
                    KeyKind::Scratch | KeyKind::Cache
                )
            {
                self.gateway.remove(&key).await?;
            }
        }
        Ok(())
    }

    /// Scan the current aggregate without persisting corrections.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError` on storage failure.
    pub async fn check_integrity(&self) -> Result<RepairOutcome, ServiceError> {
        let aggregate = self.progress().await?;
        Ok(repair(&aggregate, &self.catalog, &self.config.repair))
    }

    /// Repair the aggregate and persist the corrected copy if it changed.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError` on storage failure.
    pub async fn repair_and_save(&self) -> Result<RepairOutcome, ServiceError> {
        let mut guard = self.state.lock().await;
        let current = match guard.as_ref() {
            Some(aggregate) => aggregate.clone(),
            None => self.load_from_storage().await?,
        };
        let outcome = repair(&current, &self.catalog, &self.config.repair);
        if outcome.changed(&current) {
            self.persist(&outcome.aggregate).await?;
            *guard = Some(outcome.aggregate.clone());
            drop(guard);
            self.notify_sync();
        }
        Ok(outcome)
    }

    /// Storage usage against the configured budget.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError` on storage failure.
    pub async fn storage_info(&self) -> Result<StorageInfo, ServiceError> {
        Ok(self.gateway.storage_info().await?)
    }
}

/// The repository doubles as the local side of the sync merge.
#[async_trait]
impl LocalDocumentStore for ProgressRepository {
    async fn load_local(&self) -> Result<Option<UserProgress>, SyncError> {
        {
            let guard = self.state.lock().await;
            if let Some(aggregate) = guard.as_ref() {
                return Ok(Some(aggregate.clone()));
            }
        }
        // Same pipeline as `load`: a legacy document read raw here would
        // lose its pre-migration fields once the merged copy is stored.
        self.read_normalized()
            .await
            .map_err(|e| SyncError::Local(e.to_string()))
    }

    async fn store_local(&self, doc: &UserProgress) -> Result<(), SyncError> {
        let mut guard = self.state.lock().await;
        self.persist(doc)
            .await
            .map_err(|e| SyncError::Local(e.to_string()))?;
        *guard = Some(doc.clone());
        drop(guard);
        self.events.emit(ProgressEvent::Loaded {
            identity: self.identity.clone(),
        });
        Ok(())
    }
}

/// Streak rule: same calendar day keeps the streak, the next day extends
/// it, any other gap (including clock regressions) restarts at one.
fn advance_streak(progress: &mut UserProgress, completed_at: DateTime<Utc>) {
    progress.current_streak = match progress.last_study_date {
        None => 1,
        Some(last) => match calendar_days_between(last, completed_at) {
            0 => progress.current_streak.max(1),
            1 => progress.current_streak.saturating_add(1),
            _ => 1,
        },
    };
    progress.best_streak = progress.best_streak.max(progress.current_streak);
    progress.last_study_date = Some(completed_at);
}

fn truncate_front<T>(entries: &mut Vec<T>, limit: usize) {
    if entries.len() > limit {
        let excess = entries.len() - limit;
        entries.drain(..excess);
    }
}

fn upsert_overcome(
    list: &mut Vec<OvercomeQuestion>,
    resolved: IncorrectQuestion,
    now: DateTime<Utc>,
) {
    if let Some(existing) = list
        .iter_mut()
        .find(|e| e.question_id == resolved.question_id)
    {
        existing.overcome_date = now;
        existing.previous_incorrect_count = resolved.incorrect_count;
        existing.review_count = existing.review_count.saturating_add(1);
    } else {
        list.push(OvercomeQuestion {
            question_id: resolved.question_id,
            category: resolved.category,
            overcome_date: now,
            previous_incorrect_count: resolved.incorrect_count,
            review_count: resolved.review_count,
        });
    }
}

/// Convenience constructor wiring a repository into a spawned sync engine.
#[must_use]
pub fn attach_sync_engine(
    repository: Arc<ProgressRepository>,
    config: sync::SyncConfig,
    remote: Arc<dyn sync::RemoteStore>,
) -> SyncHandle {
    let handle = sync::spawn(
        repository.identity().to_owned(),
        config,
        remote,
        Arc::clone(&repository) as Arc<dyn LocalDocumentStore>,
    );
    repository.attach_sync(handle.clone());
    handle
}
