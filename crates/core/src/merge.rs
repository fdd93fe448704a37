//! Field-wise reconciliation of two copies of the aggregate.
//!
//! The `use_higher` rule must stay commutative and idempotent: sync has no
//! distributed transactions, so concurrent devices converge only because
//! applying the same merge from either side yields the same document.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{
    CategoryProgress, EXAM_HISTORY_RETENTION, ExamResult, IncorrectQuestion, MockCategoryProgress,
    OvercomeQuestion, PersistedSession, SESSION_RETENTION, UserProgress,
};

/// How to reconcile a divergent local and remote aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Take the remote document wholesale.
    TrustRemote,
    /// Keep the local document wholesale.
    TrustLocal,
    /// Field-wise: maximum for monotonic counters, union-by-key for
    /// collections keeping the later-stamped entry.
    #[default]
    UseHigher,
}

/// Merge `local` and `remote` according to `strategy`.
#[must_use]
pub fn merge(local: &UserProgress, remote: &UserProgress, strategy: MergeStrategy) -> UserProgress {
    match strategy {
        MergeStrategy::TrustRemote => remote.clone(),
        MergeStrategy::TrustLocal => local.clone(),
        MergeStrategy::UseHigher => merge_use_higher(local, remote),
    }
}

fn merge_use_higher(local: &UserProgress, remote: &UserProgress) -> UserProgress {
    // Streak and preferences are not monotonic; they follow whichever side
    // studied more recently.
    let remote_is_fresher = remote.last_study_date > local.last_study_date;
    let fresher = if remote_is_fresher { remote } else { local };

    let mut merged = UserProgress {
        schema_version: local.schema_version.max(remote.schema_version),
        total_questions_answered: local
            .total_questions_answered
            .max(remote.total_questions_answered),
        correct_answers: local.correct_answers.max(remote.correct_answers),
        category_progress: merge_keyed(
            &local.category_progress,
            &remote.category_progress,
            merge_category,
        ),
        mock_category_progress: merge_keyed(
            &local.mock_category_progress,
            &remote.mock_category_progress,
            merge_mock,
        ),
        study_sessions: Vec::new(),
        incorrect_questions: Vec::new(),
        overcome_questions: Vec::new(),
        exam_history: Vec::new(),
        answered_ids: BTreeMap::new(),
        current_streak: fresher.current_streak,
        best_streak: local.best_streak.max(remote.best_streak),
        last_study_date: local.last_study_date.max(remote.last_study_date),
        preferences: fresher.preferences.clone(),
    };

    merged.study_sessions = union_by_key(
        &local.study_sessions,
        &remote.study_sessions,
        |s: &PersistedSession| s.id,
        |a, b| a.completed_at >= b.completed_at,
    );
    merged.study_sessions.sort_by_key(|s| s.started_at);
    cap_front(&mut merged.study_sessions, SESSION_RETENTION);

    merged.incorrect_questions = union_by_key(
        &local.incorrect_questions,
        &remote.incorrect_questions,
        |e: &IncorrectQuestion| e.question_id.clone(),
        |a, b| a.last_incorrect_date >= b.last_incorrect_date,
    );

    merged.overcome_questions = union_by_key(
        &local.overcome_questions,
        &remote.overcome_questions,
        |e: &OvercomeQuestion| e.question_id.clone(),
        |a, b| a.overcome_date >= b.overcome_date,
    );

    merged.exam_history = union_by_key(
        &local.exam_history,
        &remote.exam_history,
        |r: &ExamResult| (r.category.clone(), r.mock_number, r.taken_at),
        |_, _| true,
    );
    merged.exam_history.sort_by_key(|r| r.taken_at);
    cap_front(&mut merged.exam_history, EXAM_HISTORY_RETENTION);

    for (category, ids) in local.answered_ids.iter().chain(remote.answered_ids.iter()) {
        merged
            .answered_ids
            .entry(category.clone())
            .or_default()
            .extend(ids.iter().cloned());
    }

    merged
}

fn merge_category(a: &CategoryProgress, b: &CategoryProgress) -> CategoryProgress {
    CategoryProgress {
        total_questions: a.total_questions.max(b.total_questions),
        answered_questions: a.answered_questions.max(b.answered_questions),
        correct_answers: a.correct_answers.max(b.correct_answers),
        last_study_date: a.last_study_date.max(b.last_study_date),
    }
}

fn merge_mock(a: &MockCategoryProgress, b: &MockCategoryProgress) -> MockCategoryProgress {
    let later = if b.last_attempt_date > a.last_attempt_date {
        b
    } else {
        a
    };
    MockCategoryProgress {
        total_questions: a.total_questions.max(b.total_questions),
        attempts_count: a.attempts_count.max(b.attempts_count),
        best_score: a.best_score.max(b.best_score),
        latest_score: later.latest_score,
        average_score: later.average_score,
        passed_count: a.passed_count.max(b.passed_count),
        last_attempt_date: a.last_attempt_date.max(b.last_attempt_date),
    }
}

fn merge_keyed<K: Ord + Clone, V: Clone>(
    a: &BTreeMap<K, V>,
    b: &BTreeMap<K, V>,
    combine: impl Fn(&V, &V) -> V,
) -> BTreeMap<K, V> {
    let mut out = a.clone();
    for (key, value) in b {
        match out.get(key) {
            Some(existing) => {
                let combined = combine(existing, value);
                out.insert(key.clone(), combined);
            }
            None => {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    out
}

/// Keep the newest entries of a list sorted ascending by time.
///
/// A merge of two full histories can exceed the retention caps; trimming
/// here keeps the merged document within the same bounds the write path
/// enforces, and keeps the merge idempotent under the caps.
fn cap_front<T>(entries: &mut Vec<T>, limit: usize) {
    if entries.len() > limit {
        let excess = entries.len() - limit;
        entries.drain(..excess);
    }
}

/// Union of two keyed lists; when both sides carry a key, `keep_left`
/// decides whether the first argument wins.
fn union_by_key<T: Clone, K: Ord + Clone>(
    a: &[T],
    b: &[T],
    key: impl Fn(&T) -> K,
    keep_left: impl Fn(&T, &T) -> bool,
) -> Vec<T> {
    let mut by_key: BTreeMap<K, T> = BTreeMap::new();
    for item in a.iter().chain(b.iter()) {
        let k = key(item);
        match by_key.get(&k) {
            Some(existing) if keep_left(existing, item) => {}
            _ => {
                by_key.insert(k, item.clone());
            }
        }
    }
    by_key.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CategoryId, MistakeSource, QuestionId, SessionId, SessionMode};
    use crate::time::fixed_now;
    use chrono::Duration;

    fn incorrect(id: &str, at_offset_hours: i64) -> IncorrectQuestion {
        IncorrectQuestion::first(
            QuestionId::new(id),
            CategoryId::new("grammar"),
            MistakeSource::Category,
            None,
            fixed_now() + Duration::hours(at_offset_hours),
        )
    }

    fn with_counters(total: u64, incorrect_ids: &[&str]) -> UserProgress {
        UserProgress {
            total_questions_answered: total,
            incorrect_questions: incorrect_ids.iter().map(|id| incorrect(id, 0)).collect(),
            ..UserProgress::default()
        }
    }

    #[test]
    fn use_higher_takes_max_counter_and_unions_mistakes() {
        let local = with_counters(50, &["Q1"]);
        let remote = with_counters(70, &["Q2"]);

        let merged = merge(&local, &remote, MergeStrategy::UseHigher);

        assert_eq!(merged.total_questions_answered, 70);
        let mut ids: Vec<_> = merged
            .incorrect_questions
            .iter()
            .map(|e| e.question_id.as_str().to_owned())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["Q1", "Q2"]);
    }

    #[test]
    fn duplicate_key_keeps_later_timestamp() {
        let mut local = with_counters(1, &[]);
        local.incorrect_questions.push(incorrect("Q1", 0));
        let mut remote = with_counters(1, &[]);
        let mut later = incorrect("Q1", 5);
        later.incorrect_count = 3;
        remote.incorrect_questions.push(later);

        let merged = merge(&local, &remote, MergeStrategy::UseHigher);

        assert_eq!(merged.incorrect_questions.len(), 1);
        assert_eq!(merged.incorrect_questions[0].incorrect_count, 3);
    }

    #[test]
    fn use_higher_is_commutative() {
        let mut local = with_counters(50, &["Q1"]);
        local.best_streak = 4;
        local.last_study_date = Some(fixed_now());
        let mut remote = with_counters(70, &["Q2"]);
        remote.best_streak = 9;
        remote.current_streak = 2;
        remote.last_study_date = Some(fixed_now() + Duration::days(1));

        let ab = merge(&local, &remote, MergeStrategy::UseHigher);
        let ba = merge(&remote, &local, MergeStrategy::UseHigher);
        assert_eq!(ab, ba);
    }

    #[test]
    fn use_higher_is_idempotent() {
        let mut local = with_counters(50, &["Q1", "Q2"]);
        local.last_study_date = Some(fixed_now());
        let remote = with_counters(70, &["Q3"]);

        let once = merge(&local, &remote, MergeStrategy::UseHigher);
        let twice = merge(&once, &remote, MergeStrategy::UseHigher);
        assert_eq!(once, twice);
    }

    #[test]
    fn trust_strategies_take_one_side_wholesale() {
        let local = with_counters(50, &["Q1"]);
        let remote = with_counters(70, &["Q2"]);

        assert_eq!(merge(&local, &remote, MergeStrategy::TrustLocal), local);
        assert_eq!(merge(&local, &remote, MergeStrategy::TrustRemote), remote);
    }

    fn session(offset_hours: i64) -> PersistedSession {
        let at = fixed_now() + Duration::hours(offset_hours);
        PersistedSession {
            id: SessionId::generate(),
            mode: SessionMode::Category,
            category: CategoryId::new("grammar"),
            part: None,
            mock_number: None,
            started_at: at,
            completed_at: at,
            question_ids: Vec::new(),
        }
    }

    fn exam(mock_number: u32, offset_hours: i64) -> ExamResult {
        ExamResult::from_counts(
            mock_number,
            CategoryId::new("grammar"),
            10,
            8,
            60.0,
            fixed_now() + Duration::hours(offset_hours),
        )
    }

    #[test]
    fn merged_histories_stay_within_retention_caps() {
        let mut local = UserProgress::default();
        let mut remote = UserProgress::default();
        for n in 0..SESSION_RETENTION as i64 {
            local.study_sessions.push(session(n * 2));
            remote.study_sessions.push(session(n * 2 + 1));
        }
        for n in 0..EXAM_HISTORY_RETENTION as i64 {
            local.exam_history.push(exam(1, n * 2));
            remote.exam_history.push(exam(2, n * 2 + 1));
        }

        let merged = merge(&local, &remote, MergeStrategy::UseHigher);

        assert_eq!(merged.study_sessions.len(), SESSION_RETENTION);
        assert_eq!(merged.exam_history.len(), EXAM_HISTORY_RETENTION);
        // The newest entries survive the cap.
        assert_eq!(
            merged.study_sessions.last().unwrap().started_at,
            fixed_now() + Duration::hours((SESSION_RETENTION as i64 - 1) * 2 + 1)
        );
        assert_eq!(
            merged.exam_history.last().unwrap().taken_at,
            fixed_now() + Duration::hours((EXAM_HISTORY_RETENTION as i64 - 1) * 2 + 1)
        );

        // Capping does not break idempotence.
        let again = merge(&merged, &remote, MergeStrategy::UseHigher);
        assert_eq!(again, merged);
    }

    #[test]
    fn answered_ids_union_per_category() {
        let mut local = UserProgress::default();
        local
            .answered_ids
            .entry(CategoryId::new("grammar"))
            .or_default()
            .insert(QuestionId::new("Q1"));
        let mut remote = UserProgress::default();
        remote
            .answered_ids
            .entry(CategoryId::new("grammar"))
            .or_default()
            .insert(QuestionId::new("Q2"));

        let merged = merge(&local, &remote, MergeStrategy::UseHigher);
        assert_eq!(merged.answered_ids[&CategoryId::new("grammar")].len(), 2);
    }
}
