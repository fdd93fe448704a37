use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::catalog::CategoryCatalog;
use crate::model::{
    CategoryId, ExamResult, IncorrectQuestion, OvercomeQuestion, PersistedSession, Preferences,
    QuestionId,
};

/// Schema version stamped on documents written by this implementation.
///
/// Legacy documents carry no version at all and deserialize as version 0;
/// the migration engine brings them up to date.
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// Retention cap for persisted study sessions.
///
/// Enforced on the write path, under quota pressure, and after a merge,
/// so the collection stays bounded no matter which path touched it last.
pub const SESSION_RETENTION: usize = 50;

/// Retention cap for raw exam attempt records.
pub const EXAM_HISTORY_RETENTION: usize = 20;

/// Per-category progress counters.
///
/// `total_questions` is fixed by the category catalog; the other fields
/// move as the user answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryProgress {
    pub total_questions: u32,
    pub answered_questions: u32,
    pub correct_answers: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_study_date: Option<DateTime<Utc>>,
}

impl CategoryProgress {
    /// Zero-state entry for a category with the given size.
    #[must_use]
    pub fn seeded(total_questions: u32) -> Self {
        Self {
            total_questions,
            answered_questions: 0,
            correct_answers: 0,
            last_study_date: None,
        }
    }

    /// Record one answer, clamped so `answered <= total` and
    /// `correct <= answered`.
    pub fn record_answer(&mut self, correct: bool, at: DateTime<Utc>) {
        self.answered_questions = self
            .answered_questions
            .saturating_add(1)
            .min(self.total_questions);
        if correct {
            self.correct_answers = self
                .correct_answers
                .saturating_add(1)
                .min(self.answered_questions);
        }
        self.last_study_date = Some(at);
    }
}

/// Derived rollup over timed-exam attempts for one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockCategoryProgress {
    pub total_questions: u32,
    pub attempts_count: u32,
    pub best_score: f64,
    pub latest_score: f64,
    pub average_score: f64,
    pub passed_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_date: Option<DateTime<Utc>>,
}

impl MockCategoryProgress {
    /// Zero-state rollup for a category with the given size.
    #[must_use]
    pub fn seeded(total_questions: u32) -> Self {
        Self {
            total_questions,
            attempts_count: 0,
            best_score: 0.0,
            latest_score: 0.0,
            average_score: 0.0,
            passed_count: 0,
            last_attempt_date: None,
        }
    }

    /// Rebuild the rollup from raw attempt records.
    ///
    /// Returns the zero state when `results` is empty.
    #[must_use]
    pub fn from_results(total_questions: u32, results: &[ExamResult]) -> Self {
        let mut rollup = Self::seeded(total_questions);
        let mut sum = 0.0;
        for result in results {
            rollup.attempts_count += 1;
            sum += result.score_percent;
            if result.score_percent > rollup.best_score {
                rollup.best_score = result.score_percent;
            }
            if result.passed {
                rollup.passed_count += 1;
            }
            if rollup.last_attempt_date.is_none_or(|d| result.taken_at >= d) {
                rollup.last_attempt_date = Some(result.taken_at);
                rollup.latest_score = result.score_percent;
            }
        }
        if rollup.attempts_count > 0 {
            rollup.average_score = sum / f64::from(rollup.attempts_count);
        }
        rollup
    }
}

/// The per-identity aggregate: everything the quiz app persists about one
/// user's learning progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserProgress {
    pub schema_version: u32,
    pub total_questions_answered: u64,
    pub correct_answers: u64,
    pub category_progress: BTreeMap<CategoryId, CategoryProgress>,
    pub mock_category_progress: BTreeMap<CategoryId, MockCategoryProgress>,
    pub study_sessions: Vec<PersistedSession>,
    pub incorrect_questions: Vec<IncorrectQuestion>,
    pub overcome_questions: Vec<OvercomeQuestion>,
    pub exam_history: Vec<ExamResult>,
    /// Unique ids answered per category; reconciled against the counters
    /// by the repair tool.
    pub answered_ids: BTreeMap<CategoryId, BTreeSet<QuestionId>>,
    pub current_streak: u32,
    pub best_streak: u32,
    pub last_study_date: Option<DateTime<Utc>>,
    pub preferences: Preferences,
}

impl Default for UserProgress {
    fn default() -> Self {
        Self {
            schema_version: 0,
            total_questions_answered: 0,
            correct_answers: 0,
            category_progress: BTreeMap::new(),
            mock_category_progress: BTreeMap::new(),
            study_sessions: Vec::new(),
            incorrect_questions: Vec::new(),
            overcome_questions: Vec::new(),
            exam_history: Vec::new(),
            answered_ids: BTreeMap::new(),
            current_streak: 0,
            best_streak: 0,
            last_study_date: None,
            preferences: Preferences::default(),
        }
    }
}

impl UserProgress {
    /// Zero-state aggregate for a fresh identity, seeded from the catalog.
    #[must_use]
    pub fn seeded(catalog: &CategoryCatalog) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            category_progress: catalog
                .entries()
                .iter()
                .map(|e| (e.id.clone(), CategoryProgress::seeded(e.total_questions)))
                .collect(),
            mock_category_progress: catalog
                .entries()
                .iter()
                .map(|e| (e.id.clone(), MockCategoryProgress::seeded(e.total_questions)))
                .collect(),
            ..Self::default()
        }
    }

    /// Sums of (answered, correct) over all categories.
    ///
    /// The global counters are eventually consistent with these sums; the
    /// repair tool reconciles drift.
    #[must_use]
    pub fn category_sums(&self) -> (u64, u64) {
        self.category_progress.values().fold((0, 0), |(a, c), p| {
            (
                a + u64::from(p.answered_questions),
                c + u64::from(p.correct_answers),
            )
        })
    }

    /// Look up the mistake entry for a question, if any.
    #[must_use]
    pub fn incorrect_entry(&self, question_id: &QuestionId) -> Option<&IncorrectQuestion> {
        self.incorrect_questions
            .iter()
            .find(|e| &e.question_id == question_id)
    }

    /// Exam attempts recorded for one category, in history order.
    #[must_use]
    pub fn exam_results_for(&self, category: &CategoryId) -> Vec<&ExamResult> {
        self.exam_history
            .iter()
            .filter(|r| &r.category == category)
            .collect()
    }
}
