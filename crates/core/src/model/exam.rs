use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::CategoryId;

/// Raw record of one completed timed-exam attempt.
///
/// These are the source of truth for [`MockCategoryProgress`] rollups: the
/// summary can always be rebuilt from the retained history.
///
/// [`MockCategoryProgress`]: crate::model::MockCategoryProgress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamResult {
    pub mock_number: u32,
    pub category: CategoryId,
    pub total_questions: u32,
    pub correct_count: u32,
    pub score_percent: f64,
    pub passed: bool,
    pub taken_at: DateTime<Utc>,
}

impl ExamResult {
    /// Build a result from raw counts, deriving score and pass/fail.
    #[must_use]
    pub fn from_counts(
        mock_number: u32,
        category: CategoryId,
        total_questions: u32,
        correct_count: u32,
        pass_threshold_percent: f64,
        taken_at: DateTime<Utc>,
    ) -> Self {
        let correct_count = correct_count.min(total_questions);
        let score_percent = if total_questions == 0 {
            0.0
        } else {
            f64::from(correct_count) * 100.0 / f64::from(total_questions)
        };
        Self {
            mock_number,
            category,
            total_questions,
            correct_count,
            score_percent,
            passed: score_percent >= pass_threshold_percent,
            taken_at,
        }
    }
}
