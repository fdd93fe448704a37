use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{CategoryId, QuestionId};

/// Provenance of a mistake record: category practice or a timed mock exam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MistakeSource {
    #[default]
    Category,
    Mock,
}

/// A question the user has answered incorrectly at least once and has not
/// yet overcome. `question_id` is unique within the list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncorrectQuestion {
    pub question_id: QuestionId,
    pub category: CategoryId,
    pub incorrect_count: u32,
    pub last_incorrect_date: DateTime<Utc>,
    #[serde(default)]
    pub review_count: u32,
    #[serde(default)]
    pub source: MistakeSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mock_number: Option<u32>,
}

impl IncorrectQuestion {
    /// First occurrence of a mistake for this question.
    #[must_use]
    pub fn first(
        question_id: QuestionId,
        category: CategoryId,
        source: MistakeSource,
        mock_number: Option<u32>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            question_id,
            category,
            incorrect_count: 1,
            last_incorrect_date: at,
            review_count: 0,
            source,
            mock_number,
        }
    }

    /// Record another miss of the same question.
    pub fn record_miss(&mut self, source: MistakeSource, mock_number: Option<u32>, at: DateTime<Utc>) {
        self.incorrect_count = self.incorrect_count.saturating_add(1);
        self.last_incorrect_date = at;
        self.source = source;
        if mock_number.is_some() {
            self.mock_number = mock_number;
        }
    }
}

/// A previously-incorrect question answered correctly later.
///
/// Same shape as [`IncorrectQuestion`] minus the source tag, plus the date
/// it was overcome and the miss count at that point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OvercomeQuestion {
    pub question_id: QuestionId,
    pub category: CategoryId,
    pub overcome_date: DateTime<Utc>,
    pub previous_incorrect_count: u32,
    #[serde(default)]
    pub review_count: u32,
}
