use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{CategoryId, QuestionId, SessionId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionError {
    #[error("session already completed")]
    AlreadyCompleted,

    #[error("session is not complete")]
    NotCompleted,
}

/// How a study session was run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionMode {
    Category,
    TimedExamShort,
    TimedExamLong,
    Review,
}

impl SessionMode {
    /// Timed-exam modes feed the mock rollups; the others do not.
    #[must_use]
    pub fn is_timed_exam(self) -> bool {
        matches!(self, Self::TimedExamShort | Self::TimedExamLong)
    }
}

/// One answered question within a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    pub question_id: QuestionId,
    pub category: CategoryId,
    pub correct: bool,
    pub answered_at: DateTime<Utc>,
}

/// In-memory study session holding full answers while it runs.
///
/// Only [`PersistedSession`] ever reaches storage; full answers (and any
/// question payloads the UI holds alongside) stay in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct StudySession {
    pub id: SessionId,
    pub mode: SessionMode,
    pub category: CategoryId,
    pub part: Option<String>,
    pub mock_number: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub answers: Vec<Answer>,
}

impl StudySession {
    /// Start a new session.
    #[must_use]
    pub fn start(mode: SessionMode, category: CategoryId, started_at: DateTime<Utc>) -> Self {
        Self {
            id: SessionId::generate(),
            mode,
            category,
            part: None,
            mock_number: None,
            started_at,
            completed_at: None,
            answers: Vec::new(),
        }
    }

    /// Start a timed-exam session for the given mock number.
    #[must_use]
    pub fn start_mock(
        mode: SessionMode,
        category: CategoryId,
        mock_number: u32,
        started_at: DateTime<Utc>,
    ) -> Self {
        let mut session = Self::start(mode, category, started_at);
        session.mock_number = Some(mock_number);
        session
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Number of correctly answered questions so far.
    #[must_use]
    pub fn correct_count(&self) -> u32 {
        u32::try_from(self.answers.iter().filter(|a| a.correct).count()).unwrap_or(u32::MAX)
    }

    /// Append an answer to a running session.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::AlreadyCompleted` if the session is finished.
    pub fn push_answer(&mut self, answer: Answer) -> Result<(), SessionError> {
        if self.is_complete() {
            return Err(SessionError::AlreadyCompleted);
        }
        self.answers.push(answer);
        Ok(())
    }

    /// Strip the session down to its persisted shape.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotCompleted` if `completed_at` is unset.
    pub fn to_persisted(&self) -> Result<PersistedSession, SessionError> {
        let completed_at = self.completed_at.ok_or(SessionError::NotCompleted)?;
        Ok(PersistedSession {
            id: self.id,
            mode: self.mode,
            category: self.category.clone(),
            part: self.part.clone(),
            mock_number: self.mock_number,
            started_at: self.started_at,
            completed_at,
            question_ids: self.answers.iter().map(|a| a.question_id.clone()).collect(),
        })
    }
}

/// Storage shape of a completed session: question ids only, never embedded
/// question payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub id: SessionId,
    pub mode: SessionMode,
    pub category: CategoryId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mock_number: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub question_ids: Vec<QuestionId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::fixed_now;

    fn answer(id: &str, correct: bool) -> Answer {
        Answer {
            question_id: QuestionId::new(id),
            category: CategoryId::new("grammar"),
            correct,
            answered_at: fixed_now(),
        }
    }

    #[test]
    fn persisted_shape_carries_ids_only() {
        let mut session =
            StudySession::start(SessionMode::Category, CategoryId::new("grammar"), fixed_now());
        session.push_answer(answer("Q1", true)).unwrap();
        session.push_answer(answer("Q2", false)).unwrap();
        session.completed_at = Some(fixed_now());

        let persisted = session.to_persisted().unwrap();
        assert_eq!(
            persisted.question_ids,
            vec![QuestionId::new("Q1"), QuestionId::new("Q2")]
        );

        let json = serde_json::to_value(&persisted).unwrap();
        assert!(json.get("answers").is_none());
        assert!(json.get("questions").is_none());
    }

    #[test]
    fn incomplete_session_cannot_be_persisted() {
        let session =
            StudySession::start(SessionMode::Review, CategoryId::new("grammar"), fixed_now());
        assert_eq!(session.to_persisted().unwrap_err(), SessionError::NotCompleted);
    }

    #[test]
    fn completed_session_rejects_answers() {
        let mut session =
            StudySession::start(SessionMode::Category, CategoryId::new("grammar"), fixed_now());
        session.completed_at = Some(fixed_now());
        assert_eq!(
            session.push_answer(answer("Q1", true)).unwrap_err(),
            SessionError::AlreadyCompleted
        );
    }

    #[test]
    fn mode_serializes_kebab_case() {
        let json = serde_json::to_string(&SessionMode::TimedExamShort).unwrap();
        assert_eq!(json, "\"timed-exam-short\"");
    }
}
