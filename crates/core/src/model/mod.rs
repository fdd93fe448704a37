mod exam;
mod ids;
mod mistakes;
mod preferences;
mod progress;
mod session;

pub use exam::ExamResult;
pub use ids::{CategoryId, QuestionId, SessionId};
pub use mistakes::{IncorrectQuestion, MistakeSource, OvercomeQuestion};
pub use preferences::{Preferences, Theme};
pub use progress::{
    CURRENT_SCHEMA_VERSION, CategoryProgress, EXAM_HISTORY_RETENTION, MockCategoryProgress,
    SESSION_RETENTION, UserProgress,
};
pub use session::{Answer, PersistedSession, SessionError, SessionMode, StudySession};
