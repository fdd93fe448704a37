//! Pure invariant scanner/corrector for the aggregate.
//!
//! `repair` never touches storage; callers decide whether to persist the
//! corrected aggregate and whether to log the violation list.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::catalog::CategoryCatalog;
use crate::model::{CategoryId, CategoryProgress, QuestionId, UserProgress};

/// Which side wins when the answered-id tracker disagrees with the
/// per-category counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerTrust {
    /// Leave the counters as recorded; the tracker stays advisory.
    #[default]
    Counters,
    /// The tracker's unique-id count overwrites `answered_questions`.
    Tracker,
    /// Take the larger of the two.
    Larger,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RepairOptions {
    pub tracker_trust: TrackerTrust,
}

/// One detected invariant violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum Violation {
    AnsweredExceedsTotal {
        category: CategoryId,
        answered: u32,
        total: u32,
    },
    CorrectExceedsAnswered {
        category: CategoryId,
        correct: u32,
        answered: u32,
    },
    DuplicateIncorrect {
        question_id: QuestionId,
    },
    DuplicateOvercome {
        question_id: QuestionId,
    },
    TrackerMismatch {
        category: CategoryId,
        tracked: u32,
        counted: u32,
    },
    GlobalCounterDrift {
        field: &'static str,
        expected: u64,
        found: u64,
    },
}

/// Corrected aggregate plus everything that was wrong with the input.
#[derive(Debug, Clone)]
pub struct RepairOutcome {
    pub aggregate: UserProgress,
    pub violations: Vec<Violation>,
}

impl RepairOutcome {
    /// True when repair actually changed the aggregate.
    ///
    /// Advisory violations (a tracker mismatch under `TrackerTrust::Counters`)
    /// are reported without a change, so this is not `!violations.is_empty()`.
    #[must_use]
    pub fn changed(&self, input: &UserProgress) -> bool {
        &self.aggregate != input
    }
}

/// Scan the aggregate for invariant violations and return a corrected copy.
#[must_use]
pub fn repair(
    aggregate: &UserProgress,
    catalog: &CategoryCatalog,
    options: &RepairOptions,
) -> RepairOutcome {
    let mut fixed = aggregate.clone();
    let mut violations = Vec::new();

    align_with_catalog(&mut fixed, catalog);
    dedupe_mistakes(&mut fixed, &mut violations);
    reconcile_tracker(&mut fixed, options.tracker_trust, &mut violations);
    clamp_categories(&mut fixed, &mut violations);
    recompute_globals(&mut fixed, &mut violations);

    RepairOutcome {
        aggregate: fixed,
        violations,
    }
}

/// Seed entries for catalog categories the document lacks, and pin
/// `total_questions` to the catalog where the two disagree.
fn align_with_catalog(progress: &mut UserProgress, catalog: &CategoryCatalog) {
    for entry in catalog.entries() {
        progress
            .category_progress
            .entry(entry.id.clone())
            .and_modify(|p| p.total_questions = entry.total_questions)
            .or_insert_with(|| CategoryProgress::seeded(entry.total_questions));
        progress
            .mock_category_progress
            .entry(entry.id.clone())
            .and_modify(|p| p.total_questions = entry.total_questions)
            .or_insert_with(|| {
                crate::model::MockCategoryProgress::seeded(entry.total_questions)
            });
    }
}

fn clamp_categories(progress: &mut UserProgress, violations: &mut Vec<Violation>) {
    for (category, entry) in &mut progress.category_progress {
        if entry.answered_questions > entry.total_questions {
            violations.push(Violation::AnsweredExceedsTotal {
                category: category.clone(),
                answered: entry.answered_questions,
                total: entry.total_questions,
            });
            entry.answered_questions = entry.total_questions;
        }
        if entry.correct_answers > entry.answered_questions {
            violations.push(Violation::CorrectExceedsAnswered {
                category: category.clone(),
                correct: entry.correct_answers,
                answered: entry.answered_questions,
            });
            entry.correct_answers = entry.answered_questions;
        }
    }
}

fn dedupe_mistakes(progress: &mut UserProgress, violations: &mut Vec<Violation>) {
    let mut seen: BTreeMap<QuestionId, usize> = BTreeMap::new();
    let mut keep = Vec::with_capacity(progress.incorrect_questions.len());
    for entry in progress.incorrect_questions.drain(..) {
        match seen.get(&entry.question_id) {
            Some(&idx) => {
                violations.push(Violation::DuplicateIncorrect {
                    question_id: entry.question_id.clone(),
                });
                let kept: &mut crate::model::IncorrectQuestion = &mut keep[idx];
                if entry.last_incorrect_date > kept.last_incorrect_date {
                    *kept = entry;
                }
            }
            None => {
                seen.insert(entry.question_id.clone(), keep.len());
                keep.push(entry);
            }
        }
    }
    progress.incorrect_questions = keep;

    let mut seen: BTreeMap<QuestionId, usize> = BTreeMap::new();
    let mut keep = Vec::with_capacity(progress.overcome_questions.len());
    for entry in progress.overcome_questions.drain(..) {
        match seen.get(&entry.question_id) {
            Some(&idx) => {
                violations.push(Violation::DuplicateOvercome {
                    question_id: entry.question_id.clone(),
                });
                let kept: &mut crate::model::OvercomeQuestion = &mut keep[idx];
                if entry.overcome_date > kept.overcome_date {
                    *kept = entry;
                }
            }
            None => {
                seen.insert(entry.question_id.clone(), keep.len());
                keep.push(entry);
            }
        }
    }
    progress.overcome_questions = keep;
}

fn reconcile_tracker(
    progress: &mut UserProgress,
    trust: TrackerTrust,
    violations: &mut Vec<Violation>,
) {
    for (category, ids) in &progress.answered_ids {
        let Some(entry) = progress.category_progress.get_mut(category) else {
            continue;
        };
        let tracked = u32::try_from(ids.len()).unwrap_or(u32::MAX);
        if tracked == entry.answered_questions {
            continue;
        }
        violations.push(Violation::TrackerMismatch {
            category: category.clone(),
            tracked,
            counted: entry.answered_questions,
        });
        entry.answered_questions = match trust {
            TrackerTrust::Counters => entry.answered_questions,
            TrackerTrust::Tracker => tracked,
            TrackerTrust::Larger => entry.answered_questions.max(tracked),
        };
    }
}

fn recompute_globals(progress: &mut UserProgress, violations: &mut Vec<Violation>) {
    let (answered, correct) = progress.category_sums();
    if progress.total_questions_answered != answered {
        violations.push(Violation::GlobalCounterDrift {
            field: "totalQuestionsAnswered",
            expected: answered,
            found: progress.total_questions_answered,
        });
        progress.total_questions_answered = answered;
    }
    if progress.correct_answers != correct {
        violations.push(Violation::GlobalCounterDrift {
            field: "correctAnswers",
            expected: correct,
            found: progress.correct_answers,
        });
        progress.correct_answers = correct;
    }
}
