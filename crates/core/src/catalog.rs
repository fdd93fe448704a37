use serde::{Deserialize, Serialize};

use crate::model::CategoryId;

/// Default pass threshold for timed exams, in percent.
pub const DEFAULT_PASS_THRESHOLD: f64 = 60.0;

/// One category in the static catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub id: CategoryId,
    pub total_questions: u32,
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold_percent: f64,
}

fn default_pass_threshold() -> f64 {
    DEFAULT_PASS_THRESHOLD
}

impl CatalogEntry {
    #[must_use]
    pub fn new(id: CategoryId, total_questions: u32) -> Self {
        Self {
            id,
            total_questions,
            pass_threshold_percent: DEFAULT_PASS_THRESHOLD,
        }
    }
}

/// Ordered list of categories with their fixed question counts.
///
/// Seeds fresh aggregates and validates per-category totals during repair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryCatalog {
    entries: Vec<CatalogEntry>,
}

impl CategoryCatalog {
    #[must_use]
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    #[must_use]
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// Look up a category by id.
    #[must_use]
    pub fn get(&self, id: &CategoryId) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| &e.id == id)
    }

    /// Fixed question count for a category, if it exists in the catalog.
    #[must_use]
    pub fn total_questions(&self, id: &CategoryId) -> Option<u32> {
        self.get(id).map(|e| e.total_questions)
    }

    /// Pass threshold for a category, falling back to the default for
    /// categories outside the catalog.
    #[must_use]
    pub fn pass_threshold(&self, id: &CategoryId) -> f64 {
        self.get(id)
            .map_or(DEFAULT_PASS_THRESHOLD, |e| e.pass_threshold_percent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_id() {
        let catalog = CategoryCatalog::new(vec![
            CatalogEntry::new(CategoryId::new("grammar"), 42),
            CatalogEntry::new(CategoryId::new("vocab"), 100),
        ]);
        assert_eq!(catalog.total_questions(&CategoryId::new("vocab")), Some(100));
        assert_eq!(catalog.total_questions(&CategoryId::new("missing")), None);
    }

    #[test]
    fn catalog_deserializes_from_plain_list() {
        let json = r#"[{"id": "grammar", "totalQuestions": 42}]"#;
        let catalog: CategoryCatalog = serde_json::from_str(json).unwrap();
        assert_eq!(catalog.entries().len(), 1);
        assert!(
            (catalog.pass_threshold(&CategoryId::new("grammar")) - DEFAULT_PASS_THRESHOLD).abs()
                < f64::EPSILON
        );
    }
}
