use serde::{Deserialize, Serialize};

/// User-facing preferences carried inside the aggregate.
///
/// Preferences survive `reset_all`; everything else in the aggregate is
/// rebuilt from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Preferences {
    pub shuffle_choices: bool,
    pub review_batch_size: u32,
    pub sound_enabled: bool,
    pub theme: Theme,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    System,
    Light,
    Dark,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            shuffle_choices: true,
            review_batch_size: 10,
            sound_enabled: true,
            theme: Theme::System,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let prefs: Preferences = serde_json::from_str("{\"theme\":\"dark\"}").unwrap();
        assert_eq!(prefs.theme, Theme::Dark);
        assert_eq!(prefs.review_batch_size, 10);
    }
}
