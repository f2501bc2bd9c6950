//! The skills list (`skills-settings.json`).
//!
//! Marketplace fetch is an external collaborator; this module only owns
//! the persisted list: load, toggle, refresh-from-disk, marketplace URL.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::settings::SettingsFile;

/// One installed skill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Skill {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub enabled: bool,
}

/// On-disk schema of `skills-settings.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillsSettings {
    #[serde(default)]
    pub marketplace_url: Option<String>,
    #[serde(default)]
    pub skills: Vec<Skill>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fetched: Option<u64>,
}

impl SkillsSettings {
    #[must_use]
    pub fn file(dir: &Path) -> SettingsFile<Self> {
        SettingsFile::new(dir, "skills-settings.json")
    }

    /// Toggle a skill by id. Returns false when the id is unknown.
    pub fn toggle(&mut self, skill_id: &str, enabled: bool) -> bool {
        match self.skills.iter_mut().find(|s| s.id == skill_id) {
            Some(skill) => {
                skill.enabled = enabled;
                true
            },
            None => false,
        }
    }

    /// Ids of enabled skills, in list order.
    #[must_use]
    pub fn enabled_ids(&self) -> Vec<String> {
        self.skills
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.id.clone())
            .collect()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SkillsSettings {
        SkillsSettings {
            marketplace_url: Some("https://skills.example.com/index.json".into()),
            skills: vec![
                Skill {
                    id: "git-helper".into(),
                    name: "Git helper".into(),
                    description: "git workflows".into(),
                    enabled: true,
                },
                Skill {
                    id: "pdf-reader".into(),
                    name: "PDF reader".into(),
                    description: String::new(),
                    enabled: false,
                },
            ],
            last_fetched: Some(1_700_000_000_000),
        }
    }

    #[test]
    fn toggle_known_and_unknown() {
        let mut settings = sample();
        assert!(settings.toggle("pdf-reader", true));
        assert!(settings.skills[1].enabled);
        assert!(!settings.toggle("nope", true));
    }

    #[test]
    fn enabled_ids_filters() {
        let settings = sample();
        assert_eq!(settings.enabled_ids(), vec!["git-helper".to_string()]);
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = SkillsSettings::file(dir.path());
        file.save(&sample()).unwrap();
        let loaded = file.load();
        assert_eq!(loaded, sample());
        assert!(dir.path().join("skills-settings.json").exists());
    }

    #[test]
    fn wire_format_matches_schema() {
        let v = serde_json::to_value(sample()).unwrap();
        assert!(v.get("marketplaceUrl").is_some());
        assert!(v.get("skills").is_some());
        assert!(v.get("lastFetched").is_some());
    }
}
