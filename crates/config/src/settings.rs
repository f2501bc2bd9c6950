//! Persisted JSON settings blobs under the user data directory.

use std::path::{Path, PathBuf};

use {
    serde::{de::DeserializeOwned, Deserialize, Serialize},
    tracing::{debug, warn},
};

/// Default LLM provider configuration (`api-settings.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSettings {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    /// Model used for multi-thread task auto-summaries; falls back to
    /// `model_name` when unset.
    #[serde(default)]
    pub summary_model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

/// A typed settings file with atomic-ish save (write temp, rename).
pub struct SettingsFile<T> {
    path: PathBuf,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned + Default> SettingsFile<T> {
    #[must_use]
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            path: dir.join(name),
            _marker: std::marker::PhantomData,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the file, falling back to `T::default()` when missing or
    /// unparseable. A corrupt settings blob must never take the runtime
    /// down.
    #[must_use]
    pub fn load(&self) -> T {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(value) => value,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "settings file unparseable, using defaults");
                    T::default()
                },
            },
            Err(_) => T::default(),
        }
    }

    /// Persist, creating the parent directory on first save.
    pub fn save(&self, value: &T) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(value)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "settings saved");
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let file: SettingsFile<ApiSettings> = SettingsFile::new(dir.path(), "api-settings.json");
        assert_eq!(file.load(), ApiSettings::default());
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file: SettingsFile<ApiSettings> = SettingsFile::new(dir.path(), "api-settings.json");

        let settings = ApiSettings {
            base_url: Some("https://api.example.com/v1".into()),
            api_key: Some("sk-test".into()),
            model_name: Some("gpt-4o".into()),
            summary_model: None,
            temperature: Some(0.2),
        };
        file.save(&settings).unwrap();
        assert_eq!(file.load(), settings);
    }

    #[test]
    fn corrupt_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api-settings.json");
        std::fs::write(&path, "{{{{").unwrap();
        let file: SettingsFile<ApiSettings> = SettingsFile::new(dir.path(), "api-settings.json");
        assert_eq!(file.load(), ApiSettings::default());
    }

    #[test]
    fn save_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("deep/nested");
        let file: SettingsFile<ApiSettings> = SettingsFile::new(&nested, "api-settings.json");
        file.save(&ApiSettings::default()).unwrap();
        assert!(nested.join("api-settings.json").exists());
    }

    #[test]
    fn camel_case_wire_format() {
        let settings = ApiSettings {
            base_url: Some("x".into()),
            model_name: Some("m".into()),
            ..ApiSettings::default()
        };
        let v = serde_json::to_value(&settings).unwrap();
        assert!(v.get("baseUrl").is_some());
        assert!(v.get("modelName").is_some());
    }
}
