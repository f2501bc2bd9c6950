//! Runtime configuration: environment variables, the user data directory,
//! and the persisted JSON settings blobs.

pub mod settings;
pub mod skills;

pub use {
    settings::{ApiSettings, SettingsFile},
    skills::{Skill, SkillsSettings},
};

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Runtime mode, selected by the positional CLI argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Bot,
    Gateway,
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bot" => Ok(Self::Bot),
            "gateway" => Ok(Self::Gateway),
            other => Err(format!("unknown mode '{other}' (expected bot or gateway)")),
        }
    }
}

/// Environment-derived configuration, read once at startup.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    /// Default workspace root when a session supplies none.
    pub agent_cwd: Option<PathBuf>,
    /// Directory for settings, scheduler DB, skills list.
    pub user_data_dir: Option<PathBuf>,
    /// Default LLM provider.
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model_name: Option<String>,
    /// Chat bridge token (bot mode).
    pub telegram_token: Option<String>,
    pub allowed_users: Vec<i64>,
    pub allowed_groups: Vec<i64>,
    /// Advisory list of ports the host exposes.
    pub exposed_ports: Vec<u16>,
    /// HTTP port in gateway mode.
    pub gateway_port: Option<u16>,
}

impl EnvConfig {
    /// Read the recognized environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            agent_cwd: std::env::var("AGENT_CWD").ok().map(PathBuf::from),
            user_data_dir: std::env::var("USER_DATA_DIR").ok().map(PathBuf::from),
            base_url: std::env::var("BASE_URL").ok(),
            api_key: std::env::var("API_KEY").ok(),
            model_name: std::env::var("MODEL_NAME").ok(),
            telegram_token: std::env::var("TELEGRAM_TOKEN").ok(),
            allowed_users: parse_id_list(&std::env::var("ALLOWED_USERS").unwrap_or_default()),
            allowed_groups: parse_id_list(&std::env::var("ALLOWED_GROUPS").unwrap_or_default()),
            exposed_ports: parse_port_list(&std::env::var("EXPOSED_PORTS").unwrap_or_default()),
            gateway_port: std::env::var("GATEWAY_PORT").ok().and_then(|p| p.parse().ok()),
        }
    }

    /// Resolve the data directory: `USER_DATA_DIR`, else the platform data
    /// dir under `hearth/`, else the current directory.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.user_data_dir {
            return dir.clone();
        }
        dirs_next::data_dir()
            .map(|d| d.join("hearth"))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Validate the variables the selected mode requires.
    pub fn validate(&self, mode: Mode) -> Result<(), String> {
        if mode == Mode::Bot && self.telegram_token.is_none() {
            return Err("TELEGRAM_TOKEN is required in bot mode".to_string());
        }
        if mode == Mode::Gateway && self.gateway_port.is_none() {
            return Err("GATEWAY_PORT is required in gateway mode".to_string());
        }
        Ok(())
    }
}

/// Parse a comma-separated integer ACL, skipping malformed entries.
fn parse_id_list(raw: &str) -> Vec<i64> {
    raw.split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}

fn parse_port_list(raw: &str) -> Vec<u16> {
    raw.split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing() {
        assert_eq!("bot".parse::<Mode>().unwrap(), Mode::Bot);
        assert_eq!("GATEWAY".parse::<Mode>().unwrap(), Mode::Gateway);
        assert!("server".parse::<Mode>().is_err());
    }

    #[test]
    fn id_list_parsing() {
        assert_eq!(parse_id_list("1,2,3"), vec![1, 2, 3]);
        assert_eq!(parse_id_list(" 42 , -7 "), vec![42, -7]);
        assert_eq!(parse_id_list("1,abc,3"), vec![1, 3]);
        assert!(parse_id_list("").is_empty());
    }

    #[test]
    fn port_list_parsing() {
        assert_eq!(parse_port_list("8080,3000"), vec![8080, 3000]);
        assert!(parse_port_list("notaport").is_empty());
    }

    #[test]
    fn bot_mode_requires_token() {
        let config = EnvConfig::default();
        assert!(config.validate(Mode::Bot).is_err());

        let config = EnvConfig {
            telegram_token: Some("123:abc".into()),
            ..EnvConfig::default()
        };
        assert!(config.validate(Mode::Bot).is_ok());
    }

    #[test]
    fn gateway_mode_requires_port() {
        let config = EnvConfig {
            telegram_token: Some("t".into()),
            ..EnvConfig::default()
        };
        assert!(config.validate(Mode::Gateway).is_err());

        let config = EnvConfig {
            gateway_port: Some(8900),
            ..config
        };
        assert!(config.validate(Mode::Gateway).is_ok());
    }

    #[test]
    fn data_dir_prefers_explicit() {
        let config = EnvConfig {
            user_data_dir: Some(PathBuf::from("/tmp/hearth-data")),
            ..EnvConfig::default()
        };
        assert_eq!(config.data_dir(), PathBuf::from("/tmp/hearth-data"));
    }
}
