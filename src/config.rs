//! Application configuration (`aigis.yaml`).
//!
//! Resolution order: `$AIGIS_CONFIG`, then `./aigis.yaml`, then
//! `<data_dir>/aigis.yaml`. No file means built-in defaults. `${VAR}` and
//! `${VAR:-default}` are interpolated before parsing, so secrets can stay in
//! the environment:
//!
//! ```yaml
//! models:
//!   default_model: qwen3-8b
//! security:
//!   master_key: ${AIGIS_MASTER_KEY}
//! database:
//!   row_cap: 500
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::agent_core::{AgentSettings, AnalystSettings};
use crate::connections::DatabaseSettings;
use crate::inference::config::{expand_tilde, interpolate_env_vars};
use crate::inference::ModelsConfig;
use crate::logging::data_dir;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "AIGIS_CONFIG";
pub const CONFIG_FILE: &str = "aigis.yaml";
/// Fallback source for `security.master_key`.
pub const MASTER_KEY_ENV: &str = "AIGIS_MASTER_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("invalid config {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("no master key configured: set security.master_key or {MASTER_KEY_ENV}")]
    MissingMasterKey,
}

// ─── Sections ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Passphrase the connection-secret key is derived from.
    pub master_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file for threads, connections and checkpoints.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub models: ModelsConfig,
    pub agent: AgentSettings,
    pub database: DatabaseSettings,
    pub analyst: AnalystSettings,
    pub security: SecurityConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load from the first config file found, or defaults.
    pub fn load() -> Result<(Self, Option<PathBuf>), ConfigError> {
        match locate() {
            Some(path) => Ok((Self::from_file(&path)?, Some(path))),
            None => Ok((Self::default(), None)),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_yaml(&raw).map_err(|reason| ConfigError::Parse {
            path: path.display().to_string(),
            reason,
        })
    }

    /// Parse YAML after env-var interpolation.
    pub fn from_yaml(raw: &str) -> Result<Self, String> {
        let expanded = interpolate_env_vars(raw);
        if expanded.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: AppConfig = serde_yaml::from_str(&expanded).map_err(|e| e.to_string())?;
        config.models.validate().map_err(|e| e.to_string())?;
        Ok(config)
    }

    /// The master passphrase, from the file or `$AIGIS_MASTER_KEY`.
    pub fn master_key(&self) -> Result<String, ConfigError> {
        self.security
            .master_key
            .clone()
            .or_else(|| std::env::var(MASTER_KEY_ENV).ok())
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::MissingMasterKey)
    }

    /// Path of the agent's own SQLite database.
    pub fn storage_path(&self) -> PathBuf {
        match self.storage.path.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(path) => PathBuf::from(expand_tilde(path)),
            None => data_dir().join("aigis.db"),
        }
    }

    pub fn log_filter(&self) -> &str {
        self.logging
            .filter
            .as_deref()
            .unwrap_or(crate::logging::DEFAULT_FILTER)
    }
}

fn locate() -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV) {
        if !explicit.trim().is_empty() {
            return Some(PathBuf::from(expand_tilde(&explicit)));
        }
    }
    [PathBuf::from(CONFIG_FILE), data_dir().join(CONFIG_FILE)]
        .into_iter()
        .find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_empty() {
        let config = AppConfig::from_yaml("").unwrap();
        assert_eq!(config.agent.max_round_trips, 6);
        assert_eq!(config.database.row_cap, 1000);
        assert_eq!(config.analyst.max_attempts, 3);
        assert!(config.models.models.contains_key("qwen3-8b"));
    }

    #[test]
    fn test_sections_override_defaults() {
        let yaml = r#"
agent:
  max_round_trips: 3
database:
  row_cap: 50
  query_timeout_secs: 5
models:
  default_model: local
  models:
    local:
      provider: openai_compatible
      base_url: http://localhost:1234/v1
      aliases: [l]
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.agent.max_round_trips, 3);
        assert_eq!(config.agent.model_timeout_secs, 180);
        assert_eq!(config.database.row_cap, 50);
        assert_eq!(config.database.sample_rows, 3);
        assert_eq!(config.models.default_model.as_deref(), Some("local"));
        assert_eq!(config.models.models.len(), 1);
    }

    #[test]
    fn test_master_key_interpolated() {
        std::env::set_var("__AIGIS_TEST_MASTER__", "s3cret");
        let config =
            AppConfig::from_yaml("security:\n  master_key: ${__AIGIS_TEST_MASTER__}\n").unwrap();
        assert_eq!(config.master_key().unwrap(), "s3cret");
        std::env::remove_var("__AIGIS_TEST_MASTER__");
    }

    #[test]
    fn test_invalid_yaml_rejected() {
        assert!(AppConfig::from_yaml("agent: [1, 2").is_err());
    }

    #[test]
    fn test_alias_collision_rejected() {
        let yaml = r#"
models:
  models:
    a:
      provider: custom
      base_url: http://a
      aliases: [x]
    b:
      provider: custom
      base_url: http://b
      aliases: [x]
"#;
        assert!(AppConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_storage_path_default() {
        let config = AppConfig::default();
        assert!(config.storage_path().ends_with("aigis.db"));
        assert_eq!(config.log_filter(), crate::logging::DEFAULT_FILTER);
    }
}
