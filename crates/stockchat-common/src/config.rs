use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_CONFIG_FILE: &str = ".stockchat/config.toml";

/// Deployment configuration for the question-answering service.
///
/// A TOML file provides the durable settings; the environment variables
/// listed in [`ServiceConfig::apply_env_overrides`] win over the file so
/// containerized deployments can reconfigure without editing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub log_level: String,
    pub bind_addr: String,
    pub database_dsn: String,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub memory: MemorySettings,
    #[serde(default)]
    pub limits: LimitSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    pub provider: String,
    pub model_id: String,
    pub endpoint: Option<String>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            model_id: "llama3.2:latest".to_string(),
            endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySettings {
    /// Seconds of inactivity after which a session's memory is evicted.
    pub timeout_seconds: u64,
    /// How often the reaper scans for idle sessions.
    pub reaper_interval_seconds: u64,
    /// How often both agents are rebuilt from configuration.
    pub rotation_interval_seconds: u64,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            timeout_seconds: 600,
            reaper_interval_seconds: 60,
            rotation_interval_seconds: 3_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    /// Hard cap on rows any single generated statement may return.
    pub max_result_rows: u32,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_result_rows: 50,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let db_path = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".stockchat/stock.db");

        Self {
            log_level: "info".to_string(),
            bind_addr: "127.0.0.1:8000".to_string(),
            database_dsn: format!("sqlite:{}", db_path.display()),
            model: ModelSettings::default(),
            memory: MemorySettings::default(),
            limits: LimitSettings::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write config at {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    ParseFailed {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize default config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
    #[error("invalid value '{value}' for {name}: {reason}")]
    InvalidOverride {
        name: String,
        value: String,
        reason: String,
    },
    #[error("config has invalid value: {0}")]
    ValidationFailed(String),
}

impl ServiceConfig {
    pub fn resolve_path() -> PathBuf {
        if let Ok(path) = env::var("STOCKCHAT_CONFIG") {
            return PathBuf::from(path);
        }

        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_CONFIG_FILE)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let raw = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::WriteFailed {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, raw).map_err(|source| ConfigError::WriteFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    pub fn load_or_create() -> Result<(Self, PathBuf, bool), ConfigError> {
        let path = Self::resolve_path();
        if path.exists() {
            let cfg = Self::load(&path)?;
            return Ok((cfg, path, false));
        }

        let cfg = Self::default();
        cfg.save(&path)?;
        Ok((cfg, path, true))
    }

    /// Overlay the environment on top of the file-backed settings.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|name| env::var(name).ok())
    }

    pub fn apply_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(provider) = lookup("AI_PROVIDER") {
            self.model.provider = provider.trim().to_lowercase();
        }
        if let Some(model_id) = lookup("AI_MODEL") {
            self.model.model_id = model_id.trim().to_string();
        }
        if let Some(endpoint) = lookup("AI_ENDPOINT") {
            self.model.endpoint = Some(endpoint.trim().to_string());
        }
        if let Some(dsn) = lookup("DATABASE_DSN") {
            self.database_dsn = dsn.trim().to_string();
        }
        if let Some(raw) = lookup("MEMORY_TIMEOUT_SECONDS") {
            self.memory.timeout_seconds =
                raw.trim()
                    .parse::<u64>()
                    .map_err(|err| ConfigError::InvalidOverride {
                        name: "MEMORY_TIMEOUT_SECONDS".to_string(),
                        value: raw.clone(),
                        reason: err.to_string(),
                    })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_level.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "log_level cannot be empty".to_string(),
            ));
        }
        if self.bind_addr.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "bind_addr cannot be empty".to_string(),
            ));
        }
        if self.database_dsn.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_dsn cannot be empty".to_string(),
            ));
        }
        if self.model.provider.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "model.provider cannot be empty".to_string(),
            ));
        }
        if self.model.model_id.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "model.model_id cannot be empty".to_string(),
            ));
        }
        if let Some(endpoint) = &self.model.endpoint
            && endpoint.trim().is_empty()
        {
            return Err(ConfigError::ValidationFailed(
                "model.endpoint cannot be empty if set".to_string(),
            ));
        }
        if self.memory.timeout_seconds == 0 {
            return Err(ConfigError::ValidationFailed(
                "memory.timeout_seconds must be positive".to_string(),
            ));
        }
        if self.memory.reaper_interval_seconds == 0 || self.memory.rotation_interval_seconds == 0 {
            return Err(ConfigError::ValidationFailed(
                "job intervals must be positive".to_string(),
            ));
        }
        if self.limits.max_result_rows == 0 {
            return Err(ConfigError::ValidationFailed(
                "limits.max_result_rows must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_validates() {
        ServiceConfig::default().validate().expect("valid default");
    }

    #[test]
    fn save_and_load_round_trip() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("config.toml");
        let mut cfg = ServiceConfig::default();
        cfg.model.provider = "groq".to_string();
        cfg.memory.timeout_seconds = 120;
        cfg.save(&path).expect("save");

        let loaded = ServiceConfig::load(&path).expect("load");
        assert_eq!(loaded.model.provider, "groq");
        assert_eq!(loaded.memory.timeout_seconds, 120);
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let mut cfg = ServiceConfig::default();
        let mut vars = HashMap::new();
        vars.insert("AI_PROVIDER", "OpenAI");
        vars.insert("AI_MODEL", "gpt-4o-mini");
        vars.insert("DATABASE_DSN", "sqlite::memory:");
        vars.insert("MEMORY_TIMEOUT_SECONDS", "300");

        cfg.apply_overrides_from(|name| vars.get(name).map(|v| v.to_string()))
            .expect("overrides apply");

        assert_eq!(cfg.model.provider, "openai");
        assert_eq!(cfg.model.model_id, "gpt-4o-mini");
        assert_eq!(cfg.database_dsn, "sqlite::memory:");
        assert_eq!(cfg.memory.timeout_seconds, 300);
    }

    #[test]
    fn malformed_timeout_override_is_rejected() {
        let mut cfg = ServiceConfig::default();
        let err = cfg
            .apply_overrides_from(|name| {
                (name == "MEMORY_TIMEOUT_SECONDS").then(|| "soon".to_string())
            })
            .expect_err("should reject");
        assert!(matches!(err, ConfigError::InvalidOverride { .. }));
    }

    #[test]
    fn zero_timeout_fails_validation() {
        let mut cfg = ServiceConfig::default();
        cfg.memory.timeout_seconds = 0;
        assert!(cfg.validate().is_err());
    }
}
