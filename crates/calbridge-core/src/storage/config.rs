//! TOML-based sync configuration.
//!
//! Holds the tunables of the sync pipeline:
//! - Routine window depth and inbound horizon
//! - Token refresh buffer and retry policy
//! - Google endpoints and OAuth redirect port
//!
//! Configuration is stored at `~/.config/calbridge/config.toml`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::data_dir;
use crate::error::ConfigError;

/// Sync pipeline tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Days of routine occurrences kept materialized ahead of today.
    #[serde(default = "default_window_days")]
    pub window_days: u32,
    #[serde(default = "default_inbound_horizon_days")]
    pub inbound_horizon_days: u32,
    /// Refresh the access token when it expires within this many seconds.
    #[serde(default = "default_token_refresh_buffer_secs")]
    pub token_refresh_buffer_secs: u64,
    #[serde(default = "default_routine_marker")]
    pub routine_marker: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,
    #[serde(default = "default_retry_max_secs")]
    pub retry_max_secs: u64,
    #[serde(default = "default_refresh_max_attempts")]
    pub refresh_max_attempts: u32,
    #[serde(default = "default_materialize_interval_secs")]
    pub materialize_interval_secs: u64,
    /// Periodic inbound pass in daemon mode; 0 disables it.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

/// Google endpoints and OAuth settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoogleConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_redirect_port")]
    pub redirect_port: u16,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
}

/// Application configuration.
///
/// Serialized to/from TOML at `~/.config/calbridge/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub google: GoogleConfig,
}

// Default functions
fn default_window_days() -> u32 {
    7
}
fn default_inbound_horizon_days() -> u32 {
    30
}
fn default_token_refresh_buffer_secs() -> u64 {
    300
}
fn default_routine_marker() -> String {
    "[Routine] ".into()
}
fn default_max_attempts() -> u32 {
    5
}
fn default_retry_base_secs() -> u64 {
    2
}
fn default_retry_max_secs() -> u64 {
    300
}
fn default_refresh_max_attempts() -> u32 {
    3
}
fn default_materialize_interval_secs() -> u64 {
    6 * 60 * 60
}
fn default_reconcile_interval_secs() -> u64 {
    15 * 60
}
fn default_page_size() -> u32 {
    250
}
fn default_api_base() -> String {
    "https://www.googleapis.com/calendar/v3".into()
}
fn default_token_url() -> String {
    "https://oauth2.googleapis.com/token".into()
}
fn default_auth_url() -> String {
    "https://accounts.google.com/o/oauth2/v2/auth".into()
}
fn default_redirect_port() -> u16 {
    19821
}
fn default_scopes() -> Vec<String> {
    vec!["https://www.googleapis.com/auth/calendar.events".into()]
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
            inbound_horizon_days: default_inbound_horizon_days(),
            token_refresh_buffer_secs: default_token_refresh_buffer_secs(),
            routine_marker: default_routine_marker(),
            max_attempts: default_max_attempts(),
            retry_base_secs: default_retry_base_secs(),
            retry_max_secs: default_retry_max_secs(),
            refresh_max_attempts: default_refresh_max_attempts(),
            materialize_interval_secs: default_materialize_interval_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            page_size: default_page_size(),
        }
    }
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            token_url: default_token_url(),
            auth_url: default_auth_url(),
            redirect_port: default_redirect_port(),
            scopes: default_scopes(),
        }
    }
}

impl Config {
    fn get_json_value_by_path<'a>(
        root: &'a serde_json::Value,
        key: &str,
    ) -> Option<&'a serde_json::Value> {
        if key.is_empty() {
            return None;
        }

        let mut current = root;
        for part in key.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn set_json_value_by_path(
        root: &mut serde_json::Value,
        key: &str,
        value: &str,
    ) -> Result<(), ConfigError> {
        let unknown = || ConfigError::UnknownKey(key.to_string());
        let invalid = |message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        };

        let mut parts = key.split('.').peekable();
        if key.is_empty() {
            return Err(unknown());
        }

        let mut current = root;
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                let obj = current.as_object_mut().ok_or_else(unknown)?;
                let existing = obj.get(part).ok_or_else(unknown)?;

                let new_value = match existing {
                    serde_json::Value::Bool(_) => serde_json::Value::Bool(
                        value.parse::<bool>().map_err(|e| invalid(e.to_string()))?,
                    ),
                    serde_json::Value::Number(_) => {
                        let n = value
                            .parse::<u64>()
                            .map_err(|_| invalid(format!("cannot parse '{value}' as number")))?;
                        serde_json::Value::Number(n.into())
                    }
                    serde_json::Value::Array(_) => serde_json::Value::Array(
                        value
                            .split(',')
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(|s| serde_json::Value::String(s.to_string()))
                            .collect(),
                    ),
                    serde_json::Value::Object(_) => return Err(unknown()),
                    _ => serde_json::Value::String(value.into()),
                };

                obj.insert(part.to_string(), new_value);
                return Ok(());
            }

            current = current.get_mut(part).ok_or_else(unknown)?;
        }

        Err(unknown())
    }

    /// Default location of the config file.
    pub fn path() -> Result<PathBuf, ConfigError> {
        data_dir()
            .map(|dir| dir.join("config.toml"))
            .map_err(|e| ConfigError::WriteFailed(e.to_string()))
    }

    /// Load from the default location, writing defaults when missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed,
    /// or if the default config cannot be written to disk.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::path()?)
    }

    /// Load from `path`, writing defaults when the file does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let cfg: Config =
                    toml::from_str(&content).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
                cfg.validate()?;
                Ok(cfg)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let cfg = Self::default();
                cfg.save_to(path)?;
                Ok(cfg)
            }
            Err(e) => Err(ConfigError::ParseFailed(e.to_string())),
        }
    }

    /// Persist to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::WriteFailed(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::WriteFailed(e.to_string()))
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("sync.window_days", u64::from(self.sync.window_days)),
            ("sync.inbound_horizon_days", u64::from(self.sync.inbound_horizon_days)),
            ("sync.max_attempts", u64::from(self.sync.max_attempts)),
            ("sync.refresh_max_attempts", u64::from(self.sync.refresh_max_attempts)),
            ("sync.materialize_interval_secs", self.sync.materialize_interval_secs),
            ("sync.page_size", u64::from(self.sync.page_size)),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        if self.sync.retry_max_secs < self.sync.retry_base_secs {
            return Err(ConfigError::InvalidValue {
                key: "sync.retry_max_secs".to_string(),
                message: "must not be smaller than sync.retry_base_secs".to_string(),
            });
        }
        Ok(())
    }

    /// Get a config value as string by dot-separated key.
    pub fn get(&self, key: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let val = Self::get_json_value_by_path(&json, key)?;
        match val {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            other => Some(other.to_string()),
        }
    }

    /// Set a value by dotted key in memory. The result is validated; the
    /// caller decides whether to save.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is unknown or the value cannot be parsed.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut json =
            serde_json::to_value(&*self).map_err(|e| ConfigError::WriteFailed(e.to_string()))?;
        Self::set_json_value_by_path(&mut json, key, value)?;
        let updated: Config = serde_json::from_value(json).map_err(|e| {
            ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }
        })?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Every leaf key with its current value, in dotted form.
    pub fn entries(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        if let Ok(serde_json::Value::Object(sections)) = serde_json::to_value(self) {
            for (section, fields) in sections {
                if let serde_json::Value::Object(fields) = fields {
                    for name in fields.keys() {
                        let key = format!("{section}.{name}");
                        if let Some(value) = self.get(&key) {
                            out.push((key, value));
                        }
                    }
                }
            }
        }
        out.sort();
        out
    }

    /// Load from disk, returning default on error.
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }
}
