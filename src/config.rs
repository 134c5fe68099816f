use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::ConfigError;

/// Bot core configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Document store configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Rate budgets: global ceiling plus per-action scopes
    #[serde(default)]
    pub rate: RateConfig,

    /// Feature module lifecycle configuration
    #[serde(default)]
    pub modules: ModulesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    /// Number of backup generations kept per document (at least 1)
    #[serde(default = "default_backup_retention")]
    pub backup_retention: usize,
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitConfig {
    pub ceiling: u32,
    pub window_secs: u64,
}

impl LimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateConfig {
    /// Shared ceiling across every scope
    #[serde(default = "default_global_limit")]
    pub global: LimitConfig,
    /// Applied to scopes that have no explicit entry
    #[serde(default = "default_scope_limit")]
    pub default_scope: LimitConfig,
    #[serde(default)]
    pub scopes: HashMap<String, LimitConfig>,
    /// What a send refused by the governor does
    #[serde(default)]
    pub deny_policy: DenyMode,
    /// Longest a `wait` send sleeps for budget before it is dropped
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DenyMode {
    /// Skip the send and report when budget frees up
    #[default]
    Drop,
    /// Sleep until budget frees up, bounded by `max_wait_ms`
    Wait,
}

impl RateConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModulesConfig {
    /// Pause between one module finishing its load and the next starting
    #[serde(default = "default_stagger_secs")]
    pub stagger_secs: u64,
    #[serde(default)]
    pub lock_timeout_ms: Option<u64>,
}

impl ModulesConfig {
    pub fn stagger(&self) -> Duration {
        Duration::from_secs(self.stagger_secs)
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./nyxnotes")
}

fn default_backup_retention() -> usize {
    1
}

fn default_write_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    50
}

fn default_global_limit() -> LimitConfig {
    LimitConfig {
        ceiling: 50,
        window_secs: 1,
    }
}

fn default_scope_limit() -> LimitConfig {
    LimitConfig {
        ceiling: 5,
        window_secs: 5,
    }
}

fn default_max_wait_ms() -> u64 {
    2000
}

fn default_stagger_secs() -> u64 {
    5
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            backup_retention: default_backup_retention(),
            write_retries: default_write_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            global: default_global_limit(),
            default_scope: default_scope_limit(),
            scopes: HashMap::new(),
            deny_policy: DenyMode::default(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            stagger_secs: default_stagger_secs(),
            lock_timeout_ms: None,
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        info!(
            root = %config.storage.root.display(),
            scopes = config.rate.scopes.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.backup_retention == 0 {
            return Err(ConfigError::Invalid(
                "storage.backup_retention must be at least 1".into(),
            ));
        }
        let limits = [
            ("global", &self.rate.global),
            ("default_scope", &self.rate.default_scope),
        ]
        .into_iter()
        .chain(self.rate.scopes.iter().map(|(k, v)| (k.as_str(), v)));
        for (name, limit) in limits {
            if limit.ceiling == 0 || limit.window_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "rate scope {name} needs a non-zero ceiling and window"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::from_toml("").unwrap();
        assert_eq!(cfg.storage.backup_retention, 1);
        assert_eq!(cfg.storage.root, PathBuf::from("./nyxnotes"));
        assert_eq!(cfg.modules.stagger(), Duration::from_secs(5));
        assert!(cfg.modules.lock_timeout().is_none());
        assert_eq!(cfg.rate.global.ceiling, 50);
        assert_eq!(cfg.rate.deny_policy, DenyMode::Drop);
        assert_eq!(cfg.rate.max_wait(), Duration::from_secs(2));
    }

    #[test]
    fn test_parse_scopes() {
        let cfg = Config::from_toml(
            r#"
            [storage]
            root = "/tmp/nyx"
            backup_retention = 3

            [rate]
            deny_policy = "wait"
            max_wait_ms = 500

            [rate.global]
            ceiling = 20
            window_secs = 2

            [rate.scopes."notes.reply"]
            ceiling = 4
            window_secs = 10

            [modules]
            stagger_secs = 1
            lock_timeout_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(cfg.storage.backup_retention, 3);
        assert_eq!(cfg.rate.global.window(), Duration::from_secs(2));
        assert_eq!(cfg.rate.scopes["notes.reply"].ceiling, 4);
        assert_eq!(cfg.rate.deny_policy, DenyMode::Wait);
        assert_eq!(cfg.rate.max_wait(), Duration::from_millis(500));
        assert_eq!(cfg.modules.lock_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_zero_retention_rejected() {
        let err = Config::from_toml("[storage]\nbackup_retention = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_zero_ceiling_rejected() {
        let err = Config::from_toml(
            "[rate.scopes.spam]\nceiling = 0\nwindow_secs = 1\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("spam"));
    }
}
