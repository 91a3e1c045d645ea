//! Stack configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/layerstore/config.toml)
//!
//! There are no environment overrides; everything a stack needs is either in
//! the file or passed in through `StackOptions`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory name used under the platform config and data directories
const APP_DIR: &str = "layerstore";

/// Stack configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding one `<identifier>.sqlite` file per model
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory searched for `<identifier>.model.toml` definitions
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,

    /// Options applied when the store is opened
    #[serde(default)]
    pub store: StoreSettings,

    /// Log file path (defaults to `<data_dir>/layerstore.log`)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Log level filter, e.g. "info" or "debug"
    #[serde(default)]
    pub log_level: Option<String>,
}

/// Options handed to the storage engine when it opens a store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Apply model version upgrades without asking
    #[serde(default = "default_true")]
    pub auto_migrate: bool,

    /// Follow `renamed_from` hints on entities while migrating
    #[serde(default = "default_true")]
    pub infer_mapping: bool,

    /// Protection applied to the store file at rest
    #[serde(default)]
    pub file_protection: FileProtection,

    /// SQLite rollback journal mode
    #[serde(default)]
    pub journal_mode: JournalMode,

    /// How long a write waits on a locked database before failing
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            auto_migrate: true,
            infer_mapping: true,
            file_protection: FileProtection::default(),
            journal_mode: JournalMode::default(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// File protection for the store at rest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileProtection {
    /// Leave file permissions as created
    None,
    /// Restrict the store to its owner where the platform supports it
    #[default]
    Complete,
}

/// Rollback journal modes (no WAL)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    #[default]
    Delete,
    Truncate,
    Persist,
}

impl JournalMode {
    /// Value passed to `PRAGMA journal_mode`
    pub fn as_pragma(&self) -> &'static str {
        match self {
            JournalMode::Delete => "delete",
            JournalMode::Truncate => "truncate",
            JournalMode::Persist => "persist",
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            model_dir: default_model_dir(),
            store: StoreSettings::default(),
            log_file: None,
            log_level: None,
        }
    }
}

impl Config {
    /// Build a configuration rooted at `data_dir`, with models under `data_dir/models`
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            model_dir: data_dir.join("models"),
            data_dir,
            ..Self::default()
        }
    }

    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        toml::from_str(toml_content).context("Failed to parse config TOML")
    }

    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file_path())
    }

    /// Get the config file path
    pub fn config_file_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    /// Path of the backing store for a model identifier
    pub fn store_path(&self, identifier: &str) -> PathBuf {
        self.data_dir.join(format!("{}.sqlite", identifier))
    }

    /// Path of the model definition for a model identifier
    pub fn model_path(&self, identifier: &str) -> PathBuf {
        self.model_dir.join(format!("{}.model.toml", identifier))
    }

    /// Log file path, falling back to the data directory
    pub fn log_path(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("layerstore.log"))
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}

fn default_true() -> bool {
    true
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.data_dir.ends_with("layerstore"));
        assert!(config.model_dir.ends_with("models"));
        assert!(config.store.auto_migrate);
        assert!(config.store.infer_mapping);
        assert_eq!(config.store.journal_mode, JournalMode::Delete);
        assert_eq!(config.store.file_protection, FileProtection::Complete);
    }

    #[test]
    fn test_store_path_uses_identifier() {
        let config = Config::with_data_dir("/data/app");

        assert_eq!(
            config.store_path("catalog"),
            PathBuf::from("/data/app/catalog.sqlite")
        );
        assert_eq!(
            config.model_path("catalog"),
            PathBuf::from("/data/app/models/catalog.model.toml")
        );
    }

    #[test]
    fn test_log_path_defaults_to_data_dir() {
        let mut config = Config::with_data_dir("/data/app");
        assert_eq!(config.log_path(), PathBuf::from("/data/app/layerstore.log"));

        config.log_file = Some(PathBuf::from("/var/log/stack.log"));
        assert_eq!(config.log_path(), PathBuf::from("/var/log/stack.log"));
    }

    #[test]
    fn test_load_from_str() {
        let toml = r#"
            data_dir = "/custom/data"
            model_dir = "/custom/models"
            log_level = "debug"

            [store]
            auto_migrate = false
            journal_mode = "truncate"
            file_protection = "none"
            busy_timeout_ms = 250
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.model_dir, PathBuf::from("/custom/models"));
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert!(!config.store.auto_migrate);
        // unspecified store keys keep their defaults
        assert!(config.store.infer_mapping);
        assert_eq!(config.store.journal_mode, JournalMode::Truncate);
        assert_eq!(config.store.file_protection, FileProtection::None);
        assert_eq!(config.store.busy_timeout_ms, 250);
    }

    #[test]
    fn test_load_from_str_rejects_wal() {
        let toml = r#"
            [store]
            journal_mode = "wal"
        "#;

        assert!(Config::load_from_str(toml).is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::with_data_dir(temp_dir.path().join("data"));
        config.store.busy_timeout_ms = 10;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.data_dir, config.data_dir);
        assert_eq!(loaded.store, config.store);
        // loading creates the data directory
        assert!(loaded.data_dir.exists());
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let path = PathBuf::from("/nonexistent/config.toml");
        let config = Config::load_from_path(&path).unwrap();
        assert!(config.store.auto_migrate);
        assert!(config.log_file.is_none());
    }
}
