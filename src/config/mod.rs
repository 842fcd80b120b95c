//! Runtime configuration
//!
//! Configuration is read from `~/.plugin-settings/config.json` when present.
//! Every field has a default, so a missing file (or a partial one) is fine.
//! Environment variables override file values:
//!
//! - `PLUGIN_SETTINGS_DATASTORE_BACKEND`: `file` or `memory`
//! - `PLUGIN_SETTINGS_DATASTORE_PATH`: directory for the file backend
//! - `PLUGIN_SETTINGS_NOTIFY_CAPACITY`: change notification buffer size
//!
//! # Example config.json
//!
//! ```json
//! {
//!   "datastore": { "backend": "file", "path": "/var/lib/plugin-settings" },
//!   "notify_capacity": 128
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, SettingsError};
use crate::settings::DEFAULT_NOTIFY_CAPACITY;

const ENV_BACKEND: &str = "PLUGIN_SETTINGS_DATASTORE_BACKEND";
const ENV_PATH: &str = "PLUGIN_SETTINGS_DATASTORE_PATH";
const ENV_NOTIFY_CAPACITY: &str = "PLUGIN_SETTINGS_NOTIFY_CAPACITY";

/// Which datastore backs the registry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DatastoreBackend {
    /// One JSON document per plugin on disk.
    #[default]
    File,
    /// Process-local map; nothing survives exit.
    Memory,
}

/// Datastore section of the configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct DatastoreConfig {
    pub backend: DatastoreBackend,

    /// Directory for the file backend. Defaults to `~/.plugin-settings/plugins`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub datastore: DatastoreConfig,

    /// Buffered change notifications per subscriber before the oldest are
    /// dropped for a lagging receiver.
    pub notify_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            datastore: DatastoreConfig::default(),
            notify_capacity: DEFAULT_NOTIFY_CAPACITY,
        }
    }
}

impl Config {
    /// Base directory for configuration and default storage.
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_default()
            .join(".plugin-settings")
    }

    /// Default configuration file path.
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load from the default path with environment overrides applied.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::path())
    }

    /// Load from `path` with environment overrides applied.
    ///
    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = fs::read_to_string(path).map_err(|e| {
                SettingsError::Config(format!("Failed to read {}: {}", path.display(), e))
            })?;
            serde_json::from_str::<Config>(&content)?
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Config::default()
        };

        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(backend) = lookup(ENV_BACKEND) {
            match backend.trim().to_ascii_lowercase().as_str() {
                "file" => self.datastore.backend = DatastoreBackend::File,
                "memory" => self.datastore.backend = DatastoreBackend::Memory,
                other => warn!(value = %other, "Ignoring unknown {}", ENV_BACKEND),
            }
        }

        if let Some(path) = lookup(ENV_PATH) {
            self.datastore.path = Some(PathBuf::from(path));
        }

        if let Some(capacity) = lookup(ENV_NOTIFY_CAPACITY) {
            match capacity.trim().parse::<usize>() {
                Ok(n) => self.notify_capacity = n,
                Err(_) => warn!(value = %capacity, "Ignoring invalid {}", ENV_NOTIFY_CAPACITY),
            }
        }
    }

    /// Check the configuration for values the registry cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.notify_capacity == 0 {
            return Err(SettingsError::Config(
                "notify_capacity must be at least 1".to_string(),
            ));
        }
        if let Some(path) = &self.datastore.path {
            if path.as_os_str().is_empty() {
                return Err(SettingsError::Config(
                    "datastore.path must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Directory used by the file backend.
    pub fn datastore_path(&self) -> PathBuf {
        self.datastore
            .path
            .clone()
            .unwrap_or_else(|| Self::dir().join("plugins"))
    }
}
