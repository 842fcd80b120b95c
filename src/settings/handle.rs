//! Per-plugin settings handle.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SettingsError};

use super::registry::SettingsRegistry;
use super::types::{Level, PluginRecord};

/// Convenience view over a [`SettingsRegistry`] bound to one plugin id.
///
/// Reads and writes are forwarded live to the registry. The snapshot captured
/// at construction is only kept for inspection and is never re-read. Disposing
/// the handle leaves the registry cache untouched.
pub struct Settings {
    plugin: String,
    registry: Arc<SettingsRegistry>,
    snapshot: Option<PluginRecord>,
    disposed: bool,
}

impl Settings {
    /// Load `plugin` through `registry` and bind a handle to it.
    pub async fn load(registry: Arc<SettingsRegistry>, plugin: &str) -> Result<Self> {
        let snapshot = registry.load(plugin, false).await?;
        Ok(Self {
            plugin: plugin.to_string(),
            registry,
            snapshot: Some(snapshot),
            disposed: false,
        })
    }

    /// Plugin id this handle is bound to.
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Content captured when the handle was created. `None` once disposed.
    pub fn snapshot(&self) -> Option<&PluginRecord> {
        self.snapshot.as_ref()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub async fn get(&self, key: &str, level: Level) -> Result<Option<Value>> {
        self.ensure_live()?;
        self.registry.get(&self.plugin, key, level).await
    }

    pub async fn set(&self, key: &str, value: Value, level: Level) -> Result<()> {
        self.ensure_live()?;
        self.registry.set(&self.plugin, key, value, level).await
    }

    pub async fn remove(&self, key: &str, level: Level) -> Result<()> {
        self.ensure_live()?;
        self.registry.remove(&self.plugin, key, level).await
    }

    /// Mark the handle inert and drop its snapshot. Calling it again is a
    /// no-op. In-flight registry calls are not cancelled.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.snapshot = None;
        debug!(plugin = %self.plugin, "Settings handle disposed");
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed {
            return Err(SettingsError::Disposed(self.plugin.clone()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("plugin", &self.plugin)
            .field("disposed", &self.disposed)
            .finish()
    }
}
