//! Filesystem datastore.
//!
//! Each plugin is stored as a pretty-printed JSON document named after its
//! encoded id:
//!
//! ```text
//! ~/.plugin-settings/plugins/
//! ├── pkg.a.json
//! └── %40scope%2Fextension%3Aplugin.json
//! ```
//!
//! Ids are escaped so that no plugin id can name a path outside the
//! directory. Writes go through a temporary sibling file and a rename.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{Result, SettingsError};
use crate::settings::PluginRecord;

use super::Datastore;

const EXTENSION: &str = "json";

/// Datastore keeping one JSON file per plugin in a directory.
#[derive(Debug, Clone)]
pub struct FileDatastore {
    dir: PathBuf,
}

impl FileDatastore {
    /// Create a datastore rooted at `dir`. The directory is created lazily on
    /// first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Root directory of this datastore.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the document backing `plugin`.
    pub fn path_for(&self, plugin: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", encode_plugin_id(plugin), EXTENSION))
    }

    /// Ids of every plugin with a stored document, sorted.
    pub async fn plugin_ids(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(id) = decode_plugin_id(stem) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl Datastore for FileDatastore {
    async fn fetch(&self, plugin: &str) -> Result<PluginRecord> {
        ensure_named(plugin)?;
        let path = self.path_for(plugin);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(plugin = %plugin, path = %path.display(), "No stored settings");
                return Ok(PluginRecord::new(plugin));
            }
            Err(e) => {
                return Err(SettingsError::Datastore(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let mut record: PluginRecord = serde_json::from_str(&content)?;
        record.annotation = None;
        Ok(record)
    }

    async fn save(&self, plugin: &str, record: &PluginRecord) -> Result<()> {
        ensure_named(plugin)?;
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            SettingsError::Datastore(format!(
                "Failed to create datastore directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let mut stored = record.without_annotation();
        stored.id = plugin.to_string();
        let json = serde_json::to_string_pretty(&stored)?;

        let path = self.path_for(plugin);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(|e| {
            SettingsError::Datastore(format!("Failed to write {}: {}", tmp.display(), e))
        })?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| {
            SettingsError::Datastore(format!("Failed to replace {}: {}", path.display(), e))
        })?;

        info!(plugin = %plugin, path = %path.display(), "Saved plugin settings");
        Ok(())
    }
}

/// An empty id has no file stem of its own.
fn ensure_named(plugin: &str) -> Result<()> {
    if plugin.is_empty() {
        return Err(SettingsError::Datastore("Plugin id must not be empty".to_string()));
    }
    Ok(())
}

/// Escape a plugin id into a file stem. Alphanumerics, `-`, `_` and `.` pass
/// through; every other byte (and a leading `.`) becomes `%XX`.
fn encode_plugin_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for (i, byte) in id.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric()
            || byte == b'-'
            || byte == b'_'
            || (byte == b'.' && i > 0);
        if keep {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// Inverse of `encode_plugin_id`. Only the canonical encoding is accepted, so
/// every decoded id maps back to the same file.
fn decode_plugin_id(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    let id = String::from_utf8(out).ok()?;
    (!id.is_empty() && encode_plugin_id(&id) == stem).then_some(id)
}
