//! Settings command handlers (get / set / remove / show / list / upload).

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;

use plugin_settings::settings::{Level, PluginRecord};

use super::common::OpenRegistry;

/// Parse a command-line value as JSON, falling back to a plain string.
pub(crate) fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub(crate) async fn cmd_get(
    open: &OpenRegistry,
    plugin: &str,
    key: &str,
    level: Level,
) -> Result<()> {
    let value = open
        .registry
        .get(plugin, key, level)
        .await
        .with_context(|| format!("Failed to read {}:{} ({})", plugin, key, level))?;
    println!("{}", value.unwrap_or(Value::Null));
    Ok(())
}

pub(crate) async fn cmd_set(
    open: &OpenRegistry,
    plugin: &str,
    key: &str,
    raw: &str,
    level: Level,
) -> Result<()> {
    let value = parse_value(raw);
    open.registry
        .set(plugin, key, value.clone(), level)
        .await
        .with_context(|| format!("Failed to write {}:{} ({})", plugin, key, level))?;
    println!("{}:{} ({}) = {}", plugin, key, level, value);
    Ok(())
}

pub(crate) async fn cmd_remove(
    open: &OpenRegistry,
    plugin: &str,
    key: &str,
    level: Level,
) -> Result<()> {
    // Removal only applies to loaded plugins.
    open.registry
        .load(plugin, false)
        .await
        .with_context(|| format!("Failed to load {}", plugin))?;
    open.registry
        .remove(plugin, key, level)
        .await
        .with_context(|| format!("Failed to remove {}:{} ({})", plugin, key, level))?;
    println!("Removed {}:{} ({})", plugin, key, level);
    Ok(())
}

pub(crate) async fn cmd_show(open: &OpenRegistry, plugin: &str) -> Result<()> {
    let view = open
        .registry
        .load(plugin, false)
        .await
        .with_context(|| format!("Failed to load {}", plugin))?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

pub(crate) async fn cmd_list(open: &OpenRegistry) -> Result<()> {
    if let Some(files) = &open.files {
        for id in files.plugin_ids().await? {
            open.registry
                .load(&id, false)
                .await
                .with_context(|| format!("Failed to load {}", id))?;
        }
    }

    let plugins = open.registry.list_plugins().await;
    if plugins.is_empty() {
        println!("No plugin settings stored.");
        return Ok(());
    }

    for record in plugins {
        let user = record.data.level(Level::User).map_or(0, |m| m.len());
        let system = record.data.level(Level::System).map_or(0, |m| m.len());
        println!("{}  (user: {}, system: {})", record.id, user, system);
    }
    Ok(())
}

pub(crate) async fn cmd_upload(open: &OpenRegistry, file: &Path) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let record: PluginRecord = serde_json::from_str(&content)
        .with_context(|| format!("Invalid plugin record in {}", file.display()))?;
    let id = record.id.clone();

    open.registry
        .upload(record)
        .await
        .with_context(|| format!("Failed to upload {}", id))?;
    println!("Uploaded settings for {}", id);
    Ok(())
}
