//! Settings data model
//!
//! This module defines the records the registry caches and hands to the
//! datastore: override levels, the per-level bundle of values, the persisted
//! plugin record and the display annotations overlaid on it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SettingsError;

/// Override tier at which a setting value is recorded.
///
/// Levels are never merged: a read at one level only sees what was written
/// at that level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    #[default]
    User,
    System,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::User => "user",
            Level::System => "system",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Level::User),
            "system" => Ok(Level::System),
            other => Err(SettingsError::Config(format!(
                "Unknown settings level '{}', expected 'user' or 'system'",
                other
            ))),
        }
    }
}

/// Per-plugin mapping from level to `key -> value`.
///
/// A level that is absent (or explicitly `null` in JSON) has no overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<Map<String, Value>>,
}

impl Bundle {
    /// Values recorded at `level`, if that level has a mapping.
    pub fn level(&self, level: Level) -> Option<&Map<String, Value>> {
        match level {
            Level::User => self.user.as_ref(),
            Level::System => self.system.as_ref(),
        }
    }

    /// Mutable access to the mapping at `level`, if one exists.
    pub fn level_mut(&mut self, level: Level) -> Option<&mut Map<String, Value>> {
        self.slot_mut(level).as_mut()
    }

    /// Mapping at `level`, created empty on first use.
    pub fn level_or_insert(&mut self, level: Level) -> &mut Map<String, Value> {
        self.slot_mut(level).get_or_insert_with(Map::new)
    }

    fn slot_mut(&mut self, level: Level) -> &mut Option<Map<String, Value>> {
        match level {
            Level::User => &mut self.user,
            Level::System => &mut self.system,
        }
    }
}

/// Display metadata attached to a single `(plugin, key)` pair.
///
/// Purely additive; a missing annotation is never an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_class: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_label: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Annotation {
    /// Annotation carrying only a label.
    pub fn labelled(label: &str) -> Self {
        Self {
            label: Some(label.to_string()),
            ..Self::default()
        }
    }
}

/// Annotations for one plugin, keyed by setting key.
pub type AnnotationOverlay = BTreeMap<String, Annotation>;

/// Persisted settings for one plugin.
///
/// `annotation` is only populated on views handed out by the registry; it is
/// stripped before anything reaches the datastore.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginRecord {
    pub id: String,

    #[serde(default)]
    pub data: Bundle,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<AnnotationOverlay>,
}

impl PluginRecord {
    /// Empty record: no overrides at any level.
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    /// Builder used for seeding records.
    pub fn with_value(mut self, level: Level, key: &str, value: Value) -> Self {
        self.data.level_or_insert(level).insert(key.to_string(), value);
        self
    }

    /// Value recorded for `key` at `level`.
    pub fn value(&self, key: &str, level: Level) -> Option<&Value> {
        self.data.level(level)?.get(key)
    }

    /// Annotation overlaid for `key`, if this is a materialized view.
    pub fn annotation_for(&self, key: &str) -> Option<&Annotation> {
        self.annotation.as_ref()?.get(key)
    }

    /// Copy of this record without its annotation overlay.
    pub fn without_annotation(&self) -> Self {
        Self {
            id: self.id.clone(),
            data: self.data.clone(),
            annotation: None,
        }
    }
}
