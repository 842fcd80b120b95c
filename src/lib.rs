//! Plugin Settings - runtime registry for per-plugin settings
//!
//! Caches settings for dynamically loaded plugins at two override levels
//! (`user`, `system`) over a pluggable, possibly not-yet-available datastore,
//! overlays display annotations that are never persisted, and broadcasts the
//! id of every plugin whose settings change.

pub mod config;
pub mod datastore;
pub mod error;
pub mod settings;

pub use config::Config;
pub use datastore::Datastore;
pub use error::{Result, SettingsError};
pub use settings::{Settings, SettingsRegistry};
