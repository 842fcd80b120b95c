//! Error types for the plugin settings registry
//!
//! This module defines all error types used throughout the crate. Uses
//! `thiserror` for ergonomic error handling with automatic `Display` and
//! `Error` trait implementations.

use thiserror::Error;

/// The primary error type for settings registry operations.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// A datastore was attached to a registry that already has one.
    ///
    /// This is a programming error: the first attachment stays in effect.
    #[error("Datastore already attached")]
    DatastoreAlreadyAttached,

    /// Persistence backend failures (lookup, transport, write errors, etc.)
    #[error("Datastore error: {0}")]
    Datastore(String),

    /// The datastore answered a fetch with a record for a different plugin.
    #[error("Datastore returned plugin '{returned}' when '{requested}' was requested")]
    PluginMismatch { requested: String, returned: String },

    /// The settings handle for this plugin has been disposed.
    #[error("Settings handle for '{0}' has been disposed")]
    Disposed(String),

    /// Configuration-related errors (invalid config, missing paths, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized `Result` type for settings registry operations.
pub type Result<T> = std::result::Result<T, SettingsError>;
