//! Shared CLI setup: build a registry attached to the configured datastore.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use plugin_settings::config::{Config, DatastoreBackend};
use plugin_settings::datastore::{FileDatastore, MemoryDatastore};
use plugin_settings::settings::SettingsRegistry;

/// Registry plus the file backend it was attached to, if any.
pub(crate) struct OpenRegistry {
    pub(crate) registry: Arc<SettingsRegistry>,
    pub(crate) files: Option<FileDatastore>,
}

pub(crate) fn open_registry(config: &Config) -> Result<OpenRegistry> {
    let registry = Arc::new(SettingsRegistry::from_config(config));

    let files = match config.datastore.backend {
        DatastoreBackend::File => {
            let store = FileDatastore::new(config.datastore_path());
            info!(path = %store.dir().display(), "Using file datastore");
            registry
                .attach_datastore(Arc::new(store.clone()))
                .with_context(|| "Failed to attach file datastore")?;
            Some(store)
        }
        DatastoreBackend::Memory => {
            info!("Using in-memory datastore");
            registry
                .attach_datastore(Arc::new(MemoryDatastore::new()))
                .with_context(|| "Failed to attach memory datastore")?;
            None
        }
    };

    Ok(OpenRegistry { registry, files })
}
