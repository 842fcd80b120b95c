//! In-process datastore.
//!
//! Keeps records in a map guarded by an async lock. Unknown plugins fetch as
//! empty records, the same answer a fresh backend gives for a plugin that has
//! never been configured.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::settings::PluginRecord;

use super::Datastore;

/// Datastore holding every record in memory.
#[derive(Debug, Default)]
pub struct MemoryDatastore {
    records: RwLock<HashMap<String, PluginRecord>>,
    saves: AtomicUsize,
}

impl MemoryDatastore {
    /// Create an empty datastore.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a datastore seeded with `records`, keyed by their ids.
    pub fn with_records(records: impl IntoIterator<Item = PluginRecord>) -> Self {
        let records = records
            .into_iter()
            .map(|record| (record.id.clone(), record.without_annotation()))
            .collect();
        Self {
            records: RwLock::new(records),
            saves: AtomicUsize::new(0),
        }
    }

    /// Currently persisted record for `plugin`.
    pub async fn record(&self, plugin: &str) -> Option<PluginRecord> {
        self.records.read().await.get(plugin).cloned()
    }

    /// Number of successful `save` calls so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn fetch(&self, plugin: &str) -> Result<PluginRecord> {
        let records = self.records.read().await;
        Ok(records
            .get(plugin)
            .cloned()
            .unwrap_or_else(|| PluginRecord::new(plugin)))
    }

    async fn save(&self, plugin: &str, record: &PluginRecord) -> Result<()> {
        let mut stored = record.without_annotation();
        stored.id = plugin.to_string();
        self.records.write().await.insert(plugin.to_string(), stored);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
