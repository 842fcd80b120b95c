//! Persistence backends for plugin settings
//!
//! The registry never stores anything durably itself: it delegates to a
//! [`Datastore`], an external collaborator that can fetch and save one
//! plugin record at a time. Two backends ship with the crate:
//!
//! - **memory**: an in-process map, used for seeding and tests
//! - **file**: one JSON document per plugin inside a directory
//!
//! # Contract
//!
//! - `fetch(id)` must answer a record whose `id` equals the requested id.
//! - `save(id, record)` must be idempotent with respect to caller retries.
//! - Failures from either call are returned as-is to the registry's caller.

mod file;
mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::settings::PluginRecord;

pub use file::FileDatastore;
pub use memory::MemoryDatastore;

/// External persistence collaborator consumed by the settings registry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Fetch the persisted record for `plugin`.
    async fn fetch(&self, plugin: &str) -> Result<PluginRecord>;

    /// Persist `record` as the current state of `plugin`.
    async fn save(&self, plugin: &str, record: &PluginRecord) -> Result<()>;
}
