//! Settings registry
//!
//! This module provides [`SettingsRegistry`], the single source of truth for
//! in-memory plugin settings. It caches one [`PluginRecord`] per plugin id,
//! keeps a side table of display annotations that is never persisted, gates
//! every datastore access on a one-time attach, and broadcasts the id of each
//! plugin whose settings change.
//!
//! # Lifecycle
//!
//! ```text
//!   Unattached ──attach_datastore──▶ Attached
//!       │                               │
//!   cache misses wait              cache misses fetch
//! ```
//!
//! Records enter the cache on first `load` (or `upload`), are replaced on
//! reload and are mutated in place by `set`/`remove`. Nothing is ever evicted.
//!
//! Mutations of one plugin run inside a per-plugin critical section covering
//! both the cache write and the `save` call, so concurrent writers persist and
//! notify in the order they entered. The cache is written before `save`
//! resolves and is not rolled back when it fails.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::datastore::Datastore;
use crate::error::{Result, SettingsError};

use super::changes::{ChangeHub, DEFAULT_NOTIFY_CAPACITY};
use super::handle::Settings;
use super::types::{Annotation, AnnotationOverlay, Level, PluginRecord};

/// In-memory registry of plugin settings backed by a pluggable datastore.
///
/// Share it behind an `Arc`; all operations take `&self`.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use plugin_settings::datastore::MemoryDatastore;
/// use plugin_settings::settings::{Level, SettingsRegistry};
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let registry = SettingsRegistry::new();
/// registry
///     .attach_datastore(Arc::new(MemoryDatastore::new()))
///     .unwrap();
///
/// registry.set("pkg.a", "fontSize", json!(14), Level::User).await.unwrap();
/// let value = registry.get("pkg.a", "fontSize", Level::User).await.unwrap();
/// assert_eq!(value, Some(json!(14)));
/// # })
/// ```
pub struct SettingsRegistry {
    /// Plugin id to cached record, in first-load order.
    cache: RwLock<IndexMap<String, PluginRecord>>,

    /// Plugin id to `key -> annotation`. Survives reloads.
    annotations: RwLock<HashMap<String, AnnotationOverlay>>,

    /// Readiness gate. `None` until a datastore is attached.
    datastore: watch::Sender<Option<Arc<dyn Datastore>>>,

    /// Per-plugin critical sections for load/mutate/persist.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,

    changes: ChangeHub,
}

impl SettingsRegistry {
    /// Create an unattached registry with the default notification capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_NOTIFY_CAPACITY)
    }

    /// Create an unattached registry buffering up to `capacity` change
    /// notifications per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (datastore, _rx) = watch::channel(None);
        Self {
            cache: RwLock::new(IndexMap::new()),
            annotations: RwLock::new(HashMap::new()),
            datastore,
            locks: Mutex::new(HashMap::new()),
            changes: ChangeHub::new(capacity),
        }
    }

    /// Create an unattached registry sized from `config`.
    pub fn from_config(config: &Config) -> Self {
        Self::with_capacity(config.notify_capacity)
    }

    /// Bind the datastore and release every operation waiting on it.
    ///
    /// # Errors
    /// `SettingsError::DatastoreAlreadyAttached` if a datastore is already
    /// bound. The existing attachment is kept. This indicates a bug in the
    /// host and should not be retried.
    pub fn attach_datastore(&self, datastore: Arc<dyn Datastore>) -> Result<()> {
        let attached = self.datastore.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(datastore);
            true
        });

        if !attached {
            warn!("Rejected second datastore attachment");
            return Err(SettingsError::DatastoreAlreadyAttached);
        }

        info!("Datastore attached");
        Ok(())
    }

    /// Whether a datastore has been attached.
    pub fn is_attached(&self) -> bool {
        self.datastore.borrow().is_some()
    }

    /// Wait for the datastore to be attached and return it.
    ///
    /// Never resolves if no datastore is ever attached.
    pub async fn wait_until_attached(&self) -> Arc<dyn Datastore> {
        let mut rx = self.datastore.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(datastore) = current {
                return datastore;
            }
            if rx.changed().await.is_err() {
                // The sender lives as long as `self`.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Load the settings view for `plugin`.
    ///
    /// Cached plugins are answered without touching the datastore unless
    /// `reload` is set. Otherwise the record is fetched (waiting for the
    /// datastore if necessary) and replaces any cached entry. The returned
    /// view is an independent copy carrying the current annotation overlay.
    pub async fn load(&self, plugin: &str, reload: bool) -> Result<PluginRecord> {
        if !reload {
            if let Some(view) = self.cached_view(plugin).await {
                debug!(plugin = %plugin, "Settings cache hit");
                return Ok(view);
            }
        }

        let datastore = self.wait_until_attached().await;
        let lock = self.plugin_lock(plugin).await;
        let guard = lock.lock().await;

        // Another task may have loaded it while we waited for the lock.
        if !reload {
            if let Some(view) = self.cached_view(plugin).await {
                return Ok(view);
            }
        }

        let record = match self.fetch_checked(datastore.as_ref(), plugin).await {
            Ok(record) => record,
            Err(e) => {
                drop(guard);
                self.release_plugin_lock(plugin, &lock).await;
                return Err(e);
            }
        };

        let record = record.without_annotation();
        self.cache
            .write()
            .await
            .insert(plugin.to_string(), record.clone());

        info!(plugin = %plugin, reload, "Loaded plugin settings");
        Ok(self.materialize(record).await)
    }

    /// Read `key` at `level` for `plugin`, loading the plugin on a cache miss.
    ///
    /// Returns `None` when the plugin, level or key has no recorded value.
    /// The value is a copy; mutating it does not affect the cache.
    pub async fn get(&self, plugin: &str, key: &str, level: Level) -> Result<Option<Value>> {
        if let Some(value) = self.cached_value(plugin, key, level).await {
            return Ok(value);
        }

        self.load(plugin, false).await?;
        Ok(self.cached_value(plugin, key, level).await.flatten())
    }

    /// Write `key = value` at `level`, persist the plugin and notify.
    ///
    /// # Errors
    /// Datastore failures are returned unchanged. The cache keeps the new
    /// value even when persisting fails; `load(plugin, true)` reconciles.
    pub async fn set(&self, plugin: &str, key: &str, value: Value, level: Level) -> Result<()> {
        if !self.is_cached(plugin).await {
            self.load(plugin, false).await?;
        }

        let datastore = self.wait_until_attached().await;
        let lock = self.plugin_lock(plugin).await;
        let _guard = lock.lock().await;

        let snapshot = {
            let mut cache = self.cache.write().await;
            let record = cache
                .entry(plugin.to_string())
                .or_insert_with(|| PluginRecord::new(plugin));
            record
                .data
                .level_or_insert(level)
                .insert(key.to_string(), value);
            record.clone()
        };
        debug!(plugin = %plugin, key = %key, level = %level, "Setting updated");

        self.persist(datastore.as_ref(), plugin, &snapshot).await
    }

    /// Delete `key` at `level`, persist the plugin and notify.
    ///
    /// Succeeds without side effects when the plugin is not cached or has no
    /// mapping at `level`. Removing an absent key from an existing level
    /// still persists and notifies.
    pub async fn remove(&self, plugin: &str, key: &str, level: Level) -> Result<()> {
        if !self.is_cached(plugin).await {
            debug!(plugin = %plugin, key = %key, "Remove on unloaded plugin ignored");
            return Ok(());
        }

        let datastore = self.wait_until_attached().await;
        let lock = self.plugin_lock(plugin).await;
        let _guard = lock.lock().await;

        let snapshot = {
            let mut cache = self.cache.write().await;
            let Some(record) = cache.get_mut(plugin) else {
                return Ok(());
            };
            let Some(values) = record.data.level_mut(level) else {
                debug!(plugin = %plugin, level = %level, "Remove on empty level ignored");
                return Ok(());
            };
            values.remove(key);
            record.clone()
        };
        debug!(plugin = %plugin, key = %key, level = %level, "Setting removed");

        self.persist(datastore.as_ref(), plugin, &snapshot).await
    }

    /// Set the display annotation for `(plugin, key)`.
    ///
    /// Annotations live beside the cache and are never sent to the datastore.
    /// They may be registered before the plugin is ever loaded. Always
    /// notifies.
    pub async fn annotate(&self, plugin: &str, key: &str, annotation: Annotation) {
        self.annotations
            .write()
            .await
            .entry(plugin.to_string())
            .or_default()
            .insert(key.to_string(), annotation);

        debug!(plugin = %plugin, key = %key, "Annotation registered");
        self.changes.emit(plugin);
    }

    /// Current annotation overlay for `plugin`.
    pub async fn annotations(&self, plugin: &str) -> AnnotationOverlay {
        self.annotations
            .read()
            .await
            .get(plugin)
            .cloned()
            .unwrap_or_default()
    }

    /// Install `record` under its id without fetching, persist it and notify.
    ///
    /// The cache is updated immediately; persisting waits for the datastore.
    pub async fn upload(&self, record: PluginRecord) -> Result<()> {
        let plugin = record.id.clone();
        let record = record.without_annotation();

        let lock = self.plugin_lock(&plugin).await;
        let _guard = lock.lock().await;

        self.cache
            .write()
            .await
            .insert(plugin.clone(), record.clone());
        info!(plugin = %plugin, "Uploaded plugin settings");

        let datastore = self.wait_until_attached().await;
        self.persist(datastore.as_ref(), &plugin, &record).await
    }

    /// Snapshot of every cached plugin, in first-load order, each with its
    /// current annotation overlay.
    pub async fn list_plugins(&self) -> Vec<PluginRecord> {
        let records: Vec<PluginRecord> = self.cache.read().await.values().cloned().collect();
        let annotations = self.annotations.read().await;
        records
            .into_iter()
            .map(|mut record| {
                record.annotation = annotations.get(&record.id).cloned();
                record
            })
            .collect()
    }

    /// Whether `plugin` has a cached record.
    pub async fn is_cached(&self, plugin: &str) -> bool {
        self.cache.read().await.contains_key(plugin)
    }

    /// Subscribe to change notifications. Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }

    /// Number of live change subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.changes.subscriber_count()
    }

    /// Load `plugin` and return a settings handle bound to it.
    pub async fn settings(self: &Arc<Self>, plugin: &str) -> Result<Settings> {
        Settings::load(Arc::clone(self), plugin).await
    }

    async fn fetch_checked(&self, datastore: &dyn Datastore, plugin: &str) -> Result<PluginRecord> {
        let record = datastore.fetch(plugin).await?;
        if record.id != plugin {
            return Err(SettingsError::PluginMismatch {
                requested: plugin.to_string(),
                returned: record.id,
            });
        }
        Ok(record)
    }

    async fn persist(
        &self,
        datastore: &dyn Datastore,
        plugin: &str,
        record: &PluginRecord,
    ) -> Result<()> {
        if let Err(e) = datastore.save(plugin, record).await {
            warn!(
                plugin = %plugin,
                error = %e,
                "Failed to persist settings, cache is ahead of datastore"
            );
            return Err(e);
        }

        self.changes.emit(plugin);
        Ok(())
    }

    async fn plugin_lock(&self, plugin: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(plugin.to_string()).or_default())
    }

    /// Forget the critical section of a plugin that never made it into the
    /// cache. Kept while other tasks still hold or wait on it.
    async fn release_plugin_lock(&self, plugin: &str, lock: &Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        // One reference in the map, one held by the caller.
        if Arc::strong_count(lock) > 2 || self.is_cached(plugin).await {
            return;
        }
        if locks.get(plugin).is_some_and(|held| Arc::ptr_eq(held, lock)) {
            locks.remove(plugin);
        }
    }

    #[cfg(test)]
    async fn lock_count(&self) -> usize {
        self.locks.lock().await.len()
    }

    async fn cached_value(&self, plugin: &str, key: &str, level: Level) -> Option<Option<Value>> {
        let cache = self.cache.read().await;
        let record = cache.get(plugin)?;
        Some(record.value(key, level).cloned())
    }

    async fn cached_view(&self, plugin: &str) -> Option<PluginRecord> {
        let record = self.cache.read().await.get(plugin).cloned()?;
        Some(self.materialize(record).await)
    }

    async fn materialize(&self, mut record: PluginRecord) -> PluginRecord {
        record.annotation = self.annotations.read().await.get(&record.id).cloned();
        record
    }
}

impl Default for SettingsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::{MemoryDatastore, MockDatastore};
    use futures::future::join_all;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::time::timeout;

    fn seeded_store() -> Arc<MemoryDatastore> {
        Arc::new(MemoryDatastore::with_records([PluginRecord::new("pkg.a")
            .with_value(Level::User, "fontSize", json!(12))]))
    }

    fn attached(store: Arc<MemoryDatastore>) -> SettingsRegistry {
        let registry = SettingsRegistry::new();
        registry.attach_datastore(store).unwrap();
        registry
    }

    #[tokio::test]
    async fn test_operations_wait_for_datastore() {
        let registry = Arc::new(SettingsRegistry::new());
        assert!(!registry.is_attached());

        let load = timeout(Duration::from_millis(50), registry.load("pkg.a", false)).await;
        assert!(load.is_err(), "load resolved before a datastore was attached");

        let get = timeout(
            Duration::from_millis(50),
            registry.get("pkg.a", "fontSize", Level::User),
        )
        .await;
        assert!(get.is_err(), "get resolved before a datastore was attached");

        let task = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.get("pkg.a", "fontSize", Level::User).await })
        };
        tokio::task::yield_now().await;

        registry.attach_datastore(seeded_store()).unwrap();
        assert!(registry.is_attached());

        let value = task.await.unwrap().unwrap();
        assert_eq!(value, Some(json!(12)));
    }

    #[tokio::test]
    async fn test_seeded_plugin_scenario() {
        let store = seeded_store();
        let registry = attached(Arc::clone(&store));

        let view = registry.load("pkg.a", false).await.unwrap();
        assert_eq!(view.id, "pkg.a");
        assert_eq!(view.value("fontSize", Level::User), Some(&json!(12)));

        registry
            .set("pkg.a", "fontSize", json!(14), Level::User)
            .await
            .unwrap();

        let persisted = store.record("pkg.a").await.unwrap();
        assert_eq!(persisted.value("fontSize", Level::User), Some(&json!(14)));
        assert_eq!(
            registry.get("pkg.a", "fontSize", Level::System).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_second_attach_is_rejected() {
        let mut rejected = MockDatastore::new();
        rejected.expect_fetch().never();
        rejected.expect_save().never();

        let registry = attached(seeded_store());
        let err = registry.attach_datastore(Arc::new(rejected)).unwrap_err();
        assert!(matches!(err, SettingsError::DatastoreAlreadyAttached));

        // First attachment still answers.
        assert_eq!(
            registry.get("pkg.a", "fontSize", Level::User).await.unwrap(),
            Some(json!(12))
        );
    }

    #[tokio::test]
    async fn test_set_then_get_is_isolated_from_callers() {
        let registry = attached(Arc::new(MemoryDatastore::new()));
        let mut value = json!({"families": ["Mono", "Serif"]});

        registry
            .set("pkg.b", "font", value.clone(), Level::System)
            .await
            .unwrap();
        value["families"] = json!([]);

        let mut read = registry
            .get("pkg.b", "font", Level::System)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, json!({"families": ["Mono", "Serif"]}));

        read["families"] = json!(["Changed"]);
        let mut view = registry.load("pkg.b", false).await.unwrap();
        view.data.level_or_insert(Level::System).clear();

        assert_eq!(
            registry.get("pkg.b", "font", Level::System).await.unwrap(),
            Some(json!({"families": ["Mono", "Serif"]}))
        );
    }

    #[tokio::test]
    async fn test_levels_are_not_merged() {
        let registry = attached(Arc::new(MemoryDatastore::new()));
        registry
            .set("pkg.a", "theme", json!("dark"), Level::System)
            .await
            .unwrap();

        assert_eq!(registry.get("pkg.a", "theme", Level::User).await.unwrap(), None);
        assert_eq!(
            registry.get("pkg.a", "theme", Level::System).await.unwrap(),
            Some(json!("dark"))
        );
    }

    #[tokio::test]
    async fn test_explicit_null_is_distinct_from_absent() {
        let registry = attached(Arc::new(MemoryDatastore::new()));
        registry
            .set("pkg.a", "cleared", Value::Null, Level::User)
            .await
            .unwrap();

        assert_eq!(
            registry.get("pkg.a", "cleared", Level::User).await.unwrap(),
            Some(Value::Null)
        );
        assert_eq!(registry.get("pkg.a", "other", Level::User).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove_on_unloaded_plugin_skips_datastore() {
        let mut store = MockDatastore::new();
        store.expect_fetch().never();
        store.expect_save().never();

        let registry = SettingsRegistry::new();
        registry.attach_datastore(Arc::new(store)).unwrap();
        let mut rx = registry.subscribe();

        registry.remove("pkg.x", "k", Level::User).await.unwrap();

        assert!(!registry.is_cached("pkg.x").await);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_remove_on_missing_level_is_noop() {
        let store = seeded_store();
        let registry = attached(Arc::clone(&store));
        registry.load("pkg.a", false).await.unwrap();
        let mut rx = registry.subscribe();

        registry.remove("pkg.a", "fontSize", Level::System).await.unwrap();

        assert_eq!(store.save_count(), 0);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(
            registry.get("pkg.a", "fontSize", Level::User).await.unwrap(),
            Some(json!(12))
        );
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let store = seeded_store();
        let registry = attached(Arc::clone(&store));

        registry.remove("pkg.a", "fontSize", Level::User).await.unwrap();
        registry.load("pkg.a", false).await.unwrap();

        registry.remove("pkg.a", "fontSize", Level::User).await.unwrap();
        let once = registry.load("pkg.a", false).await.unwrap();
        let persisted_once = store.record("pkg.a").await.unwrap();

        registry.remove("pkg.a", "fontSize", Level::User).await.unwrap();
        let twice = registry.load("pkg.a", false).await.unwrap();

        assert_eq!(once, twice);
        assert_eq!(store.record("pkg.a").await.unwrap(), persisted_once);
        assert_eq!(registry.get("pkg.a", "fontSize", Level::User).await.unwrap(), None);
        assert_eq!(persisted_once.value("fontSize", Level::User), None);
    }

    #[tokio::test]
    async fn test_remove_notifies_current_subscribers_once() {
        let registry = attached(Arc::new(MemoryDatastore::new()));
        registry
            .set("pkg.a", "k", json!(1), Level::User)
            .await
            .unwrap();
        let mut rx = registry.subscribe();

        registry.remove("pkg.a", "k", Level::User).await.unwrap();

        assert_eq!(rx.try_recv().unwrap(), "pkg.a");
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(registry.get("pkg.a", "k", Level::User).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove_never_set_key_returns_absent() {
        let registry = attached(seeded_store());
        registry.load("pkg.a", false).await.unwrap();

        registry.remove("pkg.a", "missing", Level::User).await.unwrap();

        assert_eq!(registry.get("pkg.a", "missing", Level::User).await.unwrap(), None);
        assert_eq!(
            registry.get("pkg.a", "fontSize", Level::User).await.unwrap(),
            Some(json!(12))
        );
    }

    #[tokio::test]
    async fn test_annotate_before_first_load() {
        let store = seeded_store();
        let registry = attached(Arc::clone(&store));
        let mut rx = registry.subscribe();
        let annotation = Annotation {
            caption: Some("Editor font size".into()),
            label: Some("Font size".into()),
            ..Annotation::default()
        };

        registry
            .annotate("pkg.a", "fontSize", annotation.clone())
            .await;
        assert_eq!(rx.try_recv().unwrap(), "pkg.a");
        assert!(!registry.is_cached("pkg.a").await);

        let view = registry.load("pkg.a", false).await.unwrap();
        assert_eq!(view.annotation_for("fontSize"), Some(&annotation));

        registry
            .set("pkg.a", "fontSize", json!(16), Level::User)
            .await
            .unwrap();
        assert!(store.record("pkg.a").await.unwrap().annotation.is_none());
    }

    #[tokio::test]
    async fn test_cached_view_reflects_current_annotations() {
        let registry = attached(seeded_store());
        let first = registry.load("pkg.a", false).await.unwrap();
        assert!(first.annotation.is_none());

        registry
            .annotate("pkg.a", "fontSize", Annotation::labelled("Size"))
            .await;
        registry
            .annotate("pkg.a", "fontSize", Annotation::labelled("Font size"))
            .await;

        let second = registry.load("pkg.a", false).await.unwrap();
        assert_eq!(
            second.annotation_for("fontSize"),
            Some(&Annotation::labelled("Font size"))
        );

        let reloaded = registry.load("pkg.a", true).await.unwrap();
        assert_eq!(reloaded.annotation, second.annotation);
        assert_eq!(registry.annotations("pkg.a").await.len(), 1);
        assert!(registry.annotations("pkg.none").await.is_empty());
    }

    #[tokio::test]
    async fn test_set_notifies_current_subscribers_once() {
        let registry = attached(Arc::new(MemoryDatastore::new()));
        let mut rx = registry.subscribe();

        registry
            .set("pkg.a", "k", json!(1), Level::User)
            .await
            .unwrap();

        assert_eq!(rx.try_recv().unwrap(), "pkg.a");
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        let mut late = registry.subscribe();
        assert!(matches!(late.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_load_does_not_notify() {
        let registry = attached(seeded_store());
        let mut rx = registry.subscribe();

        registry.load("pkg.a", false).await.unwrap();
        registry.load("pkg.a", true).await.unwrap();

        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_fetch_failure_propagates() {
        let mut store = MockDatastore::new();
        store
            .expect_fetch()
            .times(2)
            .returning(|_| Err(SettingsError::Datastore("backend offline".into())));
        store.expect_save().never();

        let registry = SettingsRegistry::new();
        registry.attach_datastore(Arc::new(store)).unwrap();

        let err = registry.load("pkg.a", false).await.unwrap_err();
        assert!(matches!(err, SettingsError::Datastore(ref m) if m == "backend offline"));

        let err = registry
            .set("pkg.a", "k", json!(1), Level::User)
            .await
            .unwrap_err();
        assert!(matches!(err, SettingsError::Datastore(_)));
        assert!(!registry.is_cached("pkg.a").await);
    }

    #[tokio::test]
    async fn test_fetch_with_wrong_id_is_rejected() {
        let mut store = MockDatastore::new();
        store
            .expect_fetch()
            .returning(|_| Ok(PluginRecord::new("pkg.other")));

        let registry = SettingsRegistry::new();
        registry.attach_datastore(Arc::new(store)).unwrap();

        let err = registry.load("pkg.a", false).await.unwrap_err();
        assert!(matches!(
            err,
            SettingsError::PluginMismatch { ref requested, ref returned }
                if requested == "pkg.a" && returned == "pkg.other"
        ));
        assert!(!registry.is_cached("pkg.a").await);
    }

    #[tokio::test]
    async fn test_failed_save_leaves_cache_ahead() {
        let mut store = MockDatastore::new();
        store
            .expect_fetch()
            .times(2)
            .returning(|plugin| Ok(PluginRecord::new(plugin)));
        store
            .expect_save()
            .times(1)
            .returning(|_, _| Err(SettingsError::Datastore("disk full".into())));

        let registry = SettingsRegistry::new();
        registry.attach_datastore(Arc::new(store)).unwrap();
        let mut rx = registry.subscribe();

        let err = registry
            .set("pkg.a", "k", json!("v"), Level::User)
            .await
            .unwrap_err();
        assert!(matches!(err, SettingsError::Datastore(ref m) if m == "disk full"));

        assert_eq!(
            registry.get("pkg.a", "k", Level::User).await.unwrap(),
            Some(json!("v"))
        );
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        registry.load("pkg.a", true).await.unwrap();
        assert_eq!(registry.get("pkg.a", "k", Level::User).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reload_replaces_cached_record() {
        let store = seeded_store();
        let registry = attached(Arc::clone(&store));
        registry.load("pkg.a", false).await.unwrap();

        let external = PluginRecord::new("pkg.a").with_value(Level::User, "fontSize", json!(20));
        store.save("pkg.a", &external).await.unwrap();

        let cached = registry.load("pkg.a", false).await.unwrap();
        assert_eq!(cached.value("fontSize", Level::User), Some(&json!(12)));

        let reloaded = registry.load("pkg.a", true).await.unwrap();
        assert_eq!(reloaded.value("fontSize", Level::User), Some(&json!(20)));
        assert_eq!(
            registry.get("pkg.a", "fontSize", Level::User).await.unwrap(),
            Some(json!(20))
        );
    }

    #[tokio::test]
    async fn test_upload_installs_persists_and_notifies() {
        let store = Arc::new(MemoryDatastore::new());
        let registry = attached(Arc::clone(&store));
        let mut rx = registry.subscribe();

        let mut record = PluginRecord::new("pkg.c").with_value(Level::System, "mode", json!("vim"));
        record.annotation = Some(AnnotationOverlay::new());
        registry.upload(record).await.unwrap();

        assert_eq!(rx.try_recv().unwrap(), "pkg.c");
        assert_eq!(
            registry.get("pkg.c", "mode", Level::System).await.unwrap(),
            Some(json!("vim"))
        );
        let persisted = store.record("pkg.c").await.unwrap();
        assert!(persisted.annotation.is_none());
        assert_eq!(persisted.value("mode", Level::System), Some(&json!("vim")));

        registry
            .upload(PluginRecord::new("pkg.c"))
            .await
            .unwrap();
        assert_eq!(registry.get("pkg.c", "mode", Level::System).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_upload_before_attach_waits_to_persist() {
        let registry = Arc::new(SettingsRegistry::new());
        let task = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .upload(PluginRecord::new("pkg.d").with_value(Level::User, "k", json!(1)))
                    .await
            })
        };

        let pending = timeout(Duration::from_millis(50), async {
            while !registry.is_cached("pkg.d").await {
                tokio::task::yield_now().await;
            }
        })
        .await;
        assert!(pending.is_ok(), "upload did not reach the cache");

        let store = Arc::new(MemoryDatastore::new());
        registry.attach_datastore(store.clone()).unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(
            store.record("pkg.d").await.unwrap().value("k", Level::User),
            Some(&json!(1))
        );
    }

    #[tokio::test]
    async fn test_list_plugins_in_first_load_order() {
        let registry = attached(seeded_store());
        registry.load("pkg.z", false).await.unwrap();
        registry.load("pkg.a", false).await.unwrap();
        registry.load("pkg.m", false).await.unwrap();
        registry.load("pkg.z", true).await.unwrap();
        registry
            .annotate("pkg.a", "fontSize", Annotation::labelled("Font size"))
            .await;

        let mut listed = registry.list_plugins().await;
        let ids: Vec<&str> = listed.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["pkg.z", "pkg.a", "pkg.m"]);
        assert!(listed[1].annotation_for("fontSize").is_some());
        assert!(listed[0].annotation.is_none());

        listed[1].data = Default::default();
        assert_eq!(
            registry.get("pkg.a", "fontSize", Level::User).await.unwrap(),
            Some(json!(12))
        );
        assert_eq!(registry.list_plugins().await.len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_first_loads_fetch_once() {
        let mut store = MockDatastore::new();
        store
            .expect_fetch()
            .times(1)
            .returning(|plugin| Ok(PluginRecord::new(plugin)));

        let registry = SettingsRegistry::new();
        registry.attach_datastore(Arc::new(store)).unwrap();

        let reads = (0..5).map(|_| registry.get("pkg.a", "k", Level::User));
        for result in join_all(reads).await {
            assert_eq!(result.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_concurrent_sets_on_distinct_keys_all_persist() {
        let store = Arc::new(MemoryDatastore::new());
        let registry = attached(Arc::clone(&store));
        registry.load("pkg.a", false).await.unwrap();
        let mut rx = registry.subscribe();

        let writes = (0..10).map(|i| {
            let registry = &registry;
            async move {
                registry
                    .set("pkg.a", &format!("key{}", i), json!(i), Level::User)
                    .await
            }
        });
        for result in join_all(writes).await {
            result.unwrap();
        }

        let persisted = store.record("pkg.a").await.unwrap();
        assert_eq!(persisted.data.level(Level::User).unwrap().len(), 10);
        assert_eq!(store.save_count(), 10);
        for _ in 0..10 {
            assert_eq!(rx.try_recv().unwrap(), "pkg.a");
        }
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    /// Datastore whose `save` takes longer the smaller the saved `k` is, so
    /// unserialized writers would finish in reverse order.
    #[derive(Default)]
    struct SlowSaveDatastore {
        inner: MemoryDatastore,
        completed: std::sync::Mutex<Vec<i64>>,
    }

    #[async_trait::async_trait]
    impl Datastore for SlowSaveDatastore {
        async fn fetch(&self, plugin: &str) -> Result<PluginRecord> {
            self.inner.fetch(plugin).await
        }

        async fn save(&self, plugin: &str, record: &PluginRecord) -> Result<()> {
            let value = record
                .value("k", Level::User)
                .and_then(Value::as_i64)
                .unwrap_or_default();
            let delay = 5u64.saturating_sub(value as u64) * 10;
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.completed.lock().unwrap().push(value);
            self.inner.save(plugin, record).await
        }
    }

    #[tokio::test]
    async fn test_same_key_sets_persist_in_call_order() {
        let store = Arc::new(SlowSaveDatastore::default());
        let registry = Arc::new(SettingsRegistry::new());
        registry.attach_datastore(store.clone()).unwrap();
        registry.load("pkg.a", false).await.unwrap();
        let mut rx = registry.subscribe();

        let tasks: Vec<_> = (0..5)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    registry.set("pkg.a", "k", json!(i), Level::User).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(*store.completed.lock().unwrap(), vec![0, 1, 2, 3, 4]);

        let cached = registry.get("pkg.a", "k", Level::User).await.unwrap();
        let persisted = store.inner.record("pkg.a").await.unwrap();
        assert_eq!(cached, Some(json!(4)));
        assert_eq!(persisted.value("k", Level::User), cached.as_ref());

        for _ in 0..5 {
            assert_eq!(rx.try_recv().unwrap(), "pkg.a");
        }
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_failed_first_load_releases_plugin_lock() {
        let fetches = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut store = MockDatastore::new();
        {
            let fetches = Arc::clone(&fetches);
            store.expect_fetch().returning(move |plugin| {
                let id = plugin.to_string();
                let n = fetches.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                // pkg.missing never answers; pkg.a answers only its first fetch.
                if id == "pkg.missing" || n > 2 {
                    return Err(SettingsError::Datastore("not reachable".into()));
                }
                Ok(PluginRecord::new(&id))
            });
        }

        let registry = SettingsRegistry::new();
        registry.attach_datastore(Arc::new(store)).unwrap();

        assert!(registry.load("pkg.missing", false).await.is_err());
        assert!(registry.load("pkg.missing", true).await.is_err());
        assert_eq!(registry.lock_count().await, 0);
        assert!(!registry.is_cached("pkg.missing").await);

        registry.load("pkg.a", false).await.unwrap();
        assert_eq!(registry.lock_count().await, 1);

        // A failed reload of a cached plugin keeps its critical section.
        assert!(registry.load("pkg.a", true).await.is_err());
        assert!(registry.is_cached("pkg.a").await);
        assert_eq!(registry.lock_count().await, 1);
        assert_eq!(fetches.load(std::sync::atomic::Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_last_writer_wins_on_same_key() {
        let store = Arc::new(MemoryDatastore::new());
        let registry = attached(Arc::clone(&store));

        let writes = (0..5).map(|i| registry.set("pkg.a", "k", json!(i), Level::User));
        for result in join_all(writes).await {
            result.unwrap();
        }

        let cached = registry.get("pkg.a", "k", Level::User).await.unwrap();
        let persisted = store.record("pkg.a").await.unwrap();
        assert_eq!(persisted.value("k", Level::User), cached.as_ref());
    }

    #[test]
    fn test_from_config_uses_capacity() {
        let config = Config {
            notify_capacity: 2,
            ..Config::default()
        };
        let registry = SettingsRegistry::from_config(&config);
        assert!(!registry.is_attached());
        assert_eq!(registry.subscriber_count(), 0);
    }
}
