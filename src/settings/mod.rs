//! Plugin settings registry
//!
//! This module holds the runtime registry for plugin settings and the
//! per-plugin handles built on top of it.
//!
//! # Architecture
//!
//! - **types**: Data model (`Level`, `Bundle`, `PluginRecord`, `Annotation`)
//! - **registry**: Cache, readiness gate and mutate/persist/notify cycle
//! - **handle**: Disposable per-plugin facade (`Settings`)
//! - **changes**: Broadcast of changed plugin ids
//!
//! # Flow
//!
//! ```text
//! caller ─▶ Settings ─▶ SettingsRegistry ─▶ Datastore (miss / mutation)
//!                              │
//!                              └─▶ cache update ─▶ change broadcast
//! ```

mod changes;
mod handle;
mod registry;
mod types;

pub use changes::DEFAULT_NOTIFY_CAPACITY;
pub use handle::Settings;
pub use registry::SettingsRegistry;
pub use types::{Annotation, AnnotationOverlay, Bundle, Level, PluginRecord};
