//! Command handlers for the `plugin-settings` binary.

mod common;
mod settings;

pub(crate) use common::open_registry;
pub(crate) use settings::{cmd_get, cmd_list, cmd_remove, cmd_set, cmd_show, cmd_upload};
