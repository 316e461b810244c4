//! Support library for the `dirwatch-stress` runner.

#![allow(missing_docs)]

pub mod settings;

pub use settings::{CONFIG_JSON_ENV, CONFIG_PATH_ENV, SettingsSource};
