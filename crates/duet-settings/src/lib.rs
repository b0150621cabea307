//! # duet-settings
//!
//! Layered configuration for the duet server:
//! 1. compiled defaults ([`DuetSettings::default()`])
//! 2. `~/.duet/settings.json`, deep-merged over the defaults
//! 3. `DUET_*` environment overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, duet_home, load_settings, load_settings_from_path,
    settings_path,
};
pub use types::*;
