//! # dicefeed-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`FeedSettings::default()`]
//! 2. **User file**: `~/.dicefeed/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `DICEFEED_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
