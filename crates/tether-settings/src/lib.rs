//! # tether-settings
//!
//! Configuration for a tether server, fixed at process start.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`TetherSettings::default()`]
//! 2. **Settings file**: `~/.tether/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `TETHER_*` overrides (highest priority)
//!
//! There is no global instance: the loaded [`TetherSettings`] value is passed
//! explicitly to the components that need it.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = TetherSettings::default();
        let _path = settings_path();
    }

    #[test]
    fn default_settings_are_valid() {
        let settings = TetherSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.connections.buffer_size, 4096);
        assert_eq!(settings.connections.disconnect_timeout_ms, 10_000);
        assert_eq!(settings.server.path, "/ws");
    }
}
