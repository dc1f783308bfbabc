//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{dicefeed_dir, FeedSettings, HistoryBackend};

/// Resolve the path to the settings file (`~/.dicefeed/settings.json`).
pub fn settings_path() -> PathBuf {
    dicefeed_dir().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<FeedSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or a settings combination
/// that fails [`FeedSettings::validate`] is an error.
pub fn load_settings_from_path(path: &Path) -> Result<FeedSettings> {
    let defaults = serde_json::to_value(FeedSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: FeedSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply process environment overrides to loaded settings.
pub fn apply_env_overrides(settings: &mut FeedSettings) {
    apply_overrides(settings, &|name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable lookup.
///
/// Invalid values are logged and ignored (falling back to file/default).
pub fn apply_overrides(settings: &mut FeedSettings, env: &dyn Fn(&str) -> Option<String>) {
    let vars = EnvReader { env };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = vars.string("DICEFEED_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = vars.u16("PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = vars.u16("DICEFEED_PORT", 1, 65535) {
        settings.server.port = v;
    }

    // ── Upstream ────────────────────────────────────────────────────
    if let Some(v) = vars.string("DICEFEED_CREDENTIALS_URL") {
        settings.upstream.credentials_url = v;
    }
    if let Some(v) = vars.string("DICEFEED_SOCKET_URL") {
        settings.upstream.socket_url = v;
    }

    // ── Timing ──────────────────────────────────────────────────────
    if let Some(v) = vars.u64("DICEFEED_HEARTBEAT_INTERVAL_MS", 100, 600_000) {
        settings.timing.heartbeat_interval_ms = v;
    }
    if let Some(v) = vars.u64("DICEFEED_HEARTBEAT_TIMEOUT_MS", 100, 600_000) {
        settings.timing.heartbeat_timeout_ms = v;
    }
    if let Some(v) = vars.u64("DICEFEED_COMMAND_INTERVAL_MS", 100, 600_000) {
        settings.timing.command_interval_ms = v;
    }

    // ── History ─────────────────────────────────────────────────────
    if let Some(v) = vars.string("DICEFEED_HISTORY_BACKEND") {
        match parse_backend(&v) {
            Some(backend) => settings.history.backend = backend,
            None => tracing::warn!(key = "DICEFEED_HISTORY_BACKEND", value = %v, "unknown history backend, ignoring"),
        }
    }
    if let Some(v) = vars.string("DICEFEED_HISTORY_PATH") {
        settings.history.path = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = vars.string("DICEFEED_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = vars.bool("DICEFEED_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_backend(val: &str) -> Option<HistoryBackend> {
    serde_json::from_value(Value::String(val.to_lowercase())).ok()
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

struct EnvReader<'a> {
    env: &'a dyn Fn(&str) -> Option<String>,
}

impl EnvReader<'_> {
    fn string(&self, name: &str) -> Option<String> {
        (self.env)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.env)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = (self.env)(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.env)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }
}
