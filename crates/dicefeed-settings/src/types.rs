//! Settings type definitions.
//!
//! JSON field names are camelCase. Every section is `#[serde(default)]`, so a
//! partial file only needs the keys it changes.

use std::path::PathBuf;
use std::time::Duration;

use dicefeed_core::retry::{
    DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_MAX_MS, DEFAULT_BACKOFF_STEP_MS,
    DEFAULT_CREDENTIAL_RETRY_MS,
};
use dicefeed_core::{Backoff, ProtocolProfile};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeedSettings {
    pub server: ServerSettings,
    pub upstream: UpstreamSettings,
    pub timing: TimingSettings,
    pub history: HistorySettings,
    pub logging: LoggingSettings,
}

impl FeedSettings {
    /// Reject combinations the session cannot run with.
    pub fn validate(&self) -> Result<()> {
        let t = &self.timing;
        for (name, value) in [
            ("heartbeatIntervalMs", t.heartbeat_interval_ms),
            ("heartbeatTimeoutMs", t.heartbeat_timeout_ms),
            ("keepaliveIntervalMs", t.keepalive_interval_ms),
            ("commandIntervalMs", t.command_interval_ms),
            ("handshakeTimeoutMs", t.handshake_timeout_ms),
        ] {
            if value == 0 {
                return Err(SettingsError::InvalidValue(format!("timing.{name} must be > 0")));
            }
        }
        if t.backoff_max_ms < t.backoff_base_ms {
            return Err(SettingsError::InvalidValue(
                "timing.backoffMaxMs must be >= timing.backoffBaseMs".into(),
            ));
        }
        if self.upstream.socket_url.is_empty() {
            return Err(SettingsError::InvalidValue("upstream.socketUrl is empty".into()));
        }
        Ok(())
    }
}

/// HTTP read API binding.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 10002,
        }
    }
}

/// Where to fetch credentials and how to talk to the game socket.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamSettings {
    /// JSON document holding the positional credential array. Empty means
    /// unconfigured; every fetch then fails and is retried.
    pub credentials_url: String,
    /// Socket endpoint; the token is appended as the `token` query parameter.
    pub socket_url: String,
    pub zone: String,
    pub game_plugin: String,
    pub lobby_plugin: String,
    pub pid: u32,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        let profile = ProtocolProfile::default();
        Self {
            credentials_url: String::new(),
            socket_url: "wss://websocket.gmwin.io/websocket".to_string(),
            zone: profile.zone,
            game_plugin: profile.game_plugin,
            lobby_plugin: profile.lobby_plugin,
            pid: profile.pid,
        }
    }
}

impl UpstreamSettings {
    pub fn profile(&self) -> ProtocolProfile {
        ProtocolProfile {
            zone: self.zone.clone(),
            game_plugin: self.game_plugin.clone(),
            lobby_plugin: self.lobby_plugin.clone(),
            pid: self.pid,
        }
    }
}

/// Every timer the session runs, in milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimingSettings {
    pub handshake_timeout_ms: u64,
    pub credential_retry_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_step_ms: u64,
    pub backoff_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
    pub command_interval_ms: u64,
    /// Logged when exceeded; retrying continues regardless.
    pub max_reconnect_attempts: u32,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 20_000,
            credential_retry_ms: DEFAULT_CREDENTIAL_RETRY_MS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_step_ms: DEFAULT_BACKOFF_STEP_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            heartbeat_interval_ms: 8_000,
            heartbeat_timeout_ms: 12_000,
            keepalive_interval_ms: 25_000,
            command_interval_ms: 3_000,
            max_reconnect_attempts: 10,
        }
    }
}

impl TimingSettings {
    pub fn backoff(&self) -> Backoff {
        Backoff {
            base_ms: self.backoff_base_ms,
            step_ms: self.backoff_step_ms,
            max_ms: self.backoff_max_ms,
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn credential_retry(&self) -> Duration {
        Duration::from_millis(self.credential_retry_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn command_interval(&self) -> Duration {
        Duration::from_millis(self.command_interval_ms)
    }
}

/// Persistence backend for the round history.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryBackend {
    #[default]
    Json,
    Sqlite,
    /// Nothing survives a restart.
    Memory,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HistorySettings {
    pub backend: HistoryBackend,
    /// File path for the `json` and `sqlite` backends.
    pub path: String,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            backend: HistoryBackend::Json,
            path: dicefeed_dir().join("history.json").display().to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// `~/.dicefeed`, falling back to `/tmp/.dicefeed` without `HOME`.
pub fn dicefeed_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".dicefeed")
}
