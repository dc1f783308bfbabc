//! # dicefeed
//!
//! Dice feed binary: keeps one authenticated session to the game socket and
//! serves the latest round and history over HTTP.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dicefeed_server::ServerConfig;
use dicefeed_session::{
    HttpCredentialProvider, LivenessConfig, RoundFeed, SessionConfig, SessionDeps, SessionManager,
    WsConnector,
};
use dicefeed_settings::{FeedSettings, HistoryBackend};
use dicefeed_store::{HistorySink, HistoryStore, JsonFileSink, MemorySink, SqliteSink};
use dicefeed_telemetry::{init_telemetry, parse_level, TelemetryConfig};
use tracing::{info, warn, Level};

/// Dice feed server.
#[derive(Parser, Debug)]
#[command(name = "dicefeed", about = "Live dice round feed")]
struct Cli {
    /// Settings file (defaults to `~/.dicefeed/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Port to bind (overrides settings; 0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Keep history in memory only.
    #[arg(long)]
    ephemeral: bool,
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn open_sink(settings: &FeedSettings, ephemeral: bool) -> Result<Arc<dyn HistorySink>> {
    let backend = if ephemeral {
        HistoryBackend::Memory
    } else {
        settings.history.backend
    };
    let path = PathBuf::from(&settings.history.path);

    let sink: Arc<dyn HistorySink> = match backend {
        HistoryBackend::Memory => Arc::new(MemorySink::new()),
        HistoryBackend::Json => {
            ensure_parent_dir(&path)?;
            Arc::new(JsonFileSink::new(path))
        }
        HistoryBackend::Sqlite => {
            ensure_parent_dir(&path)?;
            let sink = SqliteSink::open(&path)
                .with_context(|| format!("Failed to open history database: {}", path.display()))?;
            Arc::new(sink)
        }
    };
    Ok(sink)
}

fn session_config(settings: &FeedSettings) -> SessionConfig {
    let timing = &settings.timing;
    SessionConfig {
        socket_url: settings.upstream.socket_url.clone(),
        profile: settings.upstream.profile(),
        handshake_timeout: timing.handshake_timeout(),
        credential_retry: timing.credential_retry(),
        backoff: timing.backoff(),
        liveness: LivenessConfig {
            heartbeat_interval: timing.heartbeat_interval(),
            heartbeat_timeout: timing.heartbeat_timeout(),
            keepalive_interval: timing.keepalive_interval(),
        },
        command_interval: timing.command_interval(),
        max_reconnect_attempts: timing.max_reconnect_attempts,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => dicefeed_settings::load_settings_from_path(path),
        None => dicefeed_settings::load_settings(),
    }
    .context("Failed to load settings")?;

    let log_level = parse_level(&settings.logging.level);
    let telemetry = init_telemetry(TelemetryConfig {
        log_level: log_level.unwrap_or(Level::INFO),
        json: settings.logging.json,
        ..TelemetryConfig::default()
    });
    if log_level.is_none() {
        warn!(level = %settings.logging.level, "unknown log level, using info");
    }
    let metrics = telemetry.metrics();

    let sink = open_sink(&settings, cli.ephemeral)?;
    info!(backend = sink.name(), "history sink ready");
    let history = Arc::new(HistoryStore::open(sink));
    info!(rounds = history.len(), "history loaded");

    if settings.upstream.credentials_url.is_empty() {
        warn!("upstream.credentialsUrl is not set, connection attempts will fail");
    }
    let session = Arc::new(SessionManager::spawn(
        session_config(&settings),
        SessionDeps {
            credentials: Arc::new(HttpCredentialProvider::new(
                settings.upstream.credentials_url.clone(),
            )),
            connector: Arc::new(WsConnector),
            history,
            metrics: Arc::clone(&metrics),
        },
    ));

    let server_config = ServerConfig {
        host: settings.server.host.clone(),
        port: cli.port.unwrap_or(settings.server.port),
    };
    let server = dicefeed_server::start(
        &server_config,
        Arc::clone(&session) as Arc<dyn RoundFeed>,
        metrics,
    )
    .await
    .context("Failed to start http server")?;
    info!(addr = %server.addr(), "dicefeed ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("shutting down");

    server.shutdown().await;
    session.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cli_parses_flags() {
        let cli = Cli::parse_from(["dicefeed", "--port", "0", "--ephemeral"]);
        assert_eq!(cli.port, Some(0));
        assert!(cli.ephemeral);
        assert!(cli.settings.is_none());
    }

    #[test]
    fn session_config_follows_timing() {
        let mut settings = FeedSettings::default();
        settings.timing.heartbeat_interval_ms = 4_000;
        settings.timing.command_interval_ms = 1_500;
        settings.upstream.socket_url = "wss://example.test/ws".into();

        let config = session_config(&settings);
        assert_eq!(config.socket_url, "wss://example.test/ws");
        assert_eq!(config.liveness.heartbeat_interval, Duration::from_secs(4));
        assert_eq!(config.liveness.heartbeat_timeout, Duration::from_secs(12));
        assert_eq!(config.command_interval, Duration::from_millis(1_500));
        assert_eq!(config.backoff.delay(1), Duration::from_secs(6));
    }

    #[test]
    fn ephemeral_forces_memory_sink() {
        let mut settings = FeedSettings::default();
        settings.history.backend = HistoryBackend::Sqlite;
        settings.history.path = "/nonexistent-dir/never/created.db".into();
        let sink = open_sink(&settings, true).unwrap();
        assert_eq!(sink.name(), "memory");
    }
}
