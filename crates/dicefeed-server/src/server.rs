//! Router construction and the serving task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{get, post};
use axum::Router;
use dicefeed_session::RoundFeed;
use dicefeed_telemetry::FeedMetrics;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::handlers;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub feed: Arc<dyn RoundFeed>,
    pub metrics: Arc<FeedMetrics>,
    /// When the server started.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(feed: Arc<dyn RoundFeed>, metrics: Arc<FeedMetrics>) -> Self {
        Self {
            feed,
            metrics,
            start_time: Instant::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/rounds/latest", get(handlers::latest_round))
        .route("/api/rounds/history", get(handlers::history))
        .route("/api/reconnect", post(handlers::reconnect))
        .route("/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// A running server. Dropping the handle leaves it running; call
/// [`ServerHandle::shutdown`] to stop it.
pub struct ServerHandle {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Address actually bound, useful with port 0.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting, drain in-flight requests and wait for the task.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let abort = self.task.abort_handle();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.task).await.is_err() {
            warn!("http server did not drain in {SHUTDOWN_TIMEOUT:?}, aborting");
            abort.abort();
        } else {
            info!("http server stopped");
        }
    }
}

/// Bind and start serving in a background task.
pub async fn start(
    config: &ServerConfig,
    feed: Arc<dyn RoundFeed>,
    metrics: Arc<FeedMetrics>,
) -> Result<ServerHandle, ServerError> {
    let bind = config.bind_addr();
    let listener = TcpListener::bind(&bind)
        .await
        .map_err(|source| ServerError::Bind {
            addr: bind.clone(),
            source,
        })?;
    let addr = listener.local_addr()?;

    let router = build_router(AppState::new(feed, metrics));
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone().cancelled_owned();

    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(error = %e, "http server failed");
        }
    });
    info!(%addr, "http server listening");

    Ok(ServerHandle { addr, cancel, task })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::TimeZone;
    use dicefeed_core::{ConnectionState, ConnectionStatus, Dice, RoundResult, SessionId};
    use dicefeed_session::{HistoryEntry, LatestRound, SessionStatus};
    use serde_json::Value;
    use tower::ServiceExt;

    #[derive(Default)]
    struct FakeFeed {
        rounds: Vec<RoundResult>,
        status: SessionStatus,
        reconnects: AtomicUsize,
    }

    impl RoundFeed for FakeFeed {
        fn latest_round(&self) -> Option<LatestRound> {
            self.rounds
                .first()
                .map(|round| LatestRound::new(round, &self.status))
        }

        fn history(&self) -> Vec<HistoryEntry> {
            self.rounds.iter().map(HistoryEntry::from).collect()
        }

        fn request_reconnect(&self) {
            let _ = self.reconnects.fetch_add(1, Ordering::SeqCst);
        }

        fn status(&self) -> SessionStatus {
            self.status.clone()
        }
    }

    fn connected() -> SessionStatus {
        SessionStatus {
            state: ConnectionState::Authenticated,
            connection_status: ConnectionStatus::Connected,
            current_session_id: Some(SessionId::new(1001)),
            healthy: true,
            ..SessionStatus::default()
        }
    }

    fn round(sid: u64, d: [u8; 3]) -> RoundResult {
        let at = chrono::Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        RoundResult::new(SessionId::new(sid), Dice::new(d[0], d[1], d[2]).unwrap(), Some(at))
    }

    fn app(feed: Arc<FakeFeed>) -> Router {
        build_router(AppState::new(feed, Arc::new(FeedMetrics::new())))
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 100_000)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn latest_without_data() {
        let (status, body) = call(app(Arc::new(FakeFeed::default())), "GET", "/api/rounds/latest").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({"message": "no data yet"}));
    }

    #[tokio::test]
    async fn latest_round_shape() {
        let feed = Arc::new(FakeFeed {
            rounds: vec![round(1000, [6, 5, 4]), round(999, [1, 1, 2])],
            status: connected(),
            ..FakeFeed::default()
        });
        let (status, body) = call(app(feed), "GET", "/api/rounds/latest").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sid"], 1000);
        assert_eq!(body["d1"], 6);
        assert_eq!(body["d2"], 5);
        assert_eq!(body["d3"], 4);
        assert_eq!(body["sum"], 15);
        assert_eq!(body["outcome"], "High");
        assert_eq!(body["current_session_id"], 1001);
        assert_eq!(body["connection_status"], "connected");
        assert_eq!(body["healthy"], true);
        assert!(body["observed_at"].is_string());
    }

    #[tokio::test]
    async fn history_is_newest_first() {
        let feed = Arc::new(FakeFeed {
            rounds: vec![round(1000, [6, 5, 4]), round(999, [1, 1, 2])],
            status: connected(),
            ..FakeFeed::default()
        });
        let (status, body) = call(app(feed), "GET", "/api/rounds/history").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            serde_json::json!([
                {"sid": 1000, "sum": 15, "outcome": "High"},
                {"sid": 999, "sum": 4, "outcome": "Low"},
            ])
        );
    }

    #[tokio::test]
    async fn empty_history_is_empty_array() {
        let (_, body) = call(app(Arc::new(FakeFeed::default())), "GET", "/api/rounds/history").await;
        assert_eq!(body, serde_json::json!([]));
    }

    #[tokio::test]
    async fn reconnect_forwards_request() {
        let feed = Arc::new(FakeFeed::default());
        let (status, body) = call(app(Arc::clone(&feed)), "POST", "/api/reconnect").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "reconnecting");
        assert_eq!(feed.reconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reconnect_rejects_get() {
        let req = Request::builder()
            .uri("/api/reconnect")
            .body(Body::empty())
            .unwrap();
        let resp = app(Arc::new(FakeFeed::default())).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn health_reflects_session() {
        let feed = Arc::new(FakeFeed {
            status: connected(),
            ..FakeFeed::default()
        });
        let (status, body) = call(app(feed), "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["session"]["current_session_id"], 1001);
        assert_eq!(body["metrics"]["rounds_recorded"], 0);

        let (status, body) = call(app(Arc::new(FakeFeed::default())), "GET", "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["session"]["state"], "disconnected");
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let req = Request::builder()
            .uri("/nonexistent")
            .body(Body::empty())
            .unwrap();
        let resp = app(Arc::new(FakeFeed::default())).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn serves_over_tcp_and_shuts_down() {
        let feed = Arc::new(FakeFeed {
            rounds: vec![round(7, [3, 3, 3])],
            status: connected(),
            ..FakeFeed::default()
        });
        let handle = start(
            &ServerConfig::default(),
            Arc::clone(&feed) as Arc<dyn RoundFeed>,
            Arc::new(FeedMetrics::new()),
        )
        .await
        .unwrap();
        let base = format!("http://{}", handle.addr());
        let client = reqwest::Client::new();

        let resp = client
            .get(format!("{base}/api/rounds/latest"))
            .header("Origin", "http://dashboard.local")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers()
                .get("access-control-allow-origin")
                .and_then(|v| v.to_str().ok()),
            Some("*")
        );
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["sum"], 9);
        assert_eq!(body["outcome"], "Low");

        let resp = client.post(format!("{base}/api/reconnect")).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(feed.reconnects.load(Ordering::SeqCst), 1);

        handle.shutdown().await;
        let after = reqwest::Client::new().get(format!("{base}/health")).send().await;
        assert!(after.is_err());
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let first = start(
            &ServerConfig::default(),
            Arc::new(FakeFeed::default()),
            Arc::new(FeedMetrics::new()),
        )
        .await
        .unwrap();
        let taken = ServerConfig {
            host: "127.0.0.1".into(),
            port: first.addr().port(),
        };
        let err = start(&taken, Arc::new(FakeFeed::default()), Arc::new(FeedMetrics::new()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ServerError::Bind { .. }));
        first.shutdown().await;
    }
}
