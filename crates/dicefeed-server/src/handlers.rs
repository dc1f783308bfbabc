//! Route handlers. Every handler reads through [`RoundFeed`]; none of them
//! touch the session directly.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use dicefeed_session::HistoryEntry;
use serde_json::{json, Value};
use tracing::info;

use crate::health::{self, HealthResponse};
use crate::server::AppState;

/// GET /api/rounds/latest
pub async fn latest_round(State(state): State<AppState>) -> Response {
    match state.feed.latest_round() {
        Some(round) => Json(round).into_response(),
        None => Json(json!({ "message": "no data yet" })).into_response(),
    }
}

/// GET /api/rounds/history
pub async fn history(State(state): State<AppState>) -> Json<Vec<HistoryEntry>> {
    Json(state.feed.history())
}

/// POST /api/reconnect
pub async fn reconnect(State(state): State<AppState>) -> Json<Value> {
    info!("reconnect requested over http");
    state.feed.request_reconnect();
    Json(json!({ "message": "reconnecting" }))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let (code, resp) = health::health_check(
        state.start_time,
        state.feed.status(),
        state.metrics.snapshot(),
    );
    (code, Json(resp))
}
