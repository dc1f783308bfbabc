//! `/health` endpoint body.

use std::time::Instant;

use axum::http::StatusCode;
use dicefeed_session::SessionStatus;
use dicefeed_telemetry::MetricsSnapshot;
use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"` when authenticated and answering heartbeats, `"degraded"` otherwise.
    pub status: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    pub session: SessionStatus,
    pub metrics: MetricsSnapshot,
}

/// Build a health response and the status code it should be served with.
pub fn health_check(
    start_time: Instant,
    session: SessionStatus,
    metrics: MetricsSnapshot,
) -> (StatusCode, HealthResponse) {
    let ready = session.is_ready();
    let resp = HealthResponse {
        status: if ready { "ok" } else { "degraded" },
        uptime_secs: start_time.elapsed().as_secs(),
        session,
        metrics,
    };
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicefeed_core::ConnectionState;
    use dicefeed_core::ConnectionStatus;

    fn ready() -> SessionStatus {
        SessionStatus {
            state: ConnectionState::Authenticated,
            connection_status: ConnectionStatus::Connected,
            healthy: true,
            ..SessionStatus::default()
        }
    }

    #[test]
    fn ready_session_is_ok() {
        let (code, resp) = health_check(Instant::now(), ready(), MetricsSnapshot::default());
        assert_eq!(code, StatusCode::OK);
        assert_eq!(resp.status, "ok");
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn disconnected_session_is_unavailable() {
        let (code, resp) = health_check(
            Instant::now(),
            SessionStatus::default(),
            MetricsSnapshot::default(),
        );
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.status, "degraded");
    }

    #[test]
    fn authenticated_but_unhealthy_is_unavailable() {
        let session = SessionStatus {
            healthy: false,
            ..ready()
        };
        let (code, _) = health_check(Instant::now(), session, MetricsSnapshot::default());
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn serialization() {
        let metrics = MetricsSnapshot {
            reconnects_scheduled: 3,
            ..MetricsSnapshot::default()
        };
        let (_, resp) = health_check(Instant::now(), ready(), metrics);
        let parsed = serde_json::to_value(&resp).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["session"]["state"], "authenticated");
        assert_eq!(parsed["session"]["connection_status"], "connected");
        assert_eq!(parsed["metrics"]["reconnects_scheduled"], 3);
        assert!(parsed["uptime_secs"].is_number());
    }
}
