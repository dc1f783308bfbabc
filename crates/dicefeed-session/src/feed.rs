//! Read-only view of the feed consumed by the HTTP layer.

use chrono::{DateTime, Utc};
use dicefeed_core::{ConnectionStatus, Outcome, RoundResult, SessionId};
use serde::Serialize;

use crate::machine::SessionStatus;

/// Newest round plus the live connection picture.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LatestRound {
    pub sid: SessionId,
    pub d1: u8,
    pub d2: u8,
    pub d3: u8,
    pub sum: u8,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
    pub current_session_id: Option<SessionId>,
    pub connection_status: ConnectionStatus,
    pub healthy: bool,
}

impl LatestRound {
    pub fn new(round: &RoundResult, status: &SessionStatus) -> Self {
        let [d1, d2, d3] = round.dice().faces();
        Self {
            sid: round.sid(),
            d1,
            d2,
            d3,
            sum: round.sum(),
            outcome: round.outcome(),
            observed_at: round.observed_at(),
            current_session_id: status.current_session_id,
            connection_status: status.connection_status,
            healthy: status.healthy,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub sid: SessionId,
    pub sum: u8,
    pub outcome: Outcome,
}

impl From<&RoundResult> for HistoryEntry {
    fn from(round: &RoundResult) -> Self {
        Self {
            sid: round.sid(),
            sum: round.sum(),
            outcome: round.outcome(),
        }
    }
}

/// What the read API needs from the session.
pub trait RoundFeed: Send + Sync {
    /// `None` until the first round is known.
    fn latest_round(&self) -> Option<LatestRound>;

    /// Newest first.
    fn history(&self) -> Vec<HistoryEntry>;

    /// Drop the current connection and connect again immediately.
    fn request_reconnect(&self);

    fn status(&self) -> SessionStatus;
}
