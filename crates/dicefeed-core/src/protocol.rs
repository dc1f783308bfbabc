//! Wire protocol of the upstream game socket.
//!
//! Inbound frames are positional JSON arrays. [`decode`] maps each one to
//! exactly one [`InboundEvent`]; anything that does not match a known shape
//! becomes [`InboundEvent::Unknown`] instead of an error.

use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use serde_json::{json, Map, Value};

use crate::types::{AuthBundle, Dice, RoundResult, SessionId, HISTORY_CAPACITY};

pub const OP_AUTH: u64 = 1;
pub const OP_COMMAND: u64 = 6;

pub const CMD_CURRENT_ROUND: u64 = 1003;
pub const CMD_ROUND_RESULT: u64 = 1004;
pub const CMD_HISTORY: u64 = 1005;
pub const CMD_SESSION_UPDATE: u64 = 1008;
pub const CMD_LOBBY_STATUS: u64 = 10001;

/// Typed view of one inbound frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundEvent {
    AuthAck {
        success: bool,
    },
    SessionUpdate {
        sid: SessionId,
    },
    /// `sid` is whatever the frame carried, if anything. The tracked session
    /// id is what gets recorded.
    RoundResult {
        sid: Option<SessionId>,
        dice: Dice,
    },
    /// Sorted by session id descending and capped at [`HISTORY_CAPACITY`].
    HistoryBatch {
        entries: Vec<RoundResult>,
    },
    Unknown,
}

impl InboundEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthAck { .. } => "auth_ack",
            Self::SessionUpdate { .. } => "session_update",
            Self::RoundResult { .. } => "round_result",
            Self::HistoryBatch { .. } => "history_batch",
            Self::Unknown => "unknown",
        }
    }
}

/// Decode one raw frame. Never fails.
pub fn decode(raw: &[u8]) -> InboundEvent {
    match serde_json::from_slice::<Value>(raw) {
        Ok(value) => decode_value(&value),
        Err(_) => InboundEvent::Unknown,
    }
}

/// Decode an already-parsed frame.
pub fn decode_value(value: &Value) -> InboundEvent {
    let Some(frame) = value.as_array() else {
        return InboundEvent::Unknown;
    };

    if frame.first().and_then(Value::as_u64) == Some(OP_AUTH) {
        if let Some(success) = frame.get(1).and_then(Value::as_bool) {
            return InboundEvent::AuthAck { success };
        }
    }

    let Some(body) = frame.get(1).and_then(Value::as_object) else {
        return InboundEvent::Unknown;
    };

    match body.get("cmd").and_then(Value::as_u64) {
        Some(CMD_SESSION_UPDATE) => match positive_u64(body, "sid") {
            Some(sid) => InboundEvent::SessionUpdate {
                sid: SessionId::new(sid),
            },
            None => InboundEvent::Unknown,
        },
        Some(CMD_CURRENT_ROUND | CMD_ROUND_RESULT) => match dice_of(body) {
            Some(dice) => InboundEvent::RoundResult {
                sid: positive_u64(body, "sid").map(SessionId::new),
                dice,
            },
            None => InboundEvent::Unknown,
        },
        Some(CMD_HISTORY) => match body.get("htr").and_then(Value::as_array) {
            Some(items) => InboundEvent::HistoryBatch {
                entries: history_entries(items),
            },
            None => InboundEvent::Unknown,
        },
        _ => InboundEvent::Unknown,
    }
}

fn positive_u64(body: &Map<String, Value>, key: &str) -> Option<u64> {
    body.get(key).and_then(Value::as_u64).filter(|v| *v > 0)
}

fn face(body: &Map<String, Value>, key: &str) -> Option<u8> {
    body.get(key)
        .and_then(Value::as_u64)
        .and_then(|v| u8::try_from(v).ok())
}

fn dice_of(body: &Map<String, Value>) -> Option<Dice> {
    Dice::new(face(body, "d1")?, face(body, "d2")?, face(body, "d3")?)
}

/// Malformed entries are skipped rather than poisoning the batch.
fn history_entries(items: &[Value]) -> Vec<RoundResult> {
    let mut entries: Vec<RoundResult> = items
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|item| {
            let sid = item.get("sid").and_then(Value::as_u64)?;
            let dice = dice_of(item)?;
            Some(RoundResult::new(SessionId::new(sid), dice, None))
        })
        .collect();
    entries.sort_by(|a, b| b.sid().cmp(&a.sid()));
    entries.truncate(HISTORY_CAPACITY);
    entries
}

/// Names and constants used when building outbound frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtocolProfile {
    pub zone: String,
    pub game_plugin: String,
    pub lobby_plugin: String,
    pub pid: u32,
}

impl Default for ProtocolProfile {
    fn default() -> Self {
        Self {
            zone: "MiniGame".into(),
            game_plugin: "taixiuPlugin".into(),
            lobby_plugin: "lobbyPlugin".into(),
            pid: 5,
        }
    }
}

impl ProtocolProfile {
    /// `[1, zone, identity1, identity2, {info, pid, signature, subi: true}]`
    pub fn auth_frame(&self, bundle: &AuthBundle) -> String {
        json!([
            OP_AUTH,
            self.zone,
            bundle.identity1,
            bundle.identity2,
            {
                "info": bundle.info,
                "pid": self.pid,
                "signature": bundle.signature.expose_secret(),
                "subi": true,
            }
        ])
        .to_string()
    }

    /// The periodic triplet: history request, lobby status, current round.
    pub fn command_frames(&self, current: Option<SessionId>) -> [String; 3] {
        let sid = current.map_or(0, SessionId::get);
        [
            self.command(&self.game_plugin, json!({ "cmd": CMD_HISTORY, "sid": sid })),
            self.command(&self.lobby_plugin, json!({ "cmd": CMD_LOBBY_STATUS })),
            self.command(&self.game_plugin, json!({ "cmd": CMD_CURRENT_ROUND })),
        ]
    }

    fn command(&self, plugin: &str, body: Value) -> String {
        json!([OP_COMMAND, self.zone, plugin, body]).to_string()
    }
}

/// Kind of liveness probe carried in a ping payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProbeKind {
    Heartbeat,
    Keepalive,
}

impl ProbeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::Keepalive => "keepalive",
        }
    }
}

/// Ping payload: `{"type": "heartbeat"|"keepalive", "timestamp": <ms>}`.
pub fn probe_payload(kind: ProbeKind, at: DateTime<Utc>) -> Vec<u8> {
    json!({ "type": kind.as_str(), "timestamp": at.timestamp_millis() })
        .to_string()
        .into_bytes()
}
