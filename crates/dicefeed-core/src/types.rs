use std::fmt;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Maximum number of rounds retained in history.
pub const HISTORY_CAPACITY: usize = 100;

/// Dice sums at or above this value are `High`.
pub const HIGH_THRESHOLD: u8 = 11;

/// Server-assigned identifier grouping rounds. Ordered by value.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for SessionId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Round classification by dice sum.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    High,
    Low,
}

impl Outcome {
    pub fn from_sum(sum: u8) -> Self {
        if sum >= HIGH_THRESHOLD {
            Self::High
        } else {
            Self::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "High",
            Self::Low => "Low",
        }
    }
}

/// Three die faces, each guaranteed to be within 1..=6.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Dice([u8; 3]);

impl Dice {
    /// Returns `None` if any face is outside 1..=6.
    pub fn new(d1: u8, d2: u8, d3: u8) -> Option<Self> {
        let faces = [d1, d2, d3];
        faces
            .iter()
            .all(|d| (1..=6).contains(d))
            .then_some(Self(faces))
    }

    pub fn faces(&self) -> [u8; 3] {
        self.0
    }

    pub fn sum(&self) -> u8 {
        self.0.iter().sum()
    }

    pub fn outcome(&self) -> Outcome {
        Outcome::from_sum(self.sum())
    }
}

/// Persisted/wire shape of a round: `{sid, d1, d2, d3, timestamp}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub sid: u64,
    pub d1: u8,
    pub d2: u8,
    pub d3: u8,
    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
#[error("die faces out of range: {0}, {1}, {2}")]
pub struct InvalidDice(pub u8, pub u8, pub u8);

/// One observed round. Immutable once created.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RoundRecord", into = "RoundRecord")]
pub struct RoundResult {
    sid: SessionId,
    dice: Dice,
    observed_at: Option<DateTime<Utc>>,
}

impl RoundResult {
    pub fn new(sid: SessionId, dice: Dice, observed_at: Option<DateTime<Utc>>) -> Self {
        Self {
            sid,
            dice,
            observed_at,
        }
    }

    /// A round observed live, stamped with the current time.
    pub fn observed_now(sid: SessionId, dice: Dice) -> Self {
        Self::new(sid, dice, Some(Utc::now()))
    }

    pub fn sid(&self) -> SessionId {
        self.sid
    }

    pub fn dice(&self) -> Dice {
        self.dice
    }

    pub fn observed_at(&self) -> Option<DateTime<Utc>> {
        self.observed_at
    }

    pub fn sum(&self) -> u8 {
        self.dice.sum()
    }

    pub fn outcome(&self) -> Outcome {
        self.dice.outcome()
    }
}

impl TryFrom<RoundRecord> for RoundResult {
    type Error = InvalidDice;

    fn try_from(record: RoundRecord) -> Result<Self, Self::Error> {
        let dice = Dice::new(record.d1, record.d2, record.d3)
            .ok_or(InvalidDice(record.d1, record.d2, record.d3))?;
        let observed_at = record.timestamp.and_then(DateTime::<Utc>::from_timestamp_millis);
        Ok(Self::new(SessionId::new(record.sid), dice, observed_at))
    }
}

impl From<RoundResult> for RoundRecord {
    fn from(round: RoundResult) -> Self {
        let [d1, d2, d3] = round.dice.faces();
        Self {
            sid: round.sid.get(),
            d1,
            d2,
            d3,
            timestamp: round.observed_at.map(|t| t.timestamp_millis()),
        }
    }
}

/// Lifecycle state of the upstream connection.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    AwaitingAuth,
    Authenticated,
    Closing,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::AwaitingAuth => "awaiting_auth",
            Self::Authenticated => "authenticated",
            Self::Closing => "closing",
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        match self {
            Self::Authenticated => ConnectionStatus::Connected,
            _ => ConnectionStatus::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse status reported to API consumers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// Authentication material for one connection attempt.
///
/// Dropped as soon as the auth frame has been sent.
#[derive(Debug)]
pub struct AuthBundle {
    pub ws_token: SecretString,
    pub identity1: String,
    pub identity2: String,
    /// Raw `info` JSON string, forwarded verbatim in the auth frame.
    pub info: String,
    pub signature: SecretString,
}
