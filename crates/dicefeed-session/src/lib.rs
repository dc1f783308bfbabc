//! # dicefeed-session
//!
//! One long-lived, authenticated connection to the game socket. All
//! connection state lives in a sans-IO [`SessionMachine`]; the
//! [`SessionManager`] owns the tokio task that feeds it events and executes
//! the [`Effect`]s it returns.

#![deny(unsafe_code)]

pub mod credentials;
pub mod feed;
pub mod liveness;
pub mod machine;
pub mod manager;
pub mod scheduler;
pub mod transport;

pub use credentials::{CredentialProvider, HttpCredentialProvider};
pub use feed::{HistoryEntry, LatestRound, RoundFeed};
pub use liveness::{LivenessConfig, LivenessMonitor};
pub use machine::{Effect, SessionConfig, SessionEvent, SessionMachine, SessionStatus};
pub use manager::{SessionDeps, SessionManager};
pub use scheduler::CommandScheduler;
pub use transport::{Connector, EventSink, Outbound, TransportHandle, WsConnector};
