//! Sans-IO connection state machine.
//!
//! Every input is a [`SessionEvent`] stamped with the current instant; every
//! output is a list of [`Effect`]s the driver executes in order. Timers are
//! plain deadlines exposed through [`SessionMachine::next_deadline`].
//!
//! Credential fetches carry a `ticket` and transports a `generation`. Results
//! tagged with anything but the current value are discarded, so a slow fetch
//! or a late socket can never touch a newer connection attempt.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dicefeed_core::protocol::{self, probe_payload, InboundEvent, ProbeKind};
use dicefeed_core::{
    AuthBundle, Backoff, ConnectionState, ConnectionStatus, Dice, FeedError, ProtocolProfile,
    RetryPolicy, RoundResult, SessionId,
};
use dicefeed_store::HistoryStore;
use dicefeed_telemetry::FeedMetrics;
use secrecy::SecretString;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::liveness::{LivenessAction, LivenessConfig, LivenessMonitor};
use crate::scheduler::CommandScheduler;
use crate::transport::socket_url;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub socket_url: String,
    pub profile: ProtocolProfile,
    pub handshake_timeout: Duration,
    pub credential_retry: Duration,
    pub backoff: Backoff,
    pub liveness: LivenessConfig,
    pub command_interval: Duration,
    /// Exceeding this only logs a warning.
    pub max_reconnect_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            socket_url: "wss://websocket.gmwin.io/websocket".into(),
            profile: ProtocolProfile::default(),
            handshake_timeout: Duration::from_secs(20),
            credential_retry: Duration::from_secs(10),
            backoff: Backoff::default(),
            liveness: LivenessConfig::default(),
            command_interval: Duration::from_secs(3),
            max_reconnect_attempts: 10,
        }
    }
}

/// Inputs to the machine.
#[derive(Debug)]
pub enum SessionEvent {
    /// First connection at process start.
    Start,
    /// Operator asked for a fresh connection now.
    ReconnectRequested,
    CredentialsFetched {
        ticket: u64,
        result: Result<AuthBundle, FeedError>,
    },
    TransportOpened {
        generation: u64,
        result: Result<(), FeedError>,
    },
    FrameReceived {
        generation: u64,
        payload: Vec<u8>,
    },
    PongReceived {
        generation: u64,
    },
    TransportClosed {
        generation: u64,
        reason: String,
    },
    /// The earliest deadline has passed.
    TimerFired,
    Shutdown,
}

/// Outputs of the machine, executed by the driver in order.
#[derive(Debug)]
pub enum Effect {
    FetchCredentials { ticket: u64 },
    /// `url` embeds the socket token.
    OpenTransport { generation: u64, url: SecretString },
    Send(String),
    Ping(Vec<u8>),
    /// Drop the live transport, if any.
    Teardown,
}

/// Snapshot published after every step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub connection_status: ConnectionStatus,
    pub current_session_id: Option<SessionId>,
    pub healthy: bool,
    pub reconnect_attempts: u32,
    pub last_reply_at: Option<DateTime<Utc>>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            connection_status: ConnectionStatus::Disconnected,
            current_session_id: None,
            healthy: false,
            reconnect_attempts: 0,
            last_reply_at: None,
        }
    }
}

impl SessionStatus {
    /// Authenticated and answering heartbeats.
    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Authenticated && self.healthy
    }
}

pub struct SessionMachine {
    config: SessionConfig,
    history: Arc<HistoryStore>,
    metrics: Arc<FeedMetrics>,
    state: ConnectionState,
    attempts: u32,
    current_sid: Option<SessionId>,
    ticket: u64,
    generation: u64,
    /// Held between the credential fetch and the auth frame, then dropped.
    pending_auth: Option<AuthBundle>,
    reconnect_at: Option<Instant>,
    liveness: LivenessMonitor,
    scheduler: CommandScheduler,
    stopped: bool,
}

impl SessionMachine {
    pub fn new(config: SessionConfig, history: Arc<HistoryStore>, metrics: Arc<FeedMetrics>) -> Self {
        let liveness = LivenessMonitor::new(config.liveness);
        let scheduler = CommandScheduler::new(config.command_interval);
        Self {
            config,
            history,
            metrics,
            state: ConnectionState::Disconnected,
            attempts: 0,
            current_sid: None,
            ticket: 0,
            generation: 0,
            pending_auth: None,
            reconnect_at: None,
            liveness,
            scheduler,
            stopped: false,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn current_session_id(&self) -> Option<SessionId> {
        self.current_sid
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Whether a transport of `generation` that just finished opening should
    /// be installed. Anything else must be torn down by the caller.
    pub fn accepts_transport(&self, generation: u64) -> bool {
        !self.stopped
            && self.state == ConnectionState::Connecting
            && generation == self.generation
            && self.pending_auth.is_some()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            connection_status: self.state.status(),
            current_session_id: self.current_sid,
            healthy: self.liveness.is_healthy(),
            reconnect_attempts: self.attempts,
            last_reply_at: self.liveness.last_reply_at(),
        }
    }

    /// Earliest pending timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.stopped {
            return None;
        }
        [
            self.reconnect_at,
            self.liveness.next_deadline(),
            self.scheduler.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn handle(&mut self, event: SessionEvent, now: Instant) -> Vec<Effect> {
        if self.stopped {
            return Vec::new();
        }
        match event {
            SessionEvent::Start => {
                if self.state == ConnectionState::Disconnected && self.reconnect_at.is_none() {
                    self.connect()
                } else {
                    Vec::new()
                }
            }
            SessionEvent::ReconnectRequested => self.manual_reconnect(),
            SessionEvent::CredentialsFetched { ticket, result } => {
                self.on_credentials(ticket, result, now)
            }
            SessionEvent::TransportOpened { generation, result } => {
                self.on_transport_opened(generation, result, now)
            }
            SessionEvent::FrameReceived {
                generation,
                payload,
            } => {
                if self.is_current(generation) {
                    self.on_frame(&payload, now)
                } else {
                    trace!(generation, "frame from stale transport ignored");
                    Vec::new()
                }
            }
            SessionEvent::PongReceived { generation } => {
                if self.is_current(generation) {
                    self.liveness.on_reply();
                    trace!(generation, "liveness reply");
                }
                Vec::new()
            }
            SessionEvent::TransportClosed { generation, reason } => {
                if self.is_current(generation) {
                    self.fail(FeedError::Transport(reason), now)
                } else {
                    debug!(generation, reason, "close of stale transport ignored");
                    Vec::new()
                }
            }
            SessionEvent::TimerFired => self.on_timers(now),
            SessionEvent::Shutdown => self.shutdown(),
        }
    }

    /// Events from the live transport are accepted only once it is installed.
    fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
            && matches!(
                self.state,
                ConnectionState::AwaitingAuth | ConnectionState::Authenticated
            )
    }

    fn connect(&mut self) -> Vec<Effect> {
        self.reconnect_at = None;
        self.ticket += 1;
        self.state = ConnectionState::Connecting;
        info!(ticket = self.ticket, attempt = self.attempts + 1, "connecting");
        vec![Effect::FetchCredentials {
            ticket: self.ticket,
        }]
    }

    fn on_credentials(
        &mut self,
        ticket: u64,
        result: Result<AuthBundle, FeedError>,
        now: Instant,
    ) -> Vec<Effect> {
        if ticket != self.ticket || self.state != ConnectionState::Connecting {
            debug!(ticket, current = self.ticket, "stale credential result discarded");
            return Vec::new();
        }
        let bundle = match result {
            Ok(bundle) => bundle,
            Err(e) => return self.fail(e, now),
        };
        match socket_url(&self.config.socket_url, &bundle.ws_token) {
            Ok(url) => {
                self.generation += 1;
                self.pending_auth = Some(bundle);
                debug!(generation = self.generation, "opening transport");
                vec![Effect::OpenTransport {
                    generation: self.generation,
                    url,
                }]
            }
            Err(e) => self.fail(e, now),
        }
    }

    fn on_transport_opened(
        &mut self,
        generation: u64,
        result: Result<(), FeedError>,
        now: Instant,
    ) -> Vec<Effect> {
        // A manual reconnect drops the pending credentials without moving the
        // generation, so an open still in flight is stale once they are gone.
        if generation != self.generation
            || self.state != ConnectionState::Connecting
            || self.pending_auth.is_none()
        {
            debug!(generation, current = self.generation, "stale transport result discarded");
            return Vec::new();
        }
        if let Err(e) = result {
            return self.fail(e, now);
        }
        let Some(bundle) = self.pending_auth.take() else {
            return Vec::new();
        };
        self.state = ConnectionState::AwaitingAuth;
        let frame = self.config.profile.auth_frame(&bundle);
        drop(bundle);
        info!(generation, "transport open, authenticating");
        vec![Effect::Send(frame)]
    }

    fn on_frame(&mut self, payload: &[u8], now: Instant) -> Vec<Effect> {
        self.metrics.record_frame();
        let event = protocol::decode(payload);
        trace!(kind = event.kind(), "frame decoded");

        match event {
            InboundEvent::AuthAck { success: true } => {
                if self.state == ConnectionState::AwaitingAuth {
                    self.authenticate(now)
                } else {
                    debug!("duplicate auth ack ignored");
                    Vec::new()
                }
            }
            InboundEvent::AuthAck { success: false } => {
                if self.state == ConnectionState::AwaitingAuth {
                    self.fail(FeedError::AuthRejected, now)
                } else {
                    Vec::new()
                }
            }
            InboundEvent::SessionUpdate { sid } => {
                if self.current_sid.map_or(true, |current| sid > current) {
                    self.current_sid = Some(sid);
                    info!(%sid, "session advanced");
                }
                Vec::new()
            }
            InboundEvent::RoundResult { dice, .. } => {
                self.record_round(dice);
                Vec::new()
            }
            InboundEvent::HistoryBatch { entries } => {
                if entries.is_empty() {
                    debug!("empty history batch ignored");
                } else {
                    info!(rounds = entries.len(), "history resynced");
                    self.metrics.record_history_batch();
                    if self.history.replace(entries).is_err() {
                        self.metrics.record_persistence_failure();
                    }
                }
                Vec::new()
            }
            InboundEvent::Unknown => {
                self.metrics.record_dropped_frame();
                debug!(bytes = payload.len(), "unrecognized frame dropped");
                Vec::new()
            }
        }
    }

    /// Recorded under the tracked session id, once per session.
    fn record_round(&mut self, dice: Dice) {
        let Some(sid) = self.current_sid else {
            debug!("round result before any session id ignored");
            return;
        };
        if self.history.latest_sid() == Some(sid) {
            return;
        }
        let round = RoundResult::observed_now(sid, dice);
        let [d1, d2, d3] = dice.faces();
        info!(%sid, d1, d2, d3, sum = round.sum(), outcome = round.outcome().as_str(), "round recorded");
        self.metrics.record_round();
        if self.history.insert(round).is_err() {
            self.metrics.record_persistence_failure();
        }
    }

    fn authenticate(&mut self, now: Instant) -> Vec<Effect> {
        self.state = ConnectionState::Authenticated;
        self.attempts = 0;
        self.liveness.stop();
        self.scheduler.stop();
        self.liveness.start(now);
        self.scheduler.start(now);
        info!(generation = self.generation, "authenticated");
        self.command_effects()
    }

    fn command_effects(&self) -> Vec<Effect> {
        self.config
            .profile
            .command_frames(self.current_sid)
            .into_iter()
            .map(Effect::Send)
            .collect()
    }

    fn on_timers(&mut self, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();

        if self.reconnect_at.is_some_and(|at| at <= now) {
            effects.extend(self.connect());
        }

        if self.state == ConnectionState::Authenticated {
            for action in self.liveness.poll(now) {
                match action {
                    LivenessAction::SendHeartbeat => {
                        debug!("heartbeat sent");
                        effects.push(Effect::Ping(probe_payload(ProbeKind::Heartbeat, Utc::now())));
                    }
                    LivenessAction::SendKeepalive => {
                        debug!("keepalive sent");
                        effects.push(Effect::Ping(probe_payload(ProbeKind::Keepalive, Utc::now())));
                    }
                    LivenessAction::TimedOut => {
                        self.metrics.record_liveness_timeout();
                        let timeout = self.config.liveness.heartbeat_timeout;
                        effects.extend(self.fail(FeedError::LivenessTimeout(timeout), now));
                        return effects;
                    }
                }
            }
            if self.scheduler.poll(now) {
                effects.extend(self.command_effects());
            }
        }
        effects
    }

    /// Leave whatever state we are in and schedule the next attempt.
    fn fail(&mut self, err: FeedError, now: Instant) -> Vec<Effect> {
        let from = self.state;
        let mut effects = Vec::new();

        match err.retry_policy() {
            RetryPolicy::FixedDelay => {
                self.metrics.record_credential_failure();
                self.state = ConnectionState::Disconnected;
                let delay = self.config.credential_retry;
                self.reconnect_at = Some(now + delay);
                warn!(error = %err, delay_ms = millis(delay), "credential fetch failed, retrying");
            }
            RetryPolicy::Backoff | RetryPolicy::NextMutation => {
                self.state = ConnectionState::Closing;
                self.stop_timers();
                effects.push(Effect::Teardown);
                self.state = ConnectionState::Disconnected;

                self.attempts = self.attempts.saturating_add(1);
                let delay = self.config.backoff.delay(self.attempts);
                self.reconnect_at = Some(now + delay);
                self.metrics.record_reconnect_scheduled();
                warn!(
                    from = %from,
                    error = %err,
                    error_kind = err.error_kind(),
                    attempt = self.attempts,
                    delay_ms = millis(delay),
                    "connection lost, reconnect scheduled"
                );
                if self.attempts > self.config.max_reconnect_attempts {
                    warn!(
                        attempt = self.attempts,
                        max = self.config.max_reconnect_attempts,
                        "reconnect attempts above configured maximum, still retrying"
                    );
                }
            }
        }
        effects
    }

    fn manual_reconnect(&mut self) -> Vec<Effect> {
        info!(state = %self.state, "manual reconnect requested");
        self.reconnect_at = None;
        self.attempts = 0;
        let mut effects = Vec::new();
        if self.state != ConnectionState::Disconnected {
            self.state = ConnectionState::Closing;
            self.stop_timers();
            effects.push(Effect::Teardown);
            self.state = ConnectionState::Disconnected;
        }
        effects.extend(self.connect());
        effects
    }

    fn shutdown(&mut self) -> Vec<Effect> {
        info!("session shutting down");
        self.stopped = true;
        self.stop_timers();
        self.reconnect_at = None;
        self.state = ConnectionState::Disconnected;
        self.ticket += 1;
        self.generation += 1;
        vec![Effect::Teardown]
    }

    fn stop_timers(&mut self) {
        self.liveness.stop();
        self.scheduler.stop();
        self.pending_auth = None;
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicefeed_store::MemorySink;
    use serde_json::{json, Value};

    struct Harness {
        machine: SessionMachine,
        history: Arc<HistoryStore>,
        metrics: Arc<FeedMetrics>,
        t0: Instant,
    }

    impl Harness {
        fn new() -> Self {
            let history = Arc::new(HistoryStore::open(Arc::new(MemorySink::new())));
            let metrics = Arc::new(FeedMetrics::new());
            let machine = SessionMachine::new(
                SessionConfig {
                    socket_url: "wss://game.example/websocket".into(),
                    ..SessionConfig::default()
                },
                Arc::clone(&history),
                Arc::clone(&metrics),
            );
            Self {
                machine,
                history,
                metrics,
                t0: Instant::now(),
            }
        }

        fn at(&self, secs: u64) -> Instant {
            self.t0 + Duration::from_secs(secs)
        }

        fn step(&mut self, event: SessionEvent, secs: u64) -> Vec<Effect> {
            let now = self.at(secs);
            self.machine.handle(event, now)
        }

        fn frame(&mut self, generation: u64, value: Value, secs: u64) -> Vec<Effect> {
            self.step(
                SessionEvent::FrameReceived {
                    generation,
                    payload: value.to_string().into_bytes(),
                },
                secs,
            )
        }

        /// Start → credentials → open → ack, all at `secs`. Returns the generation.
        fn authenticate(&mut self, secs: u64) -> u64 {
            let ticket = match self.step(SessionEvent::Start, secs).as_slice() {
                [Effect::FetchCredentials { ticket }] => *ticket,
                other => panic!("expected credential fetch, got {other:?}"),
            };
            self.open_with(ticket, secs)
        }

        fn open_with(&mut self, ticket: u64, secs: u64) -> u64 {
            let effects = self.step(
                SessionEvent::CredentialsFetched {
                    ticket,
                    result: Ok(bundle()),
                },
                secs,
            );
            let generation = match effects.as_slice() {
                [Effect::OpenTransport { generation, .. }] => *generation,
                other => panic!("expected transport open, got {other:?}"),
            };
            assert!(self.machine.accepts_transport(generation));
            let effects = self.step(
                SessionEvent::TransportOpened {
                    generation,
                    result: Ok(()),
                },
                secs,
            );
            assert!(matches!(effects.as_slice(), [Effect::Send(_)]));
            assert_eq!(self.machine.state(), ConnectionState::AwaitingAuth);

            let effects = self.frame(generation, json!([1, true]), secs);
            assert_eq!(effects.len(), 3, "command triplet on entry");
            assert_eq!(self.machine.state(), ConnectionState::Authenticated);
            generation
        }
    }

    fn bundle() -> AuthBundle {
        AuthBundle {
            ws_token: SecretString::from("tok".to_string()),
            identity1: "one".into(),
            identity2: "two".into(),
            info: "{\"wsToken\":\"tok\"}".into(),
            signature: SecretString::from("sig".to_string()),
        }
    }

    fn sent_json(effects: &[Effect]) -> Vec<Value> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send(text) => Some(serde_json::from_str(text).unwrap()),
                _ => None,
            })
            .collect()
    }

    fn round_frame(d: [u8; 3]) -> Value {
        json!([5, {"cmd": 1004, "d1": d[0], "d2": d[1], "d3": d[2]}])
    }

    #[test]
    fn handshake_sends_auth_then_commands() {
        let mut h = Harness::new();
        assert_eq!(h.machine.state(), ConnectionState::Disconnected);

        let effects = h.step(SessionEvent::Start, 0);
        assert!(matches!(effects.as_slice(), [Effect::FetchCredentials { ticket: 1 }]));
        assert_eq!(h.machine.state(), ConnectionState::Connecting);

        let effects = h.step(
            SessionEvent::CredentialsFetched {
                ticket: 1,
                result: Ok(bundle()),
            },
            0,
        );
        let [Effect::OpenTransport { generation: 1, url }] = effects.as_slice() else {
            panic!("expected transport open, got {effects:?}");
        };
        use secrecy::ExposeSecret;
        assert_eq!(url.expose_secret(), "wss://game.example/websocket?token=tok");

        let effects = h.step(
            SessionEvent::TransportOpened {
                generation: 1,
                result: Ok(()),
            },
            0,
        );
        let auth = sent_json(&effects);
        assert_eq!(auth[0][0], 1);
        assert_eq!(auth[0][4]["subi"], true);

        let effects = h.frame(1, json!([1, true, 0]), 0);
        let commands = sent_json(&effects);
        assert_eq!(commands[0][3], json!({"cmd": 1005, "sid": 0}));
        assert_eq!(commands[1][3], json!({"cmd": 10001}));
        assert_eq!(commands[2][3], json!({"cmd": 1003}));
        assert!(h.machine.status().is_ready());
        assert_eq!(h.machine.status().connection_status, ConnectionStatus::Connected);
    }

    #[test]
    fn duplicate_auth_ack_starts_timers_once() {
        let mut h = Harness::new();
        let generation = h.authenticate(0);
        let deadline = h.machine.next_deadline();

        let effects = h.frame(generation, json!([1, true]), 1);
        assert!(effects.is_empty());
        assert_eq!(h.machine.next_deadline(), deadline);

        // One triplet per interval, not two.
        let effects = h.step(SessionEvent::TimerFired, 3);
        assert_eq!(sent_json(&effects).len(), 3);
    }

    #[test]
    fn credential_failure_waits_fixed_delay_without_counting() {
        let mut h = Harness::new();
        let _ = h.step(SessionEvent::Start, 0);
        let effects = h.step(
            SessionEvent::CredentialsFetched {
                ticket: 1,
                result: Err(FeedError::Credential("503".into())),
            },
            0,
        );
        assert!(effects.is_empty());
        assert_eq!(h.machine.state(), ConnectionState::Disconnected);
        assert_eq!(h.machine.attempts(), 0);
        assert_eq!(h.machine.next_deadline(), Some(h.at(10)));
        assert_eq!(h.metrics.snapshot().credential_failures, 1);

        assert!(h.step(SessionEvent::TimerFired, 9).is_empty());
        let effects = h.step(SessionEvent::TimerFired, 10);
        assert!(matches!(effects.as_slice(), [Effect::FetchCredentials { ticket: 2 }]));
    }

    #[test]
    fn close_backs_off_linearly() {
        let mut h = Harness::new();
        let generation = h.authenticate(0);

        let effects = h.step(
            SessionEvent::TransportClosed {
                generation,
                reason: "1006".into(),
            },
            1,
        );
        assert!(matches!(effects.as_slice(), [Effect::Teardown]));
        assert_eq!(h.machine.state(), ConnectionState::Disconnected);
        assert_eq!(h.machine.attempts(), 1);
        assert_eq!(h.machine.next_deadline(), Some(h.at(1 + 6)));
        assert!(!h.machine.status().healthy);

        // Next attempt fails to open: 7 s.
        let effects = h.step(SessionEvent::TimerFired, 7);
        let [Effect::FetchCredentials { ticket }] = effects.as_slice() else {
            panic!("expected credential fetch");
        };
        let ticket = *ticket;
        let _ = h.step(
            SessionEvent::CredentialsFetched {
                ticket,
                result: Ok(bundle()),
            },
            7,
        );
        let generation = h.machine.generation();
        let effects = h.step(
            SessionEvent::TransportOpened {
                generation,
                result: Err(FeedError::HandshakeTimeout(Duration::from_secs(20))),
            },
            27,
        );
        assert!(matches!(effects.as_slice(), [Effect::Teardown]));
        assert_eq!(h.machine.attempts(), 2);
        assert_eq!(h.machine.next_deadline(), Some(h.at(27 + 7)));
        assert_eq!(h.metrics.snapshot().reconnects_scheduled, 2);
    }

    #[test]
    fn successful_auth_resets_attempts() {
        let mut h = Harness::new();
        let generation = h.authenticate(0);
        let _ = h.step(
            SessionEvent::TransportClosed {
                generation,
                reason: "reset".into(),
            },
            0,
        );
        assert_eq!(h.machine.attempts(), 1);

        let effects = h.step(SessionEvent::TimerFired, 6);
        let [Effect::FetchCredentials { ticket }] = effects.as_slice() else {
            panic!("expected credential fetch");
        };
        let ticket = *ticket;
        let _ = h.open_with(ticket, 6);
        assert_eq!(h.machine.attempts(), 0);
    }

    #[test]
    fn rejected_auth_follows_close_path() {
        let mut h = Harness::new();
        let _ = h.step(SessionEvent::Start, 0);
        let _ = h.step(
            SessionEvent::CredentialsFetched {
                ticket: 1,
                result: Ok(bundle()),
            },
            0,
        );
        let _ = h.step(
            SessionEvent::TransportOpened {
                generation: 1,
                result: Ok(()),
            },
            0,
        );
        let effects = h.frame(1, json!([1, false]), 0);
        assert!(matches!(effects.as_slice(), [Effect::Teardown]));
        assert_eq!(h.machine.attempts(), 1);
        assert_eq!(h.machine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn manual_reconnect_cancels_backoff_and_resets_attempts() {
        let mut h = Harness::new();
        let _ = h.step(SessionEvent::Start, 0);
        for n in 0..3u64 {
            let ticket = h.machine.ticket;
            let _ = h.step(
                SessionEvent::CredentialsFetched {
                    ticket,
                    result: Ok(bundle()),
                },
                n * 60,
            );
            let generation = h.machine.generation();
            let _ = h.step(
                SessionEvent::TransportOpened {
                    generation,
                    result: Err(FeedError::Transport("refused".into())),
                },
                n * 60,
            );
            if n < 2 {
                let _ = h.step(SessionEvent::TimerFired, n * 60 + 59);
            }
        }
        assert_eq!(h.machine.attempts(), 3);
        assert_eq!(h.machine.next_deadline(), Some(h.at(120 + 8)));

        let effects = h.step(SessionEvent::ReconnectRequested, 121);
        assert!(matches!(effects.as_slice(), [Effect::FetchCredentials { .. }]));
        assert_eq!(h.machine.attempts(), 0);
        assert_eq!(h.machine.state(), ConnectionState::Connecting);
        assert_eq!(h.machine.next_deadline(), None, "backoff timer cancelled");
    }

    #[test]
    fn manual_reconnect_tears_down_live_transport() {
        let mut h = Harness::new();
        let old = h.authenticate(0);

        let effects = h.step(SessionEvent::ReconnectRequested, 1);
        assert!(matches!(
            effects.as_slice(),
            [Effect::Teardown, Effect::FetchCredentials { .. }]
        ));
        assert_eq!(h.machine.attempts(), 0);

        // Late traffic from the old socket changes nothing.
        let _ = h.frame(old, json!([5, {"cmd": 1008, "sid": 99}]), 1);
        assert_eq!(h.machine.current_session_id(), None);
        let effects = h.step(
            SessionEvent::TransportClosed {
                generation: old,
                reason: "aborted".into(),
            },
            1,
        );
        assert!(effects.is_empty());
        assert_eq!(h.machine.state(), ConnectionState::Connecting);
    }

    #[test]
    fn stale_credentials_and_transports_are_discarded() {
        let mut h = Harness::new();
        let _ = h.step(SessionEvent::Start, 0);
        let _ = h.step(SessionEvent::ReconnectRequested, 0);

        let effects = h.step(
            SessionEvent::CredentialsFetched {
                ticket: 1,
                result: Ok(bundle()),
            },
            0,
        );
        assert!(effects.is_empty(), "ticket 1 was superseded");

        let _ = h.step(
            SessionEvent::CredentialsFetched {
                ticket: 2,
                result: Ok(bundle()),
            },
            0,
        );
        let current = h.machine.generation();
        assert!(!h.machine.accepts_transport(current - 1));
        let effects = h.step(
            SessionEvent::TransportOpened {
                generation: current - 1,
                result: Ok(()),
            },
            0,
        );
        assert!(effects.is_empty());
        assert_eq!(h.machine.state(), ConnectionState::Connecting);
    }

    #[test]
    fn failed_open_after_manual_reconnect_is_ignored() {
        let mut h = Harness::new();
        let _ = h.step(SessionEvent::Start, 0);
        let _ = h.step(
            SessionEvent::CredentialsFetched {
                ticket: 1,
                result: Ok(bundle()),
            },
            0,
        );
        let old = h.machine.generation();

        let effects = h.step(SessionEvent::ReconnectRequested, 1);
        let [Effect::Teardown, Effect::FetchCredentials { ticket }] = effects.as_slice() else {
            panic!("expected teardown then credential fetch, got {effects:?}");
        };
        let ticket = *ticket;

        // The superseded open times out after the reconnect.
        let effects = h.step(
            SessionEvent::TransportOpened {
                generation: old,
                result: Err(FeedError::HandshakeTimeout(Duration::from_secs(20))),
            },
            21,
        );
        assert!(effects.is_empty());
        assert_eq!(h.machine.attempts(), 0);
        assert_eq!(h.machine.state(), ConnectionState::Connecting);
        assert_eq!(h.machine.next_deadline(), None);
        assert_eq!(h.metrics.snapshot().reconnects_scheduled, 0);

        // The fresh credentials still open a new transport.
        let effects = h.step(
            SessionEvent::CredentialsFetched {
                ticket,
                result: Ok(bundle()),
            },
            21,
        );
        let [Effect::OpenTransport { generation, .. }] = effects.as_slice() else {
            panic!("expected transport open, got {effects:?}");
        };
        assert!(*generation > old);
        assert!(h.machine.accepts_transport(*generation));
    }

    #[test]
    fn session_id_only_moves_forward() {
        let mut h = Harness::new();
        let generation = h.authenticate(0);
        let _ = h.frame(generation, json!([5, {"cmd": 1008, "sid": 100}]), 0);
        let _ = h.frame(generation, json!([5, {"cmd": 1008, "sid": 90}]), 0);
        assert_eq!(h.machine.current_session_id(), Some(SessionId::new(100)));
        let _ = h.frame(generation, json!([5, {"cmd": 1008, "sid": 101}]), 0);
        assert_eq!(h.machine.current_session_id(), Some(SessionId::new(101)));

        let effects = h.step(SessionEvent::TimerFired, 3);
        assert_eq!(sent_json(&effects)[0][3]["sid"], 101);
    }

    #[test]
    fn round_result_recorded_once_per_session() {
        let mut h = Harness::new();
        let generation = h.authenticate(0);

        let _ = h.frame(generation, round_frame([6, 6, 6]), 0);
        assert!(h.history.is_empty(), "no session id yet");

        let _ = h.frame(generation, json!([5, {"cmd": 1008, "sid": 42}]), 0);
        let _ = h.frame(generation, round_frame([1, 2, 3]), 0);
        let _ = h.frame(generation, round_frame([4, 5, 6]), 0);
        assert_eq!(h.history.len(), 1);

        let latest = h.history.latest().unwrap();
        assert_eq!(latest.sid(), SessionId::new(42));
        assert_eq!(latest.dice().faces(), [1, 2, 3]);
        assert!(latest.observed_at().is_some());
        assert_eq!(h.metrics.snapshot().rounds_recorded, 1);
    }

    #[test]
    fn history_batch_replaces_store_in_descending_order() {
        let mut h = Harness::new();
        let generation = h.authenticate(0);
        let _ = h.frame(generation, json!([5, {"cmd": 1008, "sid": 500}]), 0);
        let _ = h.frame(generation, round_frame([1, 1, 1]), 0);

        let _ = h.frame(
            generation,
            json!([5, {"cmd": 1005, "htr": [
                {"sid": 5, "d1": 1, "d2": 2, "d3": 3},
                {"sid": 3, "d1": 1, "d2": 2, "d3": 3},
                {"sid": 9, "d1": 1, "d2": 2, "d3": 3},
                {"sid": 1, "d1": 1, "d2": 2, "d3": 3},
            ]}]),
            0,
        );
        let sids: Vec<u64> = h.history.read().iter().map(|r| r.sid().get()).collect();
        assert_eq!(sids, vec![9, 5, 3, 1]);

        let _ = h.frame(generation, json!([5, {"cmd": 1005, "htr": []}]), 0);
        assert_eq!(h.history.len(), 4, "empty batch ignored");
        assert_eq!(h.metrics.snapshot().history_batches, 1);
    }

    #[test]
    fn unknown_frames_are_counted_and_dropped() {
        let mut h = Harness::new();
        let generation = h.authenticate(0);
        let effects = h.step(
            SessionEvent::FrameReceived {
                generation,
                payload: b"garbage".to_vec(),
            },
            0,
        );
        assert!(effects.is_empty());
        let snap = h.metrics.snapshot();
        assert_eq!(snap.frames_dropped, 1);
        assert_eq!(snap.frames_received, 2);
    }

    #[test]
    fn unanswered_heartbeat_forces_reconnect() {
        let mut h = Harness::new();
        let _ = h.authenticate(0);

        let effects = h.step(SessionEvent::TimerFired, 8);
        assert!(effects.iter().any(|e| matches!(e, Effect::Ping(_))));

        let effects = h.step(SessionEvent::TimerFired, 20);
        assert!(matches!(effects.last(), Some(Effect::Teardown)));
        assert_eq!(h.machine.state(), ConnectionState::Disconnected);
        assert_eq!(h.machine.attempts(), 1);
        assert_eq!(h.metrics.snapshot().liveness_timeouts, 1);
        assert_eq!(h.machine.next_deadline(), Some(h.at(26)));
    }

    #[test]
    fn pong_keeps_connection_alive() {
        let mut h = Harness::new();
        let generation = h.authenticate(0);

        let effects = h.step(SessionEvent::TimerFired, 8);
        let ping = effects
            .iter()
            .find_map(|e| match e {
                Effect::Ping(payload) => Some(serde_json::from_slice::<Value>(payload).unwrap()),
                _ => None,
            })
            .unwrap();
        assert_eq!(ping["type"], "heartbeat");

        let _ = h.step(SessionEvent::PongReceived { generation }, 9);
        let _ = h.step(SessionEvent::TimerFired, 20);
        assert_eq!(h.machine.state(), ConnectionState::Authenticated);
        assert!(h.machine.status().last_reply_at.is_some());
    }

    #[test]
    fn retries_past_configured_maximum() {
        let mut h = Harness::new();
        let _ = h.step(SessionEvent::Start, 0);
        let mut now = 0;
        for attempt in 1..=15u32 {
            let ticket = h.machine.ticket;
            let _ = h.step(
                SessionEvent::CredentialsFetched {
                    ticket,
                    result: Ok(bundle()),
                },
                now,
            );
            let generation = h.machine.generation();
            let _ = h.step(
                SessionEvent::TransportOpened {
                    generation,
                    result: Err(FeedError::Transport("refused".into())),
                },
                now,
            );
            assert_eq!(h.machine.attempts(), attempt);
            now += 60;
            let effects = h.step(SessionEvent::TimerFired, now);
            assert!(matches!(effects.as_slice(), [Effect::FetchCredentials { .. }]));
        }
    }

    #[test]
    fn shutdown_stops_everything() {
        let mut h = Harness::new();
        let generation = h.authenticate(0);

        let effects = h.step(SessionEvent::Shutdown, 1);
        assert!(matches!(effects.as_slice(), [Effect::Teardown]));
        assert!(h.machine.is_stopped());
        assert_eq!(h.machine.state(), ConnectionState::Disconnected);
        assert_eq!(h.machine.next_deadline(), None);

        assert!(h.frame(generation, json!([1, true]), 2).is_empty());
        assert!(h.step(SessionEvent::ReconnectRequested, 2).is_empty());
        assert!(h.step(SessionEvent::TimerFired, 100).is_empty());
    }
}
