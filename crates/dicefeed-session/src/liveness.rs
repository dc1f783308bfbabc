//! Heartbeat and keepalive probes with a reply deadline.
//!
//! The monitor holds deadlines only; the session driver sleeps until
//! [`LivenessMonitor::next_deadline`] and calls [`LivenessMonitor::poll`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LivenessConfig {
    pub heartbeat_interval: Duration,
    /// How long a heartbeat may go unanswered.
    pub heartbeat_timeout: Duration,
    pub keepalive_interval: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(8),
            heartbeat_timeout: Duration::from_secs(12),
            keepalive_interval: Duration::from_secs(25),
        }
    }
}

/// What the session should do after a [`LivenessMonitor::poll`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LivenessAction {
    SendHeartbeat,
    SendKeepalive,
    /// No reply within the deadline. The monitor has already stopped.
    TimedOut,
}

#[derive(Debug)]
pub struct LivenessMonitor {
    config: LivenessConfig,
    next_heartbeat: Option<Instant>,
    next_keepalive: Option<Instant>,
    reply_deadline: Option<Instant>,
    last_reply_at: Option<DateTime<Utc>>,
    healthy: bool,
}

impl LivenessMonitor {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            config,
            next_heartbeat: None,
            next_keepalive: None,
            reply_deadline: None,
            last_reply_at: None,
            healthy: false,
        }
    }

    /// Reset and arm both probes. The first of each fires one interval from `now`.
    pub fn start(&mut self, now: Instant) {
        self.next_heartbeat = Some(now + self.config.heartbeat_interval);
        self.next_keepalive = Some(now + self.config.keepalive_interval);
        self.reply_deadline = None;
        self.healthy = true;
    }

    /// Disarm everything and mark unhealthy.
    pub fn stop(&mut self) {
        self.next_heartbeat = None;
        self.next_keepalive = None;
        self.reply_deadline = None;
        self.healthy = false;
    }

    pub fn is_running(&self) -> bool {
        self.next_heartbeat.is_some()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn last_reply_at(&self) -> Option<DateTime<Utc>> {
        self.last_reply_at
    }

    pub fn reply_deadline(&self) -> Option<Instant> {
        self.reply_deadline
    }

    /// Any liveness reply clears the pending deadline.
    pub fn on_reply(&mut self) {
        self.last_reply_at = Some(Utc::now());
        if self.is_running() {
            self.healthy = true;
            self.reply_deadline = None;
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        [self.next_heartbeat, self.next_keepalive, self.reply_deadline]
            .into_iter()
            .flatten()
            .min()
    }

    /// Fire everything due at `now`.
    pub fn poll(&mut self, now: Instant) -> Vec<LivenessAction> {
        if self.reply_deadline.is_some_and(|d| d <= now) {
            self.stop();
            return vec![LivenessAction::TimedOut];
        }

        let mut actions = Vec::new();
        if let Some(at) = self.next_heartbeat.filter(|at| *at <= now) {
            self.next_heartbeat = Some(advance(at, self.config.heartbeat_interval, now));
            // A pending deadline is never pushed back.
            if self.reply_deadline.is_none() {
                self.reply_deadline = Some(now + self.config.heartbeat_timeout);
            }
            actions.push(LivenessAction::SendHeartbeat);
        }
        if let Some(at) = self.next_keepalive.filter(|at| *at <= now) {
            self.next_keepalive = Some(advance(at, self.config.keepalive_interval, now));
            actions.push(LivenessAction::SendKeepalive);
        }
        actions
    }
}

/// Next tick after `now` on the `at + k * period` grid.
pub(crate) fn advance(at: Instant, period: Duration, now: Instant) -> Instant {
    let mut next = at + period;
    if next <= now {
        let behind = now.duration_since(at).as_nanos() / period.as_nanos().max(1);
        next = at + period * u32::try_from(behind + 1).unwrap_or(u32::MAX);
    }
    next
}
