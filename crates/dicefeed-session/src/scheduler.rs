//! Periodic outbound command triplet while authenticated.

use std::time::Duration;

use tokio::time::Instant;

use crate::liveness::advance;

#[derive(Debug)]
pub struct CommandScheduler {
    interval: Duration,
    next_at: Option<Instant>,
}

impl CommandScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_at: None,
        }
    }

    /// Arm the scheduler. The caller sends the first triplet itself, so the
    /// next one is due one interval from `now`.
    pub fn start(&mut self, now: Instant) {
        self.next_at = Some(now + self.interval);
    }

    pub fn stop(&mut self) {
        self.next_at = None;
    }

    pub fn is_running(&self) -> bool {
        self.next_at.is_some()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.next_at
    }

    /// `true` if a triplet is due at `now`.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.next_at {
            Some(at) if at <= now => {
                self.next_at = Some(advance(at, self.interval, now));
                true
            }
            _ => false,
        }
    }
}
