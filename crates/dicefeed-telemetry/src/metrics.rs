use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// In-memory counter. Monotonically increasing.
#[derive(Default)]
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Lock-free counters describing feed activity since process start.
#[derive(Default)]
pub struct FeedMetrics {
    frames_received: Counter,
    frames_dropped: Counter,
    rounds_recorded: Counter,
    history_batches: Counter,
    reconnects_scheduled: Counter,
    credential_failures: Counter,
    liveness_timeouts: Counter,
    persistence_failures: Counter,
}

/// Point-in-time copy of [`FeedMetrics`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub rounds_recorded: u64,
    pub history_batches: u64,
    pub reconnects_scheduled: u64,
    pub credential_failures: u64,
    pub liveness_timeouts: u64,
    pub persistence_failures: u64,
}

impl FeedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&self) {
        self.frames_received.increment();
    }

    /// A frame that decoded to nothing usable.
    pub fn record_dropped_frame(&self) {
        self.frames_dropped.increment();
    }

    pub fn record_round(&self) {
        self.rounds_recorded.increment();
    }

    pub fn record_history_batch(&self) {
        self.history_batches.increment();
    }

    pub fn record_reconnect_scheduled(&self) {
        self.reconnects_scheduled.increment();
    }

    pub fn record_credential_failure(&self) {
        self.credential_failures.increment();
    }

    pub fn record_liveness_timeout(&self) {
        self.liveness_timeouts.increment();
    }

    pub fn record_persistence_failure(&self) {
        self.persistence_failures.increment();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_received: self.frames_received.get(),
            frames_dropped: self.frames_dropped.get(),
            rounds_recorded: self.rounds_recorded.get(),
            history_batches: self.history_batches.get(),
            reconnects_scheduled: self.reconnects_scheduled.get(),
            credential_failures: self.credential_failures.get(),
            liveness_timeouts: self.liveness_timeouts.get(),
            persistence_failures: self.persistence_failures.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        assert_eq!(FeedMetrics::new().snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn counters_increment_independently() {
        let metrics = FeedMetrics::new();
        metrics.record_frame();
        metrics.record_frame();
        metrics.record_dropped_frame();
        metrics.record_reconnect_scheduled();
        metrics.record_persistence_failure();

        let snap = metrics.snapshot();
        assert_eq!(snap.frames_received, 2);
        assert_eq!(snap.frames_dropped, 1);
        assert_eq!(snap.reconnects_scheduled, 1);
        assert_eq!(snap.persistence_failures, 1);
        assert_eq!(snap.rounds_recorded, 0);
    }

    #[test]
    fn snapshot_serializes_snake_case() {
        let metrics = FeedMetrics::new();
        metrics.record_round();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["rounds_recorded"], 1);
        assert_eq!(json["liveness_timeouts"], 0);
    }
}
