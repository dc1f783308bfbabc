//! Reconnect delay calculation.
//!
//! The delay grows linearly with the number of consecutive failures and is
//! capped: `min(base + step * attempts, max)`.

use std::time::Duration;

/// Default base delay in milliseconds.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 5_000;
/// Default per-attempt increment in milliseconds.
pub const DEFAULT_BACKOFF_STEP_MS: u64 = 1_000;
/// Default maximum delay in milliseconds.
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
/// Fixed delay before retrying a failed credential fetch.
pub const DEFAULT_CREDENTIAL_RETRY_MS: u64 = 10_000;

/// Capped linear backoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub base_ms: u64,
    pub step_ms: u64,
    pub max_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_ms: DEFAULT_BACKOFF_BASE_MS,
            step_ms: DEFAULT_BACKOFF_STEP_MS,
            max_ms: DEFAULT_BACKOFF_MAX_MS,
        }
    }
}

impl Backoff {
    /// Delay before the next attempt, given the already-incremented
    /// failure count.
    #[must_use]
    pub fn delay(&self, attempts: u32) -> Duration {
        let ms = self
            .step_ms
            .saturating_mul(u64::from(attempts))
            .saturating_add(self.base_ms)
            .min(self.max_ms);
        Duration::from_millis(ms)
    }
}
