use std::time::Duration;

/// How the session reacts to a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Retry after a fixed delay without touching the attempt counter.
    FixedDelay,
    /// Count the attempt and retry after the capped backoff delay.
    Backoff,
    /// Nothing to schedule; the next mutation retries implicitly.
    NextMutation,
}

/// Typed error hierarchy for the upstream feed.
/// None of these are fatal; each maps to a [`RetryPolicy`].
#[derive(Clone, Debug, thiserror::Error)]
pub enum FeedError {
    #[error("credential fetch failed: {0}")]
    Credential(String),

    #[error("transport error: {0}")]
    Transport(String),
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("no liveness reply within {0:?}")]
    LivenessTimeout(Duration),
    #[error("authentication rejected by upstream")]
    AuthRejected,

    #[error("history persistence failed: {0}")]
    Persistence(String),
}

impl FeedError {
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::Credential(_) => RetryPolicy::FixedDelay,
            Self::Transport(_)
            | Self::HandshakeTimeout(_)
            | Self::LivenessTimeout(_)
            | Self::AuthRejected => RetryPolicy::Backoff,
            Self::Persistence(_) => RetryPolicy::NextMutation,
        }
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Credential(_) => "credential",
            Self::Transport(_) => "transport",
            Self::HandshakeTimeout(_) => "handshake_timeout",
            Self::LivenessTimeout(_) => "liveness_timeout",
            Self::AuthRejected => "auth_rejected",
            Self::Persistence(_) => "persistence",
        }
    }
}
