pub mod errors;
pub mod protocol;
pub mod retry;
pub mod types;

pub use errors::{FeedError, RetryPolicy};
pub use protocol::{InboundEvent, ProtocolProfile};
pub use retry::Backoff;
pub use types::{
    AuthBundle, ConnectionState, ConnectionStatus, Dice, Outcome, RoundResult, SessionId,
    HISTORY_CAPACITY,
};
