pub mod database;
pub mod error;
pub mod history;
pub mod schema;
pub mod sink;

pub use database::Database;
pub use error::StoreError;
pub use history::HistoryStore;
pub use sink::{HistorySink, JsonFileSink, MemorySink, SqliteSink};
