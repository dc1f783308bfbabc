//! # dicefeed-server
//!
//! Axum read API over a [`RoundFeed`](dicefeed_session::RoundFeed): latest
//! round, bounded history, manual reconnect and health.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod server;

pub use config::ServerConfig;
pub use error::ServerError;
pub use server::{build_router, start, AppState, ServerHandle};
