//! Scoreboard Core - live scoreboard subscription and fan-out.
//!
//! This crate provides:
//! - Subscription registry mapping viewer connections to games
//! - Upstream session manager running one polling task per watched game
//! - Fan-out broadcaster with per-client fault isolation
//! - Connection gateway for push-style transports
//! - HTTP gamesheet feed producer guarded by a circuit breaker

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod models;
pub mod providers;
pub mod relay;

pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use models::{ChannelId, ClientId, ConnectionState, GameSnapshot, SessionStatus, UpdateEnvelope};
pub use relay::RelayHub;
