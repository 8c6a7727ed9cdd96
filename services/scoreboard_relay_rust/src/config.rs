//! Configuration for the relay HTTP service
//!
//! - Listen address
//! - SSE keep-alive interval
//! - Relay core settings (see `RelayConfig::from_env`)
//! - Gamesheet feed settings (see `GamesheetFeedConfig::from_env`)

use scoreboard_rust_core::providers::GamesheetFeedConfig;
use scoreboard_rust_core::RelayConfig;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

/// Default seconds between SSE keep-alive comments
pub const DEFAULT_SSE_KEEPALIVE_SECS: u64 = 15;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub sse_keepalive: Duration,
    pub relay: RelayConfig,
    pub feed: GamesheetFeedConfig,
}

impl ServiceConfig {
    /// Load configuration from environment variables with sensible defaults
    pub fn from_env() -> anyhow::Result<Self> {
        let raw_addr = env::var("BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = raw_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid BIND_ADDR {:?}: {}", raw_addr, e))?;

        let sse_keepalive = Duration::from_secs(
            env::var("SSE_KEEPALIVE_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(DEFAULT_SSE_KEEPALIVE_SECS)
                .clamp(1, 300),
        );

        Ok(Self {
            bind_addr,
            sse_keepalive,
            relay: RelayConfig::from_env(),
            feed: GamesheetFeedConfig::from_env(),
        })
    }
}
