//! Configuration constants and environment loading for the relay core
//!
//! This module manages all runtime configuration:
//! - Upstream polling interval
//! - Session start timeout and stop grace period
//! - Optional linger before tearing down an unwatched session
//! - Per-client delivery buffer

use std::env;
use std::time::Duration;

/// Default polling interval in seconds
pub const DEFAULT_POLL_INTERVAL_SECS: f64 = 5.0;

/// Default time allowed for the first upstream fetch of a new session
pub const DEFAULT_START_TIMEOUT_SECS: f64 = 10.0;

/// Default linger before stopping a session that lost its last subscriber (0 = immediate)
pub const DEFAULT_LINGER_SECS: f64 = 0.0;

/// Default number of queued payloads per client before it is considered too slow
pub const DEFAULT_CLIENT_BUFFER_SIZE: usize = 64;

/// Runtime configuration for sessions and delivery
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Time between upstream polls of a running session
    pub poll_interval: Duration,
    /// Upper bound on the first fetch performed by `start_session`
    pub start_timeout: Duration,
    /// How long `stop_session` waits for the producer task before abandoning it
    pub stop_grace_period: Duration,
    /// Deferred teardown after the last subscriber leaves
    pub linger: Duration,
    /// Capacity of each client's outbound queue
    pub client_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let poll_interval = Duration::from_secs_f64(DEFAULT_POLL_INTERVAL_SECS);
        Self {
            poll_interval,
            start_timeout: Duration::from_secs_f64(DEFAULT_START_TIMEOUT_SECS),
            stop_grace_period: poll_interval,
            linger: Duration::from_secs_f64(DEFAULT_LINGER_SECS),
            client_buffer: DEFAULT_CLIENT_BUFFER_SIZE,
        }
    }
}

fn env_secs(name: &str) -> Option<f64> {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
}

impl RelayConfig {
    /// Load configuration from environment variables with sensible defaults
    pub fn from_env() -> Self {
        let poll_interval_secs = env_secs("POLL_INTERVAL_SECS")
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS)
            .clamp(0.1, 300.0);
        let poll_interval = Duration::from_secs_f64(poll_interval_secs);

        let start_timeout = Duration::from_secs_f64(
            env_secs("SESSION_START_TIMEOUT_SECS")
                .unwrap_or(DEFAULT_START_TIMEOUT_SECS)
                .clamp(0.1, 300.0),
        );

        // One polling interval unless overridden
        let stop_grace_period = env_secs("SESSION_STOP_GRACE_SECS")
            .map(Duration::from_secs_f64)
            .unwrap_or(poll_interval);

        let linger = Duration::from_secs_f64(
            env_secs("SESSION_LINGER_SECS").unwrap_or(DEFAULT_LINGER_SECS),
        );

        let client_buffer = env::var("CLIENT_BUFFER_SIZE")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(DEFAULT_CLIENT_BUFFER_SIZE)
            .max(1);

        Self {
            poll_interval,
            start_timeout,
            stop_grace_period,
            linger,
            client_buffer,
        }
    }
}
