//! Circuit breaker guarding upstream feed requests.
//!
//! Each channel's gamesheet has its own breaker. A gamesheet that keeps
//! failing is not hammered on every poll: after `failure_threshold`
//! consecutive failures the breaker opens and polls fail fast until
//! `recovery_timeout` has passed. The session layer treats a fast failure
//! like any other transient poll error.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// States for the feed circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests are rejected without touching the network
    Open,
    /// Probing whether the feed recovered
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct FeedCircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time spent open before a probe is allowed
    pub recovery_timeout: Duration,
    /// Successful probes needed to close again
    pub success_threshold: u32,
}

impl Default for FeedCircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    circuit: CircuitState,
    consecutive_failures: u32,
    probe_successes: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct FeedCircuitBreaker {
    name: String,
    config: FeedCircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl FeedCircuitBreaker {
    pub fn new(name: &str, config: FeedCircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            state: Mutex::new(BreakerState {
                circuit: CircuitState::Closed,
                consecutive_failures: 0,
                probe_successes: 0,
                opened_at: None,
            }),
        }
    }

    /// Whether a request may be attempted now
    ///
    /// Moves an expired open circuit to half-open.
    pub fn is_available(&self) -> bool {
        let mut state = self.state.lock();
        match state.circuit {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let expired = state
                    .opened_at
                    .map(|t| t.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);
                if expired {
                    state.circuit = CircuitState::HalfOpen;
                    state.probe_successes = 0;
                    tracing::info!(breaker = %self.name, "Feed circuit half-open, probing");
                }
                expired
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        if state.circuit == CircuitState::HalfOpen {
            state.probe_successes += 1;
            if state.probe_successes < self.config.success_threshold {
                return;
            }
            tracing::info!(
                breaker = %self.name,
                probes = state.probe_successes,
                "Feed circuit closed"
            );
        }
        state.circuit = CircuitState::Closed;
        state.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        match state.circuit {
            CircuitState::Closed if state.consecutive_failures >= self.config.failure_threshold => {
                state.circuit = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                tracing::warn!(
                    breaker = %self.name,
                    failures = state.consecutive_failures,
                    "Feed circuit OPENED"
                );
            }
            CircuitState::HalfOpen => {
                state.circuit = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                tracing::warn!(breaker = %self.name, "Feed circuit re-opened during probe");
            }
            _ => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().circuit
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.circuit = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.probe_successes = 0;
        state.opened_at = None;
    }
}
