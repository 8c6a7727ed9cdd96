//! Upstream producer abstractions
//!
//! A producer turns an external game source into a sequence of state deltas
//! for one channel. The relay core only relies on the tri-state poll
//! contract: an update, no change, or an error.

use crate::circuit_breaker::FeedCircuitBreaker;
use crate::models::{ChannelId, GameSnapshot};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub mod gamesheet;

pub use gamesheet::{GamesheetFeedConfig, GamesheetFeedProducer};

/// Outcome of a single successful poll
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Fields that changed since the previous poll
    Update(GameSnapshot),
    /// Source unchanged
    NoChange,
}

/// Per-channel producer state, owned by the session's polling task
#[derive(Debug, Clone)]
pub struct ProducerHandle {
    pub channel: ChannelId,
    /// Full state seen on the last successful poll (diff baseline)
    pub previous: Option<GameSnapshot>,
    pub started_at: DateTime<Utc>,
    /// Breaker for this channel's source, if the producer uses one
    pub circuit_breaker: Option<Arc<FeedCircuitBreaker>>,
}

impl ProducerHandle {
    pub fn new(channel: ChannelId) -> Self {
        Self {
            channel,
            previous: None,
            started_at: Utc::now(),
            circuit_breaker: None,
        }
    }

    pub fn with_circuit_breaker(mut self, breaker: FeedCircuitBreaker) -> Self {
        self.circuit_breaker = Some(Arc::new(breaker));
        self
    }
}

/// Source of game state for one channel at a time
///
/// Implementations:
/// - Gamesheet feed: JSON scoreboard record fetched over HTTP
/// - Test doubles scripted per poll
#[async_trait]
pub trait UpstreamProducer: Send + Sync {
    /// Prepare polling for a channel
    async fn start(&self, channel: &ChannelId) -> Result<ProducerHandle>;

    /// Fetch the source once and report what changed
    async fn poll(&self, handle: &mut ProducerHandle) -> Result<PollOutcome>;

    /// Release anything held for the channel
    async fn stop(&self, handle: ProducerHandle);

    /// Producer name for logging
    fn name(&self) -> &str;
}
