//! Scripted producer and helpers for exercising the relay without a feed
//!
//! Built for tests and with the `testing` feature only.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::models::{ChannelId, GameSnapshot};
use crate::providers::{PollOutcome, ProducerHandle, UpstreamProducer};

/// Result of one scripted poll
#[derive(Debug, Clone)]
pub enum Step {
    Update(GameSnapshot),
    NoChange,
    Fail(String),
    /// Sleep, then report an update
    Slow(Duration, GameSnapshot),
    /// Never completes
    Hang,
}

impl Step {
    /// Update step from a JSON object literal
    pub fn update(fields: Value) -> Self {
        match fields {
            Value::Object(map) => Step::Update(map),
            other => panic!("update step needs a JSON object, got {}", other),
        }
    }

    pub fn slow(delay: Duration, fields: Value) -> Self {
        match Step::update(fields) {
            Step::Update(map) => Step::Slow(delay, map),
            _ => unreachable!(),
        }
    }
}

/// Producer that replays a shared script, one step per poll
///
/// Once the script runs out every poll reports no change.
#[derive(Debug, Default)]
pub struct ScriptedProducer {
    script: Mutex<VecDeque<Step>>,
    starts: AtomicUsize,
    polls: AtomicUsize,
    stops: AtomicUsize,
}

impl ScriptedProducer {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into()),
            ..Default::default()
        })
    }

    /// Append steps for later polls
    pub fn push(&self, step: Step) {
        self.script.lock().push_back(step);
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamProducer for ScriptedProducer {
    async fn start(&self, channel: &ChannelId) -> Result<ProducerHandle> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(ProducerHandle::new(channel.clone()))
    }

    async fn poll(&self, _handle: &mut ProducerHandle) -> Result<PollOutcome> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().pop_front().unwrap_or(Step::NoChange);
        match step {
            Step::Update(fields) => Ok(PollOutcome::Update(fields)),
            Step::NoChange => Ok(PollOutcome::NoChange),
            Step::Fail(reason) => Err(anyhow!(reason)),
            Step::Slow(delay, fields) => {
                tokio::time::sleep(delay).await;
                Ok(PollOutcome::Update(fields))
            }
            Step::Hang => std::future::pending().await,
        }
    }

    async fn stop(&self, _handle: ProducerHandle) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Parse a channel id literal
pub fn channel(id: &str) -> ChannelId {
    ChannelId::parse(id).unwrap_or_else(|e| panic!("bad channel id {}: {}", id, e))
}
