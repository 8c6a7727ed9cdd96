//! HTTP gamesheet feed producer
//!
//! Polls a JSON endpoint publishing one scoreboard record per game and
//! reports only the fields that changed since the previous poll.

use super::{PollOutcome, ProducerHandle, UpstreamProducer};
use crate::circuit_breaker::{CircuitState, FeedCircuitBreaker, FeedCircuitBreakerConfig};
use crate::models::{changed_fields, ChannelId, GameData};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::env;
use std::time::Duration;

/// Placeholder replaced by the channel id in the feed URL
pub const CHANNEL_PLACEHOLDER: &str = "{channel}";

pub const DEFAULT_FEED_URL_TEMPLATE: &str = "http://localhost:8081/gamesheets/{channel}";

pub const DEFAULT_FEED_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct GamesheetFeedConfig {
    /// URL with a `{channel}` placeholder
    pub url_template: String,
    pub request_timeout: Duration,
    pub circuit_breaker: FeedCircuitBreakerConfig,
}

impl Default for GamesheetFeedConfig {
    fn default() -> Self {
        Self {
            url_template: DEFAULT_FEED_URL_TEMPLATE.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_FEED_TIMEOUT_SECS),
            circuit_breaker: FeedCircuitBreakerConfig::default(),
        }
    }
}

impl GamesheetFeedConfig {
    /// Load feed configuration from environment
    pub fn from_env() -> Self {
        let defaults = FeedCircuitBreakerConfig::default();
        Self {
            url_template: env::var("FEED_URL_TEMPLATE")
                .unwrap_or_else(|_| DEFAULT_FEED_URL_TEMPLATE.to_string()),
            request_timeout: Duration::from_secs(
                env::var("FEED_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_FEED_TIMEOUT_SECS),
            ),
            circuit_breaker: FeedCircuitBreakerConfig {
                failure_threshold: env::var("FEED_CB_FAILURE_THRESHOLD")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.failure_threshold),
                recovery_timeout: Duration::from_secs(
                    env::var("FEED_CB_RECOVERY_TIMEOUT_SECS")
                        .ok()
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(defaults.recovery_timeout.as_secs()),
                ),
                success_threshold: defaults.success_threshold,
            },
        }
    }

    pub fn url_for(&self, channel: &ChannelId) -> String {
        self.url_template
            .replace(CHANNEL_PLACEHOLDER, channel.as_str())
    }
}

/// Feed producer; every channel gets its own circuit breaker so one broken
/// gamesheet cannot fail the healthy ones
pub struct GamesheetFeedProducer {
    client: Client,
    config: GamesheetFeedConfig,
}

impl std::fmt::Debug for GamesheetFeedProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GamesheetFeedProducer")
            .field("url_template", &self.config.url_template)
            .field("request_timeout", &self.config.request_timeout)
            .finish()
    }
}

impl GamesheetFeedProducer {
    pub fn new(config: GamesheetFeedConfig) -> Result<Self> {
        if !config.url_template.contains(CHANNEL_PLACEHOLDER) {
            return Err(anyhow!(
                "feed URL template must contain {}: {}",
                CHANNEL_PLACEHOLDER,
                config.url_template
            ));
        }
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build feed HTTP client")?;
        Ok(Self { client, config })
    }

    /// Breaker state for a channel's handle
    pub fn circuit_state(handle: &ProducerHandle) -> CircuitState {
        handle
            .circuit_breaker
            .as_ref()
            .map(|breaker| breaker.state())
            .unwrap_or(CircuitState::Closed)
    }

    async fn fetch_game(&self, channel: &ChannelId) -> Result<GameData> {
        let url = self.config.url_for(channel);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {}", url))?
            .error_for_status()?;
        let data = resp
            .json::<GameData>()
            .await
            .with_context(|| format!("Malformed gamesheet record from {}", url))?;
        Ok(data)
    }
}

#[async_trait]
impl UpstreamProducer for GamesheetFeedProducer {
    async fn start(&self, channel: &ChannelId) -> Result<ProducerHandle> {
        tracing::debug!(channel = %channel, url = %self.config.url_for(channel), "Starting gamesheet feed");
        let breaker = FeedCircuitBreaker::new(
            &format!("gamesheet_feed:{}", channel),
            self.config.circuit_breaker.clone(),
        );
        Ok(ProducerHandle::new(channel.clone()).with_circuit_breaker(breaker))
    }

    async fn poll(&self, handle: &mut ProducerHandle) -> Result<PollOutcome> {
        let breaker = handle.circuit_breaker.clone();
        if let Some(breaker) = &breaker {
            if !breaker.is_available() {
                return Err(anyhow!(
                    "Gamesheet feed circuit breaker is open (channel={})",
                    handle.channel
                ));
            }
        }

        let result = self.fetch_game(&handle.channel).await;
        if let Some(breaker) = &breaker {
            match &result {
                Ok(_) => breaker.record_success(),
                Err(_) => breaker.record_failure(),
            }
        }

        let current = result?.to_snapshot()?;
        let delta = changed_fields(handle.previous.as_ref(), &current);
        handle.previous = Some(current);

        if delta.is_empty() {
            Ok(PollOutcome::NoChange)
        } else {
            Ok(PollOutcome::Update(delta))
        }
    }

    async fn stop(&self, handle: ProducerHandle) {
        tracing::debug!(
            channel = %handle.channel,
            running_secs = (chrono::Utc::now() - handle.started_at).num_seconds(),
            "Stopped gamesheet feed"
        );
    }

    fn name(&self) -> &str {
        "gamesheet_feed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_for_substitutes_channel() {
        let config = GamesheetFeedConfig {
            url_template: "http://feed.local/division/{channel}/sheet".to_string(),
            ..Default::default()
        };
        let channel = ChannelId::parse("4821-119034").unwrap();
        assert_eq!(
            config.url_for(&channel),
            "http://feed.local/division/4821-119034/sheet"
        );
    }

    #[test]
    fn test_template_without_placeholder_rejected() {
        let config = GamesheetFeedConfig {
            url_template: "http://feed.local/static".to_string(),
            ..Default::default()
        };
        assert!(GamesheetFeedProducer::new(config).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_feed_trips_breaker() {
        let config = GamesheetFeedConfig {
            url_template: "http://127.0.0.1:9/{channel}".to_string(),
            request_timeout: Duration::from_millis(500),
            circuit_breaker: FeedCircuitBreakerConfig {
                failure_threshold: 2,
                recovery_timeout: Duration::from_secs(60),
                success_threshold: 1,
            },
        };
        let producer = GamesheetFeedProducer::new(config).unwrap();
        let channel = ChannelId::parse("G1").unwrap();
        let mut handle = producer.start(&channel).await.unwrap();

        assert!(producer.poll(&mut handle).await.is_err());
        assert!(producer.poll(&mut handle).await.is_err());
        assert_eq!(GamesheetFeedProducer::circuit_state(&handle), CircuitState::Open);

        let err = producer.poll(&mut handle).await.unwrap_err();
        assert!(err.to_string().contains("circuit breaker is open"));
        assert!(handle.previous.is_none());

        // Another channel still reaches the feed
        let mut other = producer.start(&ChannelId::parse("G2").unwrap()).await.unwrap();
        assert_eq!(GamesheetFeedProducer::circuit_state(&other), CircuitState::Closed);
        let err = producer.poll(&mut other).await.unwrap_err();
        assert!(!err.to_string().contains("circuit breaker is open"));

        producer.stop(handle).await;
        producer.stop(other).await;
    }
}
