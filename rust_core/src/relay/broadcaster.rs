//! Fan-out of channel updates to subscribed clients
//!
//! One broadcast pass writes to every subscriber without waiting on any of
//! them. Clients whose write fails are deregistered once the pass is done,
//! so a dead or slow connection never holds up the others.

use std::sync::Arc;

use tracing::{debug, error, warn};

use super::registry::SubscriptionRegistry;
use super::session::SessionManager;
use super::transport::TransportHandle;
use crate::error::{RelayError, Result};
use crate::models::{ClientId, ConnectionState, UpdateEnvelope};

/// Outcome of one broadcast pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Connections not yet open
    pub skipped: usize,
    /// Failed writes, each followed by deregistration
    pub failed: usize,
}

pub struct FanoutBroadcaster {
    registry: Arc<SubscriptionRegistry>,
    sessions: Arc<SessionManager>,
}

impl FanoutBroadcaster {
    pub fn new(registry: Arc<SubscriptionRegistry>, sessions: Arc<SessionManager>) -> Self {
        Self { registry, sessions }
    }

    /// Deliver an envelope to every current subscriber of its channel
    ///
    /// A snapshot envelope goes to its recipient only, provided it is still
    /// subscribed to the channel.
    pub async fn broadcast(&self, envelope: &UpdateEnvelope) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let channel = &envelope.channel_id;

        if !self.sessions.is_current(channel, envelope.session_epoch) {
            debug!(channel = %channel, epoch = envelope.session_epoch, "Dropping envelope from stopped session");
            return report;
        }

        let payload = match envelope.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                error!(channel = %channel, error = %e, "Failed to serialize envelope");
                return report;
            }
        };

        let subscribers = match &envelope.recipient {
            Some(client) => self
                .registry
                .transport_of(client)
                .await
                .filter(|(subscribed, _)| subscribed == channel)
                .map(|(_, transport)| vec![(client.clone(), transport)])
                .unwrap_or_default(),
            None => self.registry.transports_of(channel).await,
        };
        let mut dead: Vec<(ClientId, Arc<dyn TransportHandle>)> = Vec::new();

        for (client, transport) in subscribers {
            match transport.state() {
                ConnectionState::Connecting => {
                    report.skipped += 1;
                    continue;
                }
                ConnectionState::Closed => {
                    debug!(client = %client, channel = %channel, "Subscriber connection already closed");
                    report.failed += 1;
                    dead.push((client, transport));
                    continue;
                }
                ConnectionState::Open => {}
            }

            match transport.write(payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(client = %client, channel = %channel, error = %e, "Delivery failed, dropping client");
                    report.failed += 1;
                    dead.push((client, transport));
                }
            }
        }

        // Session teardown for emptied channels runs in the background
        for (client, transport) in &dead {
            self.registry.evict(client, transport).await;
        }

        debug!(
            channel = %channel,
            delivered = report.delivered,
            skipped = report.skipped,
            failed = report.failed,
            snapshot = envelope.recipient.is_some(),
            "Broadcast complete"
        );
        report
    }

    /// Queue the channel's current state for one newly registered client
    ///
    /// The snapshot travels the update bus like any other envelope, so the
    /// client sees it in order with the channel's deltas. Returns false when
    /// the session has no state yet.
    pub async fn send_snapshot(&self, client: &ClientId) -> Result<bool> {
        let channel = self
            .registry
            .channel_of(client)
            .await
            .ok_or_else(|| RelayError::UnknownClient(client.clone()))?;

        let queued = self.sessions.queue_snapshot(&channel, client);
        if !queued {
            debug!(client = %client, channel = %channel, "No state to snapshot yet");
        }
        Ok(queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::relay::testing::{channel, ScriptedProducer, Step};
    use crate::relay::transport::{ChannelTransport, TransportStream};
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    struct Fixture {
        registry: Arc<SubscriptionRegistry>,
        sessions: Arc<SessionManager>,
        broadcaster: FanoutBroadcaster,
        updates: mpsc::UnboundedReceiver<UpdateEnvelope>,
    }

    fn fixture(steps: Vec<Step>) -> Fixture {
        let producer = ScriptedProducer::new(steps);
        let (sessions, updates) = SessionManager::new(RelayConfig::default(), producer);
        let registry = Arc::new(SubscriptionRegistry::new(Arc::clone(&sessions)));
        let broadcaster = FanoutBroadcaster::new(Arc::clone(&registry), Arc::clone(&sessions));
        Fixture {
            registry,
            sessions,
            broadcaster,
            updates,
        }
    }

    async fn subscribe(fx: &Fixture, id: &str, chan: &str, buffer: usize) -> TransportStream {
        let (transport, stream) = ChannelTransport::new(ClientId::parse(id).unwrap(), buffer);
        let _ = fx
            .registry
            .register(ClientId::parse(id).unwrap(), channel(chan), Arc::new(transport))
            .await;
        stream
    }

    fn decode(payload: &str) -> Value {
        serde_json::from_str(payload).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_reaches_only_channel_subscribers() {
        let mut fx = fixture(vec![
            Step::update(json!({"homeScore": 0})),
            Step::update(json!({"homeScore": 0})),
        ]);
        let mut a = subscribe(&fx, "a", "G1", 8).await;
        let mut b = subscribe(&fx, "b", "G2", 8).await;

        let g1_first = fx.updates.recv().await.unwrap();
        let _g2_first = fx.updates.recv().await.unwrap();
        assert_eq!(g1_first.channel_id, channel("G1"));

        let report = fx.broadcaster.broadcast(&g1_first).await;
        assert_eq!(report.delivered, 1);

        let got = decode(&a.next_payload().await.unwrap());
        assert_eq!(got["channelId"], json!("G1"));
        assert!(tokio::time::timeout(std::time::Duration::from_millis(10), b.next_payload())
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_isolated_and_deregistered() {
        let mut fx = fixture(vec![Step::update(json!({"homeScore": 1}))]);
        let mut a = subscribe(&fx, "a", "G1", 8).await;
        let b = subscribe(&fx, "b", "G1", 8).await;
        let mut c = subscribe(&fx, "c", "G1", 8).await;
        drop(b);

        let envelope = fx.updates.recv().await.unwrap();
        let report = fx.broadcaster.broadcast(&envelope).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 1);
        assert!(a.next_payload().await.is_some());
        assert!(c.next_payload().await.is_some());
        assert!(!fx.registry.contains(&ClientId::parse("b").unwrap()).await);
        assert_eq!(fx.sessions.reference_count(&channel("G1")), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_client_dropped_when_buffer_full() {
        let mut fx = fixture(vec![Step::update(json!({"homeScore": 1}))]);
        let _slow = subscribe(&fx, "slow", "G1", 1).await;

        let envelope = fx.updates.recv().await.unwrap();
        assert_eq!(fx.broadcaster.broadcast(&envelope).await.delivered, 1);

        let report = fx.broadcaster.broadcast(&envelope).await;
        assert_eq!(report.failed, 1);
        assert_eq!(fx.registry.client_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_epoch_dropped() {
        let mut fx = fixture(vec![Step::update(json!({"homeScore": 1}))]);
        let mut a = subscribe(&fx, "a", "G1", 8).await;
        let mut envelope = fx.updates.recv().await.unwrap();
        envelope.session_epoch += 100;

        let report = fx.broadcaster.broadcast(&envelope).await;
        assert_eq!(report, BroadcastReport::default());
        assert!(tokio::time::timeout(std::time::Duration::from_millis(10), a.next_payload())
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_snapshot_reaches_only_its_client() {
        let mut fx = fixture(vec![Step::update(json!({"homeScore": 3, "period": 2}))]);
        let mut a = subscribe(&fx, "a", "G1", 8).await;
        let mut b = subscribe(&fx, "b", "G1", 8).await;
        let _first = fx.updates.recv().await.unwrap();

        assert!(fx.broadcaster.send_snapshot(&ClientId::parse("a").unwrap()).await.unwrap());
        let snapshot = fx.updates.recv().await.unwrap();
        assert_eq!(fx.broadcaster.broadcast(&snapshot).await.delivered, 1);

        let got = decode(&a.next_payload().await.unwrap());
        assert_eq!(got["changedFields"], json!({"homeScore": 3, "period": 2}));
        assert!(tokio::time::timeout(std::time::Duration::from_millis(10), b.next_payload())
            .await
            .is_err());

        let err = fx
            .broadcaster
            .send_snapshot(&ClientId::parse("ghost").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UnknownClient(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_ordered_with_updates() {
        let mut fx = fixture(vec![
            Step::update(json!({"homeScore": 0})),
            Step::update(json!({"homeScore": 1})),
        ]);
        let mut a = subscribe(&fx, "a", "G1", 8).await;

        // Snapshot requested while the first update is still queued; a new
        // delta is produced before either is dispatched
        assert!(fx.broadcaster.send_snapshot(&ClientId::parse("a").unwrap()).await.unwrap());
        tokio::time::sleep(RelayConfig::default().poll_interval + std::time::Duration::from_secs(1)).await;

        for _ in 0..3 {
            let envelope = fx.updates.recv().await.unwrap();
            fx.broadcaster.broadcast(&envelope).await;
        }

        let scores: Vec<Value> = vec![
            decode(&a.next_payload().await.unwrap())["changedFields"]["homeScore"].clone(),
            decode(&a.next_payload().await.unwrap())["changedFields"]["homeScore"].clone(),
            decode(&a.next_payload().await.unwrap())["changedFields"]["homeScore"].clone(),
        ];
        assert_eq!(scores, vec![json!(0), json!(0), json!(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_dropped_for_departed_client() {
        let mut fx = fixture(vec![Step::update(json!({"homeScore": 3}))]);
        let _a = subscribe(&fx, "a", "G1", 8).await;
        let _b = subscribe(&fx, "b", "G1", 8).await;
        let _first = fx.updates.recv().await.unwrap();

        assert!(fx.broadcaster.send_snapshot(&ClientId::parse("a").unwrap()).await.unwrap());
        fx.registry.deregister(&ClientId::parse("a").unwrap()).await;

        let snapshot = fx.updates.recv().await.unwrap();
        assert_eq!(fx.broadcaster.broadcast(&snapshot).await, BroadcastReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_without_state() {
        let fx = fixture(vec![Step::NoChange]);
        let _a = subscribe(&fx, "a", "G1", 8).await;

        assert!(!fx.broadcaster.send_snapshot(&ClientId::parse("a").unwrap()).await.unwrap());
    }
}
