//! Subscription registry: who is watching what
//!
//! The registry owns the client and channel maps and is the only place that
//! mutates them. Every registration and deregistration changes the maps and
//! the session reference count inside one critical section, so the two can
//! never drift. The critical section never suspends; the session start or
//! stop it schedules is awaited after the lock is released, so one slow
//! channel never holds up another.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::session::{SessionManager, SessionTransition};
use super::transport::TransportHandle;
use crate::error::{RelayError, Result};
use crate::models::{ChannelId, ClientId};

struct Subscription {
    channel: ChannelId,
    transport: Arc<dyn TransportHandle>,
}

#[derive(Default)]
struct RegistryState {
    clients: HashMap<ClientId, Subscription>,
    channels: HashMap<ChannelId, HashSet<ClientId>>,
}

impl RegistryState {
    fn subscriber_count(&self, channel: &ChannelId) -> usize {
        self.channels.get(channel).map(HashSet::len).unwrap_or(0)
    }
}

fn same_transport(a: &Arc<dyn TransportHandle>, b: &Arc<dyn TransportHandle>) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}

pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
    sessions: Arc<SessionManager>,
}

impl SubscriptionRegistry {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            sessions,
        }
    }

    /// Subscribe a client to a channel
    ///
    /// The first subscriber of a channel starts its upstream session, and
    /// every subscriber joining while it starts waits for the same start.
    /// `SessionStartFailed` leaves the client registered; the session is
    /// retried on the next registration for the channel.
    pub async fn register(
        &self,
        client: ClientId,
        channel: ChannelId,
        transport: Arc<dyn TransportHandle>,
    ) -> Result<()> {
        let transition = {
            let mut state = self.state.lock().await;
            if state.clients.contains_key(&client) {
                return Err(RelayError::DuplicateClient(client));
            }

            state.clients.insert(
                client.clone(),
                Subscription {
                    channel: channel.clone(),
                    transport,
                },
            );
            state
                .channels
                .entry(channel.clone())
                .or_default()
                .insert(client.clone());
            let live = state.subscriber_count(&channel);

            info!(client = %client, channel = %channel, subscribers = live, "Client registered");
            self.sessions.acquire(&channel, live)
        };
        transition.wait().await
    }

    /// Remove a client and close its transport
    ///
    /// Unknown clients are ignored. Returns whether anything was removed;
    /// a resulting session stop has finished by the time this returns.
    pub async fn deregister(&self, client: &ClientId) -> bool {
        settle(client, self.unbind(client, None).await).await
    }

    /// Remove a client only while it is still bound to `transport`
    ///
    /// Used by close hooks, which must not evict a newer connection that
    /// reused the same client id.
    pub async fn deregister_transport(
        &self,
        client: &ClientId,
        transport: &Arc<dyn TransportHandle>,
    ) -> bool {
        settle(client, self.unbind(client, Some(transport)).await).await
    }

    /// Like `deregister_transport`, but leaves any session stop running in
    /// the background instead of waiting for it
    pub async fn evict(&self, client: &ClientId, transport: &Arc<dyn TransportHandle>) -> bool {
        self.unbind(client, Some(transport)).await.is_some()
    }

    async fn unbind(
        &self,
        client: &ClientId,
        expected: Option<&Arc<dyn TransportHandle>>,
    ) -> Option<SessionTransition> {
        let mut state = self.state.lock().await;
        self.unbind_locked(&mut state, client, expected)
    }

    fn unbind_locked(
        &self,
        state: &mut RegistryState,
        client: &ClientId,
        expected: Option<&Arc<dyn TransportHandle>>,
    ) -> Option<SessionTransition> {
        let bound = match state.clients.get(client) {
            Some(sub) => expected.map_or(true, |t| same_transport(&sub.transport, t)),
            None => false,
        };
        if !bound {
            debug!(client = %client, "Deregister ignored, client not registered");
            return None;
        }
        let sub = state.clients.remove(client)?;

        if let Some(members) = state.channels.get_mut(&sub.channel) {
            members.remove(client);
            if members.is_empty() {
                state.channels.remove(&sub.channel);
            }
        }
        sub.transport.close();
        let live = state.subscriber_count(&sub.channel);

        info!(client = %client, channel = %sub.channel, subscribers = live, "Client deregistered");
        Some(self.sessions.release(&sub.channel, live))
    }

    pub async fn subscribers_of(&self, channel: &ChannelId) -> HashSet<ClientId> {
        self.state
            .lock()
            .await
            .channels
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn channel_of(&self, client: &ClientId) -> Option<ChannelId> {
        self.state
            .lock()
            .await
            .clients
            .get(client)
            .map(|sub| sub.channel.clone())
    }

    /// Transports of every subscriber of a channel, taken at one point in time
    pub async fn transports_of(&self, channel: &ChannelId) -> Vec<(ClientId, Arc<dyn TransportHandle>)> {
        let state = self.state.lock().await;
        state
            .channels
            .get(channel)
            .into_iter()
            .flatten()
            .filter_map(|client| {
                state
                    .clients
                    .get(client)
                    .map(|sub| (client.clone(), Arc::clone(&sub.transport)))
            })
            .collect()
    }

    pub async fn transport_of(&self, client: &ClientId) -> Option<(ChannelId, Arc<dyn TransportHandle>)> {
        self.state
            .lock()
            .await
            .clients
            .get(client)
            .map(|sub| (sub.channel.clone(), Arc::clone(&sub.transport)))
    }

    pub async fn contains(&self, client: &ClientId) -> bool {
        self.state.lock().await.clients.contains_key(client)
    }

    pub async fn client_count(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    /// Watched channels with their subscriber counts
    pub async fn channel_counts(&self) -> Vec<(ChannelId, usize)> {
        let state = self.state.lock().await;
        let mut counts: Vec<_> = state
            .channels
            .iter()
            .map(|(channel, members)| (channel.clone(), members.len()))
            .collect();
        counts.sort();
        counts
    }

    /// Deregister every client and wait for their sessions to stop
    pub async fn clear(&self) {
        let transitions: Vec<(ClientId, SessionTransition)> = {
            let mut state = self.state.lock().await;
            let clients: Vec<ClientId> = state.clients.keys().cloned().collect();
            let mut transitions = Vec::with_capacity(clients.len());
            for client in clients {
                if let Some(transition) = self.unbind_locked(&mut state, &client, None) {
                    transitions.push((client, transition));
                }
            }
            transitions
        };
        join_all(
            transitions
                .into_iter()
                .map(|(client, transition)| async move { settle(&client, Some(transition)).await }),
        )
        .await;
    }
}

/// Wait for the session work a deregistration scheduled
async fn settle(client: &ClientId, transition: Option<SessionTransition>) -> bool {
    let Some(transition) = transition else {
        return false;
    };
    if let Err(e) = transition.wait().await {
        warn!(client = %client, error = %e, "Session restart after deregistration failed");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::models::SessionStatus;
    use crate::relay::testing::{channel, ScriptedProducer, Step};
    use crate::relay::transport::ChannelTransport;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::{self, Instant};

    fn client(id: &str) -> ClientId {
        ClientId::parse(id).unwrap()
    }

    fn transport(id: &str) -> Arc<dyn TransportHandle> {
        let (transport, _stream) = ChannelTransport::new(client(id), 8);
        Arc::new(transport)
    }

    fn registry(steps: Vec<Step>) -> (SubscriptionRegistry, Arc<SessionManager>, Arc<ScriptedProducer>) {
        let producer = ScriptedProducer::new(steps);
        let (sessions, _rx) = SessionManager::new(RelayConfig::default(), producer.clone());
        (SubscriptionRegistry::new(Arc::clone(&sessions)), sessions, producer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_tracks_subscribers_and_sessions() {
        let (registry, sessions, producer) = registry(vec![Step::update(json!({"homeScore": 0}))]);
        let g1 = channel("G1");

        registry.register(client("c1"), g1.clone(), transport("c1")).await.unwrap();
        registry.register(client("c2"), g1.clone(), transport("c2")).await.unwrap();

        assert_eq!(registry.subscribers_of(&g1).await.len(), 2);
        assert_eq!(registry.channel_of(&client("c1")).await, Some(g1.clone()));
        assert_eq!(sessions.reference_count(&g1), 2);
        assert_eq!(sessions.status(&g1), SessionStatus::Running);
        assert_eq!(producer.starts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_client_rejected_without_side_effects() {
        let (registry, sessions, _producer) = registry(vec![]);
        let g1 = channel("G1");
        let g2 = channel("G2");

        registry.register(client("c1"), g1.clone(), transport("c1")).await.unwrap();
        let err = registry
            .register(client("c1"), g2.clone(), transport("c1"))
            .await
            .unwrap_err();

        assert_eq!(err, RelayError::DuplicateClient(client("c1")));
        assert_eq!(registry.channel_of(&client("c1")).await, Some(g1.clone()));
        assert!(registry.subscribers_of(&g2).await.is_empty());
        assert_eq!(sessions.status(&g2), SessionStatus::Idle);
        assert_eq!(sessions.reference_count(&g1), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deregister_is_idempotent() {
        let (registry, sessions, producer) = registry(vec![]);
        let g1 = channel("G1");
        let handle = transport("c1");

        registry.register(client("c1"), g1.clone(), Arc::clone(&handle)).await.unwrap();

        assert!(registry.deregister(&client("c1")).await);
        assert!(!registry.deregister(&client("c1")).await);
        assert!(!registry.deregister(&client("never")).await);

        assert!(!handle.is_open());
        assert_eq!(registry.client_count().await, 0);
        assert_eq!(sessions.status(&g1), SessionStatus::Idle);
        assert_eq!(producer.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deregister_transport_ignores_replaced_connection() {
        let (registry, _sessions, _producer) = registry(vec![]);
        let g1 = channel("G1");
        let old = transport("c1");
        let new = transport("c1");

        registry.register(client("c1"), g1.clone(), Arc::clone(&old)).await.unwrap();
        registry.deregister(&client("c1")).await;
        registry.register(client("c1"), g1.clone(), Arc::clone(&new)).await.unwrap();

        assert!(!registry.deregister_transport(&client("c1"), &old).await);
        assert!(registry.contains(&client("c1")).await);
        assert!(registry.deregister_transport(&client("c1"), &new).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_keeps_client_registered() {
        let (registry, sessions, _producer) = registry(vec![Step::Fail("feed down".into())]);
        let g1 = channel("G1");

        let err = registry
            .register(client("c1"), g1.clone(), transport("c1"))
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::SessionStartFailed { .. }));
        assert!(registry.contains(&client("c1")).await);
        assert_eq!(sessions.reference_count(&g1), 1);
        assert_eq!(sessions.status(&g1), SessionStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_stop_does_not_hold_registry() {
        let (registry, sessions, producer) = registry(vec![Step::NoChange, Step::Hang]);
        let registry = Arc::new(registry);
        let g1 = channel("G1");

        registry.register(client("c1"), g1.clone(), transport("c1")).await.unwrap();
        // Second poll starts at 5s and never returns
        time::sleep(Duration::from_secs(6)).await;
        assert_eq!(producer.polls(), 2);

        let leaving = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.deregister(&client("c1")).await })
        };
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sessions.status(&g1), SessionStatus::Stopping);

        let started = Instant::now();
        registry.register(client("c2"), channel("G2"), transport("c2")).await.unwrap();
        assert!(registry.contains(&client("c2")).await);
        assert!(started.elapsed() < Duration::from_secs(1));

        assert!(leaving.await.unwrap());
        assert_eq!(sessions.status(&g1), SessionStatus::Idle);
        assert_eq!(sessions.status(&channel("G2")), SessionStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_stops_all_sessions() {
        let (registry, sessions, _producer) = registry(vec![]);

        registry.register(client("c1"), channel("G1"), transport("c1")).await.unwrap();
        registry.register(client("c2"), channel("G2"), transport("c2")).await.unwrap();
        assert_eq!(registry.channel_counts().await.len(), 2);

        registry.clear().await;
        assert_eq!(registry.client_count().await, 0);
        assert!(sessions.active_channels().is_empty());
    }
}
