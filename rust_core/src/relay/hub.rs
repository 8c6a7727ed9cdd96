//! Wiring of the relay components
//!
//! Producer tasks and snapshot requests push envelopes onto the session
//! manager's bus; a single dispatch task drains it into the broadcaster,
//! which keeps successive envelopes in order for every client.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::broadcaster::FanoutBroadcaster;
use super::gateway::ConnectionGateway;
use super::registry::SubscriptionRegistry;
use super::session::SessionManager;
use crate::config::RelayConfig;
use crate::models::UpdateEnvelope;
use crate::providers::UpstreamProducer;

pub struct RelayHub {
    config: RelayConfig,
    sessions: Arc<SessionManager>,
    registry: Arc<SubscriptionRegistry>,
    broadcaster: Arc<FanoutBroadcaster>,
    gateway: Arc<ConnectionGateway>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl RelayHub {
    /// Build the relay and spawn its dispatch task. Must run inside a tokio runtime.
    pub fn start(config: RelayConfig, producer: Arc<dyn UpstreamProducer>) -> Arc<Self> {
        let (sessions, updates) = SessionManager::new(config.clone(), producer);
        let registry = Arc::new(SubscriptionRegistry::new(Arc::clone(&sessions)));
        let broadcaster = Arc::new(FanoutBroadcaster::new(
            Arc::clone(&registry),
            Arc::clone(&sessions),
        ));
        let gateway = Arc::new(ConnectionGateway::new(
            Arc::clone(&registry),
            Arc::clone(&broadcaster),
            config.client_buffer,
        ));

        let dispatcher = tokio::spawn(dispatch(updates, Arc::clone(&broadcaster)));

        info!(
            poll_interval_secs = config.poll_interval.as_secs_f64(),
            linger_secs = config.linger.as_secs_f64(),
            client_buffer = config.client_buffer,
            "Relay hub started"
        );

        Arc::new(Self {
            config,
            sessions,
            registry,
            broadcaster,
            gateway,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<FanoutBroadcaster> {
        &self.broadcaster
    }

    pub fn gateway(&self) -> &Arc<ConnectionGateway> {
        &self.gateway
    }

    /// Disconnect every client and stop every session
    pub async fn shutdown(&self) {
        info!("Relay hub shutting down");
        self.registry.clear().await;
        self.sessions.shutdown().await;
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            dispatcher.abort();
        }
    }
}

async fn dispatch(
    mut updates: mpsc::UnboundedReceiver<UpdateEnvelope>,
    broadcaster: Arc<FanoutBroadcaster>,
) {
    while let Some(envelope) = updates.recv().await {
        broadcaster.broadcast(&envelope).await;
    }
    debug!("Update bus closed, dispatcher exiting");
}
