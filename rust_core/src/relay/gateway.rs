//! Connection gateway
//!
//! Adapts one push-style client connection into registry and broadcaster
//! calls. Each connection moves `Connecting -> Open -> Closed` and never
//! back; broadcast writes are only attempted while it is `Open`.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::broadcaster::FanoutBroadcaster;
use super::registry::SubscriptionRegistry;
use super::transport::{ChannelTransport, TransportHandle, TransportStream};
use crate::error::{RelayError, Result};
use crate::models::{ChannelId, ClientId, ConnectionState};

/// Transport wrapper carrying the connection state machine
pub struct GatewayConnection {
    client: ClientId,
    inner: Arc<dyn TransportHandle>,
    state: Mutex<ConnectionState>,
}

impl GatewayConnection {
    fn new(client: ClientId, inner: Arc<dyn TransportHandle>) -> Self {
        Self {
            client,
            inner,
            state: Mutex::new(ConnectionState::Connecting),
        }
    }

    /// Connecting -> Open. Returns false if the connection already closed.
    fn open(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            ConnectionState::Connecting if self.inner.is_open() => {
                *state = ConnectionState::Open;
                true
            }
            ConnectionState::Open => true,
            _ => {
                *state = ConnectionState::Closed;
                false
            }
        }
    }
}

#[async_trait]
impl TransportHandle for GatewayConnection {
    fn write(&self, payload: String) -> Result<()> {
        if self.state() != ConnectionState::Open {
            return Err(RelayError::DeliveryFailed {
                client: self.client.clone(),
                reason: "connection not open".to_string(),
            });
        }
        self.inner.write(payload)
    }

    fn close(&self) {
        *self.state.lock() = ConnectionState::Closed;
        self.inner.close();
    }

    fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    fn state(&self) -> ConnectionState {
        let mut state = self.state.lock();
        if *state != ConnectionState::Closed && !self.inner.is_open() {
            *state = ConnectionState::Closed;
        }
        *state
    }

    async fn closed(&self) {
        self.inner.closed().await;
        *self.state.lock() = ConnectionState::Closed;
    }
}

/// Result of accepting an in-process connection
#[derive(Debug)]
pub struct Accepted {
    pub client_id: ClientId,
    /// Payloads to forward to the client, in order
    pub stream: TransportStream,
    /// Set when the channel's upstream session could not be started; the
    /// client stays subscribed and is served once a later start succeeds
    pub start_error: Option<RelayError>,
}

/// Result of attaching an external transport
#[derive(Debug)]
pub struct Attached {
    pub client_id: ClientId,
    pub start_error: Option<RelayError>,
}

pub struct ConnectionGateway {
    registry: Arc<SubscriptionRegistry>,
    broadcaster: Arc<FanoutBroadcaster>,
    client_buffer: usize,
}

impl ConnectionGateway {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        broadcaster: Arc<FanoutBroadcaster>,
        client_buffer: usize,
    ) -> Self {
        Self {
            registry,
            broadcaster,
            client_buffer,
        }
    }

    /// Accept a viewer for a channel over an in-process queue transport
    ///
    /// `client_hint` is a caller supplied id (e.g. for reconnect correlation);
    /// it must be well formed and not currently registered.
    pub async fn accept(&self, channel: ChannelId, client_hint: Option<&str>) -> Result<Accepted> {
        let client = self.assign_client_id(client_hint).await?;
        let (transport, stream) = ChannelTransport::new(client.clone(), self.client_buffer);
        let attached = self.connect(channel, client, Arc::new(transport)).await?;
        Ok(Accepted {
            client_id: attached.client_id,
            stream,
            start_error: attached.start_error,
        })
    }

    /// Accept a viewer over any external transport
    pub async fn attach(
        &self,
        channel: ChannelId,
        client_hint: Option<&str>,
        transport: Arc<dyn TransportHandle>,
    ) -> Result<Attached> {
        let client = self.assign_client_id(client_hint).await?;
        self.connect(channel, client, transport).await
    }

    /// Connection ended for any reason. Safe to call more than once.
    pub async fn on_close(&self, client: &ClientId) -> bool {
        self.registry.deregister(client).await
    }

    async fn assign_client_id(&self, hint: Option<&str>) -> Result<ClientId> {
        let client = match hint {
            Some(raw) => ClientId::parse(raw)?,
            None => ClientId::generate(),
        };
        if self.registry.contains(&client).await {
            return Err(RelayError::DuplicateClient(client));
        }
        Ok(client)
    }

    /// Register, open and watch a connection
    ///
    /// Runs on its own task so a caller that gives up halfway (a viewer
    /// hanging up during the first fetch) still leaves the registry and the
    /// session consistent: the connection either ends up watched or is
    /// deregistered again.
    async fn connect(
        &self,
        channel: ChannelId,
        client: ClientId,
        transport: Arc<dyn TransportHandle>,
    ) -> Result<Attached> {
        let connecting = tokio::spawn(establish(
            Arc::clone(&self.registry),
            Arc::clone(&self.broadcaster),
            channel.clone(),
            client.clone(),
            transport,
        ));
        match connecting.await {
            Ok(result) => result,
            Err(e) => {
                warn!(client = %client, channel = %channel, error = %e, "Connection setup task failed");
                self.registry.deregister(&client).await;
                Err(RelayError::DeliveryFailed {
                    client,
                    reason: format!("connection setup failed: {}", e),
                })
            }
        }
    }
}

async fn establish(
    registry: Arc<SubscriptionRegistry>,
    broadcaster: Arc<FanoutBroadcaster>,
    channel: ChannelId,
    client: ClientId,
    transport: Arc<dyn TransportHandle>,
) -> Result<Attached> {
    let connection = Arc::new(GatewayConnection::new(client.clone(), transport));
    let handle: Arc<dyn TransportHandle> = connection.clone();

    let start_error = match registry
        .register(client.clone(), channel.clone(), Arc::clone(&handle))
        .await
    {
        Ok(()) => None,
        Err(e @ RelayError::SessionStartFailed { .. }) => Some(e),
        Err(e) => {
            connection.close();
            return Err(e);
        }
    };

    if !connection.open() {
        debug!(client = %client, channel = %channel, "Connection closed before opening");
        registry.deregister_transport(&client, &handle).await;
        return Ok(Attached {
            client_id: client,
            start_error,
        });
    }

    if let Err(e) = broadcaster.send_snapshot(&client).await {
        warn!(client = %client, channel = %channel, error = %e, "Initial snapshot not queued");
    }

    let watcher = Arc::clone(&registry);
    let watched = client.clone();
    tokio::spawn(async move {
        connection.closed().await;
        if watcher.deregister_transport(&watched, &handle).await {
            debug!(client = %watched, "Connection closed by peer");
        }
    });

    info!(
        client = %client,
        channel = %channel,
        session_started = start_error.is_none(),
        "Client connected"
    );
    Ok(Attached {
        client_id: client,
        start_error,
    })
}
