//! Client transport handles
//!
//! The core treats a client connection as an opaque sink. `ChannelTransport`
//! is the in-process realisation: a bounded queue whose receiving half
//! (`TransportStream`) is drained by whatever serves the connection, e.g. an
//! SSE response body.

use async_trait::async_trait;
use futures_util::stream::{self, Stream};
use tokio::sync::{mpsc, watch};

use crate::error::RelayError;
use crate::models::{ClientId, ConnectionState};

/// Push side of one client connection
#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// Queue a payload without waiting. Fails if closed or backed up.
    fn write(&self, payload: String) -> Result<(), RelayError>;

    /// Close the connection. Idempotent.
    fn close(&self);

    fn is_open(&self) -> bool;

    /// Lifecycle state; plain transports are either open or closed
    fn state(&self) -> ConnectionState {
        if self.is_open() {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        }
    }

    /// Resolves once the connection has ended for any reason
    async fn closed(&self);
}

/// Bounded-queue transport for one client
#[derive(Debug)]
pub struct ChannelTransport {
    client: ClientId,
    tx: mpsc::Sender<String>,
    shutdown: watch::Sender<bool>,
}

impl ChannelTransport {
    /// Create a transport and its receiving stream
    pub fn new(client: ClientId, buffer: usize) -> (Self, TransportStream) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        (
            Self {
                client,
                tx,
                shutdown,
            },
            TransportStream {
                rx,
                shutdown: shutdown_rx,
            },
        )
    }

    pub fn client(&self) -> &ClientId {
        &self.client
    }

    fn delivery_failed(&self, reason: &str) -> RelayError {
        RelayError::DeliveryFailed {
            client: self.client.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl TransportHandle for ChannelTransport {
    fn write(&self, payload: String) -> Result<(), RelayError> {
        if *self.shutdown.borrow() {
            return Err(self.delivery_failed("connection closed"));
        }
        self.tx.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => self.delivery_failed("client buffer full"),
            mpsc::error::TrySendError::Closed(_) => self.delivery_failed("receiver dropped"),
        })
    }

    fn close(&self) {
        self.shutdown.send_replace(true);
    }

    fn is_open(&self) -> bool {
        !*self.shutdown.borrow() && !self.tx.is_closed()
    }

    async fn closed(&self) {
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            _ = self.tx.closed() => {}
            _ = shutdown.wait_for(|closed| *closed) => {}
        }
    }
}

/// Receiving half of a `ChannelTransport`
///
/// Yields queued payloads in order; ends once the transport is closed and
/// the queue is drained. Dropping it fires the transport's close hook.
#[derive(Debug)]
pub struct TransportStream {
    rx: mpsc::Receiver<String>,
    shutdown: watch::Receiver<bool>,
}

impl TransportStream {
    pub async fn next_payload(&mut self) -> Option<String> {
        // Drain whatever is already queued before honouring a close
        if let Ok(payload) = self.rx.try_recv() {
            return Some(payload);
        }
        if *self.shutdown.borrow() {
            return None;
        }
        tokio::select! {
            biased;
            payload = self.rx.recv() => payload,
            _ = self.shutdown.wait_for(|closed| *closed) => self.rx.try_recv().ok(),
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = String> + Send {
        stream::unfold(self, |mut transport| async move {
            transport
                .next_payload()
                .await
                .map(|payload| (payload, transport))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::time::Duration;

    fn client() -> ClientId {
        ClientId::parse("c1").unwrap()
    }

    #[tokio::test]
    async fn test_write_preserves_order() {
        let (transport, mut stream) = ChannelTransport::new(client(), 8);

        for i in 0..3 {
            transport.write(format!("msg-{}", i)).unwrap();
        }

        assert_eq!(stream.next_payload().await.as_deref(), Some("msg-0"));
        assert_eq!(stream.next_payload().await.as_deref(), Some("msg-1"));
        assert_eq!(stream.next_payload().await.as_deref(), Some("msg-2"));
    }

    #[tokio::test]
    async fn test_full_buffer_is_delivery_failure() {
        let (transport, _stream) = ChannelTransport::new(client(), 1);

        transport.write("first".into()).unwrap();
        let err = transport.write("second".into()).unwrap_err();
        assert!(matches!(err, RelayError::DeliveryFailed { .. }));
        assert!(transport.is_open());
    }

    #[tokio::test]
    async fn test_close_drains_then_ends_stream() {
        let (transport, stream) = ChannelTransport::new(client(), 8);
        transport.write("last".into()).unwrap();
        transport.close();
        transport.close();

        assert!(!transport.is_open());
        assert!(transport.write("late".into()).is_err());

        let received: Vec<String> = stream.into_stream().collect().await;
        assert_eq!(received, vec!["last".to_string()]);
    }

    #[tokio::test]
    async fn test_closed_hook_fires_when_stream_dropped() {
        let (transport, stream) = ChannelTransport::new(client(), 8);
        drop(stream);

        tokio::time::timeout(Duration::from_secs(1), transport.closed())
            .await
            .expect("close hook should fire");
        assert!(!transport.is_open());
        assert!(matches!(
            transport.write("x".into()),
            Err(RelayError::DeliveryFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_closed_hook_fires_on_close() {
        let (transport, _stream) = ChannelTransport::new(client(), 8);
        transport.close();

        tokio::time::timeout(Duration::from_secs(1), transport.closed())
            .await
            .expect("close hook should fire");
    }
}
