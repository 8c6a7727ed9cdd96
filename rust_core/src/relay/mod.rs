//! Subscription and fan-out core
//!
//! - `registry`: client to channel subscriptions, the single critical section
//! - `session`: one upstream producer task per watched channel
//! - `broadcaster`: per-client non-blocking delivery of updates
//! - `gateway`: connection lifecycle adapter used by the routing layer
//! - `hub`: owns and wires the above

pub mod broadcaster;
pub mod gateway;
pub mod hub;
pub mod registry;
pub mod session;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use broadcaster::{BroadcastReport, FanoutBroadcaster};
pub use gateway::{Accepted, Attached, ConnectionGateway, GatewayConnection};
pub use hub::RelayHub;
pub use registry::SubscriptionRegistry;
pub use session::{SessionManager, SessionTransition};
pub use transport::{ChannelTransport, TransportHandle, TransportStream};
