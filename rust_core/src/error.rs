//! Error taxonomy for the relay core
//!
//! Errors local to one client or one poll are contained where they happen;
//! only `SessionStartFailed` is surfaced to the caller that triggered it.

use crate::models::{ChannelId, ClientId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// A client id is already registered (race or programmer error)
    #[error("client {0} is already registered")]
    DuplicateClient(ClientId),

    #[error("client {0} is not registered")]
    UnknownClient(ClientId),

    #[error("invalid client id: {0:?}")]
    InvalidClientId(String),

    #[error("invalid channel id: {0:?}")]
    InvalidChannelId(String),

    /// Upstream producer could not be started for the channel
    #[error("upstream session for {channel} failed to start: {reason}")]
    SessionStartFailed { channel: ChannelId, reason: String },

    /// A write to one client's transport failed
    #[error("delivery to client {client} failed: {reason}")]
    DeliveryFailed { client: ClientId, reason: String },

    /// Transient upstream failure, retried on the next tick
    #[error("upstream poll for {channel} failed: {reason}")]
    UpstreamPollError { channel: ChannelId, reason: String },
}

pub type Result<T> = std::result::Result<T, RelayError>;
