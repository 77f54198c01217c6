//! Live transport abstraction.
//!
//! A transport opens one persistent connection per room and exposes it as a
//! pair of channels. Framing stays in the core: the transport moves opaque
//! encoded frames and reports how the connection ended.

use async_trait::async_trait;
use bytes::Bytes;
use roomfeed_core::DisconnectReason;
use roomfeed_proto::RoomId;
use thiserror::Error;
use tokio::sync::mpsc;

/// Capacity of the per-link frame channels.
pub const LINK_CHANNEL_CAPACITY: usize = 64;

/// Transport errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Connection could not be established.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Server refused the handshake.
    #[error("handshake rejected: {0}")]
    Rejected(String),

    /// Endpoint address is malformed.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Events arriving on an open link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One encoded inbound frame.
    Frame(Bytes),
    /// The connection ended. No further events follow.
    Closed(DisconnectReason),
}

/// An open connection.
///
/// Dropping the link closes the connection.
#[derive(Debug)]
pub struct TransportLink {
    /// Encoded outbound frames.
    pub outbound: mpsc::Sender<Bytes>,
    /// Inbound frames and the close notification.
    pub inbound: mpsc::Receiver<LinkEvent>,
}

impl TransportLink {
    /// Create a link and the transport-side ends of its channels.
    ///
    /// Returns `(link, outbound_rx, inbound_tx)`.
    pub fn channel() -> (Self, mpsc::Receiver<Bytes>, mpsc::Sender<LinkEvent>) {
        let (outbound, outbound_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        let (inbound_tx, inbound) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        (Self { outbound, inbound }, outbound_rx, inbound_tx)
    }
}

/// Connects to the live feed of a room.
#[async_trait]
pub trait LiveTransport: Send + Sync + 'static {
    /// Open a connection for `room_id`. Resolves once the handshake is done.
    async fn connect(&self, room_id: &RoomId) -> Result<TransportLink, TransportError>;
}
