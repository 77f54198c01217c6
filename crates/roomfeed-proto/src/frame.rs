//! Live transport frames.
//!
//! Inbound frames are adjacently tagged CBOR maps:
//!
//! ```text
//! { "type": "message", "payload": { id, room_id, author_id, ... } }
//! { "type": "error",   "payload": "reason" }
//! { "type": "system",  "payload": "Connected to general" }
//! ```
//!
//! Outbound frames carry only `{ body, client_nonce }`. The client never
//! assigns `id` or `sent_at`; those are authoritative only from the server.
//!
//! # Invariants
//!
//! - Size Limit: encoded frames never exceed [`MAX_FRAME_SIZE`]. Oversized
//!   frames are rejected on both encode and decode, before the CBOR parser
//!   sees them.

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    errors::{ProtocolError, Result},
    message::{ClientNonce, Message},
};

/// Maximum encoded frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Server to client frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum InboundFrame {
    /// A confirmed message, possibly the echo of one we sent.
    Message(Message),

    /// Server-side error. Does not close the connection.
    Error(String),

    /// Informational notice (e.g. join banner). Not part of the message log.
    System(String),
}

/// Client to server frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundFrame {
    /// Message text.
    pub body: String,

    /// Idempotency token echoed back on the confirmed message.
    pub client_nonce: ClientNonce,
}

impl InboundFrame {
    /// Encode to CBOR.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::Encode` if serialization fails
    /// - `ProtocolError::FrameTooLarge` if the result exceeds
    ///   [`MAX_FRAME_SIZE`]
    pub fn encode(&self) -> Result<Bytes> {
        encode_cbor(self)
    }

    /// Decode from CBOR.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::EmptyFrame` / `ProtocolError::FrameTooLarge` on size
    ///   violations
    /// - `ProtocolError::Decode` on malformed CBOR or unknown frame type
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode_cbor(bytes)
    }
}

impl OutboundFrame {
    /// Encode to CBOR.
    ///
    /// # Errors
    ///
    /// Same as [`InboundFrame::encode`].
    pub fn encode(&self) -> Result<Bytes> {
        encode_cbor(self)
    }

    /// Decode from CBOR.
    ///
    /// # Errors
    ///
    /// Same as [`InboundFrame::decode`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode_cbor(bytes)
    }
}

fn encode_cbor<T: Serialize>(value: &T) -> Result<Bytes> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| ProtocolError::Encode(e.to_string()))?;

    if buf.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge { size: buf.len(), max: MAX_FRAME_SIZE });
    }

    Ok(Bytes::from(buf))
}

fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if bytes.is_empty() {
        return Err(ProtocolError::EmptyFrame);
    }
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge { size: bytes.len(), max: MAX_FRAME_SIZE });
    }

    ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}
