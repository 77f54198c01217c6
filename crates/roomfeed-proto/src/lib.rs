//! Roomfeed wire protocol
//!
//! Data model shared by every roomfeed layer: the [`Message`] record and its
//! identifiers, plus the frames exchanged with the live transport.
//!
//! # Components
//!
//! - [`Message`]: a chat message as the server (or an optimistic sender) sees
//!   it
//! - [`InboundFrame`]: server to client (`message`, `error`, `system`)
//! - [`OutboundFrame`]: client to server (`body`, `client_nonce`)
//!
//! Frames are CBOR maps. The codec is self-describing so the server can add
//! fields without breaking older clients.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod errors;
pub mod frame;
pub mod message;

pub use errors::{ProtocolError, Result};
pub use frame::{InboundFrame, OutboundFrame};
pub use message::{ClientNonce, Message, MessageId, RoomId, Timestamp};
