//! Roomfeed client runtime
//!
//! Drives the sans-IO state machines of [`roomfeed_core`] on Tokio: one task
//! per subscribed room, collaborators behind traits, listeners for feed and
//! connectivity changes.
//!
//! # Components
//!
//! - [`SyncClient`]: subscribes to rooms
//! - [`RoomHandle`]: per-room listeners, `send`, `unsubscribe`
//! - [`LiveTransport`]: opens the live connection for a room
//! - [`SystemEnv`]: production clock and randomness
//!
//! # Production collaborators (optional)
//!
//! - `websocket` feature: [`websocket::WebSocketTransport`]
//! - `http` feature: [`history_http::HttpHistoryApi`]

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod env;
mod runtime;
pub mod transport;

#[cfg(feature = "http")]
pub mod history_http;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use env::SystemEnv;
pub use roomfeed_core::{
    Author, ChannelConfig, ChannelState, ChannelStatus, DeliveryStatus, DisconnectReason,
    Environment, FailureCause, FeedEntry, FeedSnapshot, HistoryApi, LastError, SyncConfig,
    SyncError,
};
pub use runtime::{ChangeListener, FailureListener, RoomHandle, StatusListener, SyncClient};
pub use transport::{LinkEvent, LiveTransport, TransportError, TransportLink};
