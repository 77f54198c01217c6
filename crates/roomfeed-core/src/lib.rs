//! Roomfeed synchronization core
//!
//! Sans-IO state machines that keep a room's message log correct and live
//! over an unreliable transport. Nothing here performs I/O or reads the
//! clock; drivers feed events and time in and execute the returned actions.
//!
//! # Components
//!
//! - [`MessageStore`]: ordered, deduplicated log with optimistic entries
//! - [`HistoryLoader`]: one-shot page fetch through a [`HistoryApi`]
//! - [`LiveChannel`]: connection lifecycle, reconnect backoff, send queue
//! - [`RoomSync`]: per-room coordinator composing the three
//! - [`Environment`]: time and randomness, real or simulated

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod backoff;
pub mod channel;
pub mod coordinator;
pub mod env;
pub mod error;
pub mod history;
pub mod store;

pub use backoff::BackoffConfig;
pub use channel::{
    ChannelAction, ChannelConfig, ChannelEvent, ChannelState, ChannelStatus, LastError,
    LiveChannel,
};
pub use coordinator::{Author, RoomSync, SyncAction, SyncConfig};
pub use env::Environment;
pub use error::{DisconnectReason, HistoryError, SyncError};
pub use history::{HistoryApi, HistoryLoader, HistoryRequest};
pub use store::{DeliveryStatus, FailureCause, FeedEntry, FeedSnapshot, InsertOutcome, MessageStore};
