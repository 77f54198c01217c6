//! Error types for roomfeed synchronization.
//!
//! Nothing in this crate is fatal. Every failure resolves to either a retry
//! (reconnect, gap-fill re-fetch) or a state change the caller can observe:
//!
//! - [`DisconnectReason`]: why a live connection went away. Always recovered
//!   by the reconnect state machine and surfaced only through status.
//! - [`HistoryError`]: the history collaborator failed. Surfaced as
//!   [`SyncError::HistoryUnavailable`]; the room keeps running live-only.
//! - [`SyncError`]: what the caller sees.

use std::fmt;

use roomfeed_proto::{ClientNonce, ProtocolError};
use thiserror::Error;

/// Why a live connection left `Open` or never reached it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// Peer closed the connection.
    RemoteClose,
    /// Transport-level failure (reset, unreachable, I/O error).
    NetworkError,
    /// Peer sent bytes we could not decode.
    ProtocolError,
    /// Handshake did not complete within the configured timeout.
    HandshakeTimeout,
    /// Handshake was refused or failed.
    HandshakeFailed,
}

impl DisconnectReason {
    /// Stable kebab-case name used in logs and status displays.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RemoteClose => "remote-close",
            Self::NetworkError => "network-error",
            Self::ProtocolError => "protocol-error",
            Self::HandshakeTimeout => "handshake-timeout",
            Self::HandshakeFailed => "handshake-failed",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a [`crate::history::HistoryApi`] implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HistoryError {
    /// Transport or server error.
    #[error("history unavailable ({}): {message}", status_label(.status_code))]
    Unavailable {
        /// HTTP-style status code, if the server answered at all
        status_code: Option<u16>,
        /// Human-readable description
        message: String,
    },
}

fn status_label(code: &Option<u16>) -> String {
    code.map_or_else(|| "no status".to_string(), |c| format!("status {c}"))
}

/// Errors surfaced to the caller of a room subscription.
///
/// Connection loss is not an error here: the channel reconnects on its own
/// and reports the cause through `ChannelStatus::last_error`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// History fetch failed. The feed continues live-only.
    #[error("history unavailable ({}): {message}", status_label(.status_code))]
    HistoryUnavailable {
        /// HTTP-style status code, if the server answered at all
        status_code: Option<u16>,
        /// Human-readable description
        message: String,
    },

    /// Outbound queue overflowed and this message was dropped unsent.
    #[error("outbound queue full, dropped message {0}")]
    BackpressureDropped(ClientNonce),

    /// No confirmation arrived before the send deadline.
    #[error("no confirmation for message {0} before deadline")]
    SendTimeout(ClientNonce),

    /// Message body was empty after trimming.
    #[error("message body is empty")]
    EmptyBody,

    /// Outbound frame could not be encoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The room subscription has been torn down.
    #[error("room subscription closed")]
    Closed,
}

impl SyncError {
    /// Returns true if the user can fix this by resending the message.
    pub fn is_resendable(&self) -> bool {
        matches!(self, Self::BackpressureDropped(_) | Self::SendTimeout(_))
    }
}

impl From<HistoryError> for SyncError {
    fn from(err: HistoryError) -> Self {
        match err {
            HistoryError::Unavailable { status_code, message } => {
                Self::HistoryUnavailable { status_code, message }
            },
        }
    }
}
