//! Message record and identifier types.
//!
//! A [`Message`] is either confirmed (carries a server-assigned [`MessageId`]
//! and [`Timestamp`]) or optimistic (no `id` yet, created locally when the user
//! hits send). The [`ClientNonce`] links the two: the client attaches it to the
//! outbound frame and the server echoes it back on the confirmed copy.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;

/// Server-assigned message identifier. Unique within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server timestamp in milliseconds since the Unix epoch.
///
/// Monotonic per room as far as ordering is concerned; collisions are broken
/// by [`MessageId`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Milliseconds since the Unix epoch.
    #[must_use]
    pub fn as_millis(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Room slug, e.g. `general`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    /// Create a room id from a slug.
    pub fn new(slug: impl Into<String>) -> Self {
        Self(slug.into())
    }

    /// Room slug.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(slug: &str) -> Self {
        Self::new(slug)
    }
}

/// Client-generated idempotency token attached to every outbound message.
///
/// Serialized as 32 lowercase hex characters so it survives codecs without
/// native 128-bit integers (JSON in particular).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ClientNonce(pub u128);

impl fmt::Display for ClientNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for ClientNonce {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 {
            return Err(ProtocolError::InvalidNonce(s.to_string()));
        }
        u128::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| ProtocolError::InvalidNonce(s.to_string()))
    }
}

impl From<ClientNonce> for String {
    fn from(nonce: ClientNonce) -> Self {
        nonce.to_string()
    }
}

impl TryFrom<String> for ClientNonce {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned id. `None` while the message is optimistic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,

    /// Room this message belongs to.
    pub room_id: RoomId,

    /// Stable sender identity.
    pub author_id: String,

    /// Sender display name at time of send.
    pub author_display_name: String,

    /// Text content. Never empty.
    pub body: String,

    /// Server timestamp. For optimistic messages this is a local estimate.
    pub sent_at: Timestamp,

    /// Idempotency token of the sending client, if the sender attached one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_nonce: Option<ClientNonce>,
}

impl Message {
    /// True once the server has assigned an id.
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.id.is_some()
    }
}
