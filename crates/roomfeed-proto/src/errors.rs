//! Protocol error types.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding or decoding frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Encoded frame exceeds [`crate::frame::MAX_FRAME_SIZE`].
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Actual size in bytes
        size: usize,
        /// Maximum accepted size in bytes
        max: usize,
    },

    /// Frame is empty.
    #[error("empty frame")]
    EmptyFrame,

    /// CBOR serialization failed.
    #[error("encode failed: {0}")]
    Encode(String),

    /// CBOR deserialization failed or the frame shape is unknown.
    #[error("decode failed: {0}")]
    Decode(String),

    /// Client nonce is not 32 hex characters.
    #[error("invalid client nonce: {0:?}")]
    InvalidNonce(String),
}
