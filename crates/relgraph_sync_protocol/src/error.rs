//! Error types for the graph-diff protocol.

use relgraph_codec::CodecError;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding, decoding or validating events.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// CBOR failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Event content violates the protocol.
    #[error("invalid event: {message}")]
    InvalidEvent {
        /// Description of the violation.
        message: String,
    },

    /// Encoded with an unknown protocol version.
    #[error("unsupported protocol version {found}, expected {expected}")]
    UnsupportedVersion {
        /// Version in the payload.
        found: u16,
        /// Version this build speaks.
        expected: u16,
    },
}

impl ProtocolError {
    /// Create an invalid event error.
    pub fn invalid_event(message: impl Into<String>) -> Self {
        Self::InvalidEvent {
            message: message.into(),
        }
    }
}
