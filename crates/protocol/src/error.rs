//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize a message.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize a message (malformed JSON or wrong envelope shape).
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// The envelope named an event this side does not understand.
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    /// The event name was valid but its payload was not.
    #[error("invalid payload for {event}: {reason}")]
    InvalidPayload {
        /// Event whose payload failed to decode.
        event: String,
        /// Decoder message.
        reason: String,
    },
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}
