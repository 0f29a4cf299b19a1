//! Common error types for meeting components.

use thiserror::Error;

/// Errors raised while encoding or decoding signaling frames.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Inbound frame was not a valid message.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Outbound message could not be serialized.
    #[error("Encode error: {0}")]
    Encode(String),
}

/// Result type alias using `ProtocolError`
pub type Result<T> = std::result::Result<T, ProtocolError>;
