//! Peer session error types.

use crate::link::LinkState;
use common::error::ProtocolError;
use thiserror::Error;

/// Errors raised while negotiating or running a peer session.
///
/// None of these end the session. A failure on one link tears down that
/// link only.
#[derive(Debug, Error)]
pub enum PeerError {
    /// The media engine rejected an operation.
    #[error("Media engine error: {0}")]
    Engine(String),

    #[error("Invalid link transition: {from} -> {to}")]
    InvalidTransition { from: LinkState, to: LinkState },

    /// The signaling connection failed or is gone.
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// The session or link actor has already stopped.
    #[error("Session closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl PeerError {
    /// Bounded label for logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            PeerError::Engine(_) => "engine",
            PeerError::InvalidTransition { .. } => "invalid_transition",
            PeerError::Signaling(_) => "signaling",
            PeerError::Closed => "closed",
            PeerError::Protocol(_) => "protocol",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = PeerError::InvalidTransition {
            from: LinkState::New,
            to: LinkState::AnswerReceived,
        };
        assert_eq!(
            format!("{err}"),
            "Invalid link transition: new -> answer-received"
        );
        assert_eq!(err.label(), "invalid_transition");

        let err = PeerError::Protocol(ProtocolError::Malformed("eof".to_string()));
        assert_eq!(err.label(), "protocol");
        assert!(format!("{err}").contains("eof"));
    }
}
