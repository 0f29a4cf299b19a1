//! Meeting Controller error types.
//!
//! Error types map to signaling error codes and an [`ErrorKind`] for client
//! responses. Internal details are logged server-side but not exposed to clients.

use crate::store::StoreError;
use common::protocol::{ErrorKind, ServerMessage};
use thiserror::Error;

/// Meeting Controller error type.
///
/// Maps to signaling error codes:
/// - `PermissionDenied`: `FORBIDDEN` (3)
/// - `MeetingNotFound`, `ParticipantNotFound`: `NOT_FOUND` (4)
/// - `InvalidState`, `Protocol`: `CONFLICT` (5)
/// - Internal, Store, Config: `INTERNAL_ERROR` (6)
/// - Capacity and draining: `CAPACITY_EXCEEDED` (7)
#[derive(Debug, Error)]
pub enum McError {
    /// Meeting store operation failed after retries.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Meeting not found.
    #[error("Meeting not found: {0}")]
    MeetingNotFound(String),

    /// Participant or endpoint not found.
    #[error("Participant not found: {0}")]
    ParticipantNotFound(String),

    /// Room is at capacity.
    #[error("Meeting at capacity: {0}")]
    MeetingCapacityExceeded(String),

    /// Controller is at capacity (load shedding).
    #[error("MC at capacity")]
    McCapacityExceeded,

    /// Controller is draining (graceful shutdown).
    #[error("MC is draining")]
    Draining,

    /// Operation does not apply in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Inbound frame could not be understood.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Permission denied.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Internal error with context.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl McError {
    /// Returns the signaling error code for this error.
    pub fn error_code(&self) -> i32 {
        match self {
            McError::Store(_) | McError::Config(_) | McError::Internal(_) => {
                6 // INTERNAL_ERROR
            }
            McError::PermissionDenied(_) => 3, // FORBIDDEN
            McError::MeetingNotFound(_) | McError::ParticipantNotFound(_) => 4, // NOT_FOUND
            McError::InvalidState(_) | McError::Protocol(_) => 5, // CONFLICT
            McError::MeetingCapacityExceeded(_) | McError::McCapacityExceeded | McError::Draining => {
                7 // CAPACITY_EXCEEDED
            }
        }
    }

    /// Returns the signaling error code as a u16 (for metrics recording).
    #[allow(clippy::cast_sign_loss)] // error_code() returns well-known positive values 3-7
    pub fn status_code(&self) -> u16 {
        self.error_code() as u16
    }

    /// Returns the client-facing error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            McError::MeetingNotFound(_) | McError::ParticipantNotFound(_) => ErrorKind::NotFound,
            McError::PermissionDenied(_) => ErrorKind::Forbidden,
            McError::InvalidState(_)
            | McError::Protocol(_)
            | McError::MeetingCapacityExceeded(_) => ErrorKind::InvalidState,
            McError::Store(_) | McError::McCapacityExceeded | McError::Draining => {
                ErrorKind::Transient
            }
            McError::Config(_) | McError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns a bounded label string for the error variant (for metrics).
    pub fn error_type_label(&self) -> &'static str {
        match self {
            McError::Store(_) => "store",
            McError::Config(_) => "config",
            McError::MeetingNotFound(_) => "meeting_not_found",
            McError::ParticipantNotFound(_) => "participant_not_found",
            McError::MeetingCapacityExceeded(_) => "meeting_capacity_exceeded",
            McError::McCapacityExceeded => "mc_capacity_exceeded",
            McError::Draining => "draining",
            McError::InvalidState(_) => "invalid_state",
            McError::Protocol(_) => "protocol",
            McError::PermissionDenied(_) => "permission_denied",
            McError::Internal(_) => "internal",
        }
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            McError::Config(_) | McError::Internal(_) => "An internal error occurred".to_string(),
            McError::Store(_) => "Meeting state is temporarily unavailable".to_string(),
            McError::MeetingNotFound(_) => "Meeting not found".to_string(),
            McError::ParticipantNotFound(_) => "Participant not found".to_string(),
            McError::MeetingCapacityExceeded(_) => "Meeting is at capacity".to_string(),
            McError::McCapacityExceeded => "Server is at capacity, please try again".to_string(),
            McError::Draining => "Server is shutting down, please reconnect".to_string(),
            McError::Protocol(_) => "Malformed message".to_string(),
            McError::InvalidState(msg) | McError::PermissionDenied(msg) => msg.clone(),
        }
    }

    /// Build the `error` event delivered to the originating connection.
    pub fn to_server_message(&self) -> ServerMessage {
        ServerMessage::Error {
            kind: self.kind(),
            code: self.error_code(),
            message: self.client_message(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        // Internal errors -> 6
        assert_eq!(
            McError::Store(StoreError::Unavailable("conn failed".to_string())).error_code(),
            6
        );
        assert_eq!(McError::Config("bad config".to_string()).error_code(), 6);
        assert_eq!(McError::Internal("test".to_string()).error_code(), 6);

        // Forbidden -> 3
        assert_eq!(
            McError::PermissionDenied("not host".to_string()).error_code(),
            3
        );

        // Not found -> 4
        assert_eq!(
            McError::MeetingNotFound("meeting-123".to_string()).error_code(),
            4
        );
        assert_eq!(
            McError::ParticipantNotFound("participant-456".to_string()).error_code(),
            4
        );

        // Conflict -> 5
        assert_eq!(
            McError::InvalidState("already admitted".to_string()).error_code(),
            5
        );
        assert_eq!(McError::Protocol("bad frame".to_string()).error_code(), 5);

        // Capacity exceeded -> 7
        assert_eq!(
            McError::MeetingCapacityExceeded("max 100".to_string()).error_code(),
            7
        );
        assert_eq!(McError::McCapacityExceeded.error_code(), 7);
        assert_eq!(McError::Draining.error_code(), 7);
        assert_eq!(McError::Draining.status_code(), 7);
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            McError::MeetingNotFound("m".to_string()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            McError::PermissionDenied("x".to_string()).kind(),
            ErrorKind::Forbidden
        );
        assert_eq!(
            McError::InvalidState("x".to_string()).kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(
            McError::Store(StoreError::Timeout).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            McError::Internal("x".to_string()).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        // Internal errors should not leak details
        let store_err =
            McError::Store(StoreError::Unavailable("refused at 192.168.1.100:5432".to_string()));
        assert!(!store_err.client_message().contains("192.168"));

        let config_err = McError::Config("missing secret key".to_string());
        assert!(!config_err.client_message().contains("secret"));
        assert_eq!(config_err.client_message(), "An internal error occurred");

        // Forbidden carries the caller-facing reason
        let forbidden = McError::PermissionDenied("Only hosts can admit participants".to_string());
        assert_eq!(
            forbidden.client_message(),
            "Only hosts can admit participants"
        );
    }

    #[test]
    fn test_to_server_message() {
        let msg = McError::PermissionDenied("Only hosts can admit participants".to_string())
            .to_server_message();
        assert_eq!(
            msg,
            ServerMessage::Error {
                kind: ErrorKind::Forbidden,
                code: 3,
                message: "Only hosts can admit participants".to_string(),
            }
        );
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", McError::InvalidState("not waiting".to_string())),
            "Invalid state: not waiting"
        );
        assert_eq!(
            format!("{}", McError::Store(StoreError::Timeout)),
            "Store error: store operation timed out"
        );
    }
}
