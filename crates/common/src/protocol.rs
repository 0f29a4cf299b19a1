//! Signaling wire protocol.
//!
//! Every frame on the signaling socket is one JSON object tagged by `type`.
//! Clients send [`ClientMessage`], the coordinator sends [`ServerMessage`].
//!
//! ```text
//! client                        coordinator
//!   | -- join ------------------> |
//!   | <------------------ joined  |   (or waiting / denied)
//!   | <------------ chat-history  |
//!   | <------------------ roster  |
//!   | -- roster-ack ------------> |   peer-joined is broadcast after this
//!   | -- offer / answer / candidate (target) -->  relayed with `from`
//! ```

use crate::error::ProtocolError;
use crate::types::{
    AdmissionStatus, ConnectionId, MeetingId, MeetingSettings, Permissions, PermissionDelta,
    Person, PersonId, SettingsDelta,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether a session description is an offer or an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description exchanged during negotiation. Opaque to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    #[must_use]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate. Opaque to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// One admitted endpoint as listed in a roster or presence event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub connection_id: ConnectionId,
    pub person: Person,
    pub permissions: Permissions,
    pub is_host: bool,
}

/// A chat message as stored and delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Per-room sequence number assigned by the coordinator (0 = not yet assigned).
    #[serde(default)]
    pub seq: u64,
    /// Client-generated id used to match an optimistic copy with its echo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    pub author: Person,
    pub text: String,
    /// Unix epoch milliseconds.
    pub timestamp_ms: i64,
}

/// Error taxonomy surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    InvalidState,
    Transient,
    Internal,
}

/// Messages sent by a client to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Start the admission flow for this connection.
    Join { meeting_id: MeetingId, person: Person },
    /// Joiner has processed `joined`, `chat-history` and `roster`.
    RosterAck,
    Admit {
        person_id: PersonId,
        connection_id: ConnectionId,
    },
    Deny {
        person_id: PersonId,
        connection_id: ConnectionId,
    },
    UpdatePermissions {
        person_id: PersonId,
        delta: PermissionDelta,
    },
    RemoveParticipant { person_id: PersonId },
    UpdateSettings { delta: SettingsDelta },
    RequestScreenShare,
    RequestRoster,
    Offer {
        target: ConnectionId,
        description: SessionDescription,
    },
    Answer {
        target: ConnectionId,
        description: SessionDescription,
    },
    Candidate {
        target: ConnectionId,
        candidate: IceCandidate,
    },
    Chat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<Uuid>,
        text: String,
    },
    Leave,
}

impl ClientMessage {
    /// Bounded label for logs and metrics.
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::RosterAck => "roster_ack",
            ClientMessage::Admit { .. } => "admit",
            ClientMessage::Deny { .. } => "deny",
            ClientMessage::UpdatePermissions { .. } => "update_permissions",
            ClientMessage::RemoveParticipant { .. } => "remove_participant",
            ClientMessage::UpdateSettings { .. } => "update_settings",
            ClientMessage::RequestScreenShare => "request_screen_share",
            ClientMessage::RequestRoster => "request_roster",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::Candidate { .. } => "candidate",
            ClientMessage::Chat { .. } => "chat",
            ClientMessage::Leave => "leave",
        }
    }

    /// Decode one text frame.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Malformed` if the frame is not a known message.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Encode as one text frame.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Encode` if serialization fails.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

/// Messages sent by the coordinator to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Joined {
        connection_id: ConnectionId,
        is_host: bool,
        permissions: Permissions,
        settings: MeetingSettings,
    },
    Waiting,
    Denied,
    /// Sent to host connections only.
    AdmissionRequest {
        person_id: PersonId,
        name: String,
        connection_id: ConnectionId,
    },
    /// Sent to host connections other than the one that decided.
    AdmissionResolved {
        person_id: PersonId,
        connection_id: ConnectionId,
        status: AdmissionStatus,
    },
    /// A waiting connection went away before any host decided.
    AdmissionWithdrawn {
        person_id: PersonId,
        connection_id: ConnectionId,
    },
    ChatHistory { messages: Vec<ChatMessage> },
    Roster { peers: Vec<PeerInfo> },
    PeerJoined { peer: PeerInfo },
    PeerLeft {
        connection_id: ConnectionId,
        person_id: PersonId,
    },
    Offer {
        from: ConnectionId,
        from_person: Person,
        description: SessionDescription,
    },
    Answer {
        from: ConnectionId,
        description: SessionDescription,
    },
    Candidate {
        from: ConnectionId,
        candidate: IceCandidate,
    },
    PermissionsChanged { permissions: Permissions },
    SettingsChanged { settings: MeetingSettings },
    ScreenShareDecision { granted: bool },
    Removed,
    Chat { message: ChatMessage },
    Error {
        kind: ErrorKind,
        code: i32,
        message: String,
    },
}

impl ServerMessage {
    /// Bounded label for logs and metrics.
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            ServerMessage::Joined { .. } => "joined",
            ServerMessage::Waiting => "waiting",
            ServerMessage::Denied => "denied",
            ServerMessage::AdmissionRequest { .. } => "admission_request",
            ServerMessage::AdmissionResolved { .. } => "admission_resolved",
            ServerMessage::AdmissionWithdrawn { .. } => "admission_withdrawn",
            ServerMessage::ChatHistory { .. } => "chat_history",
            ServerMessage::Roster { .. } => "roster",
            ServerMessage::PeerJoined { .. } => "peer_joined",
            ServerMessage::PeerLeft { .. } => "peer_left",
            ServerMessage::Offer { .. } => "offer",
            ServerMessage::Answer { .. } => "answer",
            ServerMessage::Candidate { .. } => "candidate",
            ServerMessage::PermissionsChanged { .. } => "permissions_changed",
            ServerMessage::SettingsChanged { .. } => "settings_changed",
            ServerMessage::ScreenShareDecision { .. } => "screen_share_decision",
            ServerMessage::Removed => "removed",
            ServerMessage::Chat { .. } => "chat",
            ServerMessage::Error { .. } => "error",
        }
    }

    /// Decode one text frame.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Malformed` if the frame is not a known message.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Encode as one text frame.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Encode` if serialization fails.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_wire_shape() {
        let json = r#"{"type":"join","meeting_id":"standup","person":{"id":"u-1","name":"Ada"}}"#;
        let msg = ClientMessage::decode(json).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Join {
                meeting_id: MeetingId::new("standup"),
                person: Person::new("u-1", "Ada"),
            }
        );
        assert_eq!(msg.message_type(), "join");

        let ack = ClientMessage::RosterAck.encode().unwrap();
        assert_eq!(ack, r#"{"type":"roster-ack"}"#);
    }

    #[test]
    fn test_unknown_message_is_malformed() {
        let result = ClientMessage::decode(r#"{"type":"teleport"}"#);
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));

        let result = ClientMessage::decode("not json");
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_chat_without_message_id() {
        let msg = ClientMessage::decode(r#"{"type":"chat","text":"hi"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Chat {
                message_id: None,
                text: "hi".to_string()
            }
        );
    }

    #[test]
    fn test_server_error_event_shape() {
        let msg = ServerMessage::Error {
            kind: ErrorKind::Forbidden,
            code: 3,
            message: "Only hosts can admit participants".to_string(),
        };
        let json = msg.encode().unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains(r#""kind":"forbidden""#));
        assert_eq!(ServerMessage::decode(&json).unwrap(), msg);
    }

    #[test]
    fn test_relayed_offer_carries_sender() {
        let from = ConnectionId::new();
        let msg = ServerMessage::Offer {
            from,
            from_person: Person::new("u-2", "Grace"),
            description: SessionDescription::offer("v=0"),
        };
        let json = msg.encode().unwrap();
        assert!(json.contains(r#""type":"offer""#));
        assert!(json.contains(&from.to_string()));
        assert!(json.contains(r#""kind":"offer""#));
    }
}
