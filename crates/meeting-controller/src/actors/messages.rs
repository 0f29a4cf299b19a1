//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via `tokio::sync::mpsc`.
//! Response patterns use `tokio::sync::oneshot` for request-reply semantics.

use crate::errors::McError;

use super::meeting::MeetingActorHandle;

use common::protocol::{ClientMessage, ServerMessage};
use common::types::{AdmissionStatus, ConnectionId, MeetingId, Permissions, Person, Role};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Messages sent to `MeetingControllerActor`.
#[derive(Debug)]
pub enum ControllerMessage {
    /// Get-or-create the room for `meeting_id` and enqueue the join into it.
    RouteJoin {
        meeting_id: MeetingId,
        request: JoinRequest,
        /// Handle of the room the join was enqueued into.
        respond_to: oneshot::Sender<Result<MeetingActorHandle, McError>>,
    },

    /// A room reports that its endpoint set became empty.
    RoomEmpty { meeting_id: MeetingId },

    /// Answer to a close request, posted by the task that asked the room.
    RoomClosed {
        meeting_id: MeetingId,
        /// Which room under `meeting_id` answered.
        generation: u64,
        /// The room was empty and has stopped, or could not be reached.
        closed: bool,
    },

    /// Get information about a live room.
    GetMeeting {
        meeting_id: MeetingId,
        respond_to: oneshot::Sender<Result<MeetingInfo, McError>>,
    },

    /// Get current status of all rooms (for health checks).
    GetStatus {
        respond_to: oneshot::Sender<ControllerStatus>,
    },

    /// Initiate graceful shutdown (SIGTERM received).
    Shutdown {
        deadline: Duration,
        respond_to: oneshot::Sender<Result<(), McError>>,
    },
}

/// Messages sent to `MeetingActor`.
#[derive(Debug)]
pub enum MeetingMessage {
    /// A new connection wants to join this room.
    Join(JoinRequest),

    /// Any post-join message from a connection.
    Inbound {
        connection_id: ConnectionId,
        message: ClientMessage,
    },

    /// The transport for a connection went away (no explicit leave).
    ConnectionDisconnected { connection_id: ConnectionId },

    /// Fallback deadline for announcing a joiner that never acked its roster.
    AnnounceDeadline { connection_id: ConnectionId },

    /// Collection request from the controller. Replies `true` and stops if empty.
    CloseIfEmpty { respond_to: oneshot::Sender<bool> },

    /// Get current room state (for debugging/health).
    GetState {
        respond_to: oneshot::Sender<MeetingState>,
    },
}

/// Messages sent to `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// Deliver an event to the client.
    Send { message: ServerMessage },

    /// Deliver any queued events, then close the transport.
    Close { reason: CloseReason },
}

/// A join attempt travelling from the transport through the controller to a room.
#[derive(Debug)]
pub struct JoinRequest {
    pub connection_id: ConnectionId,
    pub person: Person,
    /// Outbound event sink of the socket writer.
    pub outbound: mpsc::Sender<ServerMessage>,
    /// Cancelling this token closes the socket.
    pub transport_token: CancellationToken,
    pub respond_to: oneshot::Sender<Result<JoinOutcome, McError>>,
}

/// Result of a successful join evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Admitted { role: Role, permissions: Permissions },
    Waiting,
    /// The connection is being closed.
    Denied,
}

impl JoinOutcome {
    #[must_use]
    pub const fn status(&self) -> AdmissionStatus {
        match self {
            JoinOutcome::Admitted { .. } => AdmissionStatus::Admitted,
            JoinOutcome::Waiting => AdmissionStatus::Waiting,
            JoinOutcome::Denied => AdmissionStatus::Denied,
        }
    }
}

/// Why a connection actor is closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent `leave`.
    Left,
    /// Host refused admission.
    Denied,
    /// Host removed the participant.
    Removed,
    /// Outbound buffer overflowed.
    SlowConsumer,
    /// Room is shutting down.
    Shutdown,
}

impl CloseReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Left => "left",
            CloseReason::Denied => "denied",
            CloseReason::Removed => "removed",
            CloseReason::SlowConsumer => "slow_consumer",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// Information about a live room returned by `GetMeeting`.
#[derive(Debug, Clone)]
pub struct MeetingInfo {
    pub meeting_id: MeetingId,
    /// Endpoints in any admission state.
    pub endpoint_count: usize,
    pub admitted_count: usize,
    /// Room creation timestamp (unix seconds).
    pub created_at: i64,
}

/// Status of the `MeetingControllerActor`.
#[derive(Debug, Clone)]
pub struct ControllerStatus {
    pub meeting_count: usize,
    pub connection_count: usize,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}

/// Snapshot of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub connection_id: ConnectionId,
    pub person: Person,
    pub role: Role,
    pub status: AdmissionStatus,
    pub permissions: Permissions,
    /// `peer-joined` has been broadcast for this endpoint.
    pub announced: bool,
}

/// Current state of a room (for debugging/health and tests).
#[derive(Debug, Clone)]
pub struct MeetingState {
    pub meeting_id: MeetingId,
    pub endpoints: Vec<EndpointInfo>,
    /// Connection ids in the admitted index.
    pub admitted: Vec<ConnectionId>,
    pub next_chat_seq: u64,
    pub mailbox_depth: usize,
    pub is_shutting_down: bool,
}

impl MeetingState {
    /// Every admitted connection is also a known endpoint with status admitted.
    #[must_use]
    pub fn admitted_index_consistent(&self) -> bool {
        self.admitted.iter().all(|id| {
            self.endpoints
                .iter()
                .any(|e| &e.connection_id == id && e.status == AdmissionStatus::Admitted)
        }) && self
            .endpoints
            .iter()
            .filter(|e| e.status == AdmissionStatus::Admitted)
            .count()
            == self.admitted.len()
    }
}
