//! In-process test connection for signaling tests.
//!
//! A [`TestClient`] plays the part of the WebSocket transport: it owns the
//! outbound event receiver and transport token that the real socket would,
//! joins through the controller, and delivers client messages straight to
//! the room.

use common::protocol::{ClientMessage, PeerInfo, ServerMessage};
use common::types::{ConnectionId, MeetingId, Person};
use meeting_controller::actors::{
    ActorMetrics, ControllerConfig, JoinOutcome, MeetingActorHandle, MeetingControllerActorHandle,
};
use meeting_controller::errors::McError;
use meeting_controller::store::MeetingStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How long [`TestClient::next`] waits before failing the test.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// Spawn a controller with default tunables over `store`.
pub fn spawn_controller(store: impl MeetingStore + 'static) -> MeetingControllerActorHandle {
    spawn_controller_with(store, ControllerConfig::default())
}

/// Spawn a controller with custom tunables over `store`.
pub fn spawn_controller_with(
    store: impl MeetingStore + 'static,
    config: ControllerConfig,
) -> MeetingControllerActorHandle {
    MeetingControllerActorHandle::new(config, Arc::new(store), ActorMetrics::new())
}

/// Let spawned actors run until they go idle.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// One simulated signaling connection.
#[derive(Debug)]
pub struct TestClient {
    pub connection_id: ConnectionId,
    pub person: Person,
    /// Result of the join.
    pub outcome: Result<JoinOutcome, McError>,
    room: Option<MeetingActorHandle>,
    events: mpsc::Receiver<ServerMessage>,
    transport: CancellationToken,
}

impl TestClient {
    /// Open a connection and join `meeting_id` as `person`.
    pub async fn join(
        controller: &MeetingControllerActorHandle,
        meeting_id: &str,
        person: Person,
    ) -> Self {
        let (tx, events) = mpsc::channel(256);
        let transport = CancellationToken::new();
        let connection_id = ConnectionId::new();

        let result = controller
            .join(
                MeetingId::new(meeting_id),
                connection_id,
                person.clone(),
                tx,
                transport.clone(),
            )
            .await;

        let (room, outcome) = match result {
            Ok((room, outcome)) => (Some(room), Ok(outcome)),
            Err(e) => (None, Err(e)),
        };

        Self {
            connection_id,
            person,
            outcome,
            room,
            events,
            transport,
        }
    }

    /// Join and assert the outcome is admitted.
    pub async fn join_admitted(
        controller: &MeetingControllerActorHandle,
        meeting_id: &str,
        person: Person,
    ) -> Self {
        let client = Self::join(controller, meeting_id, person).await;
        assert!(
            matches!(client.outcome, Ok(JoinOutcome::Admitted { .. })),
            "expected admitted, got {:?}",
            client.outcome
        );
        client
    }

    /// The room this connection joined.
    pub fn room(&self) -> &MeetingActorHandle {
        self.room.as_ref().expect("join did not reach a room")
    }

    /// Deliver a client message to the room.
    pub async fn send(&self, message: ClientMessage) {
        self.room()
            .inbound(self.connection_id, message)
            .await
            .expect("room unavailable");
    }

    /// Next event, failing the test if none arrives in time.
    pub async fn next(&mut self) -> ServerMessage {
        match tokio::time::timeout(EVENT_TIMEOUT, self.events.recv()).await {
            Ok(Some(message)) => message,
            Ok(None) => panic!("event stream closed for {}", self.person.id),
            Err(_) => panic!("no event for {} within {EVENT_TIMEOUT:?}", self.person.id),
        }
    }

    /// Skip events until one matches `predicate`.
    pub async fn next_matching(
        &mut self,
        mut predicate: impl FnMut(&ServerMessage) -> bool,
    ) -> ServerMessage {
        loop {
            let message = self.next().await;
            if predicate(&message) {
                return message;
            }
        }
    }

    /// Events already queued, without waiting.
    pub async fn drain(&mut self) -> Vec<ServerMessage> {
        settle().await;
        let mut messages = Vec::new();
        while let Ok(message) = self.events.try_recv() {
            messages.push(message);
        }
        messages
    }

    /// Assert nothing is queued.
    pub async fn expect_silence(&mut self) {
        let pending = self.drain().await;
        assert!(
            pending.is_empty(),
            "expected no events for {}, got {pending:?}",
            self.person.id
        );
    }

    /// Consume `joined`, `chat-history` and `roster` and return the roster.
    pub async fn expect_handshake(&mut self) -> Vec<PeerInfo> {
        let joined = self.next().await;
        assert!(
            matches!(joined, ServerMessage::Joined { connection_id, .. } if connection_id == self.connection_id),
            "expected joined, got {joined:?}"
        );
        let history = self.next().await;
        assert!(
            matches!(history, ServerMessage::ChatHistory { .. }),
            "expected chat-history, got {history:?}"
        );
        match self.next().await {
            ServerMessage::Roster { peers } => peers,
            other => panic!("expected roster, got {other:?}"),
        }
    }

    /// Complete the two-phase join: consume the handshake and send `roster-ack`.
    pub async fn complete_handshake(&mut self) -> Vec<PeerInfo> {
        let peers = self.expect_handshake().await;
        self.send(ClientMessage::RosterAck).await;
        peers
    }

    pub async fn leave(&self) {
        self.send(ClientMessage::Leave).await;
    }

    /// Simulate the socket dropping without a `leave`.
    pub async fn disconnect(&self) {
        self.transport.cancel();
        if let Some(room) = &self.room {
            let _ = room.connection_disconnected(self.connection_id).await;
        }
    }

    /// Whether the coordinator closed this connection's transport.
    pub fn is_closed(&self) -> bool {
        self.transport.is_cancelled()
    }

    /// Wait until the coordinator closes the transport.
    pub async fn wait_closed(&self) {
        tokio::time::timeout(EVENT_TIMEOUT, self.transport.cancelled())
            .await
            .unwrap_or_else(|_| panic!("transport for {} was not closed", self.person.id));
    }
}
