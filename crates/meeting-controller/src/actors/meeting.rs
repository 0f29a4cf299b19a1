//! `MeetingActor` - per-meeting actor that owns room state.
//!
//! Each `MeetingActor`:
//! - Owns every endpoint of one meeting (all admission states) plus the
//!   admitted and person-identity indexes
//! - Supervises one `ConnectionActor` per endpoint
//! - Is the single writer for its meeting id; every inbound client message is
//!   dispatched through one match in [`MeetingActor::handle_inbound`]
//! - Reads and writes the durable meeting record through the injected store
//!
//! # Join handshake
//!
//! An admitted joiner is sent `joined`, `chat-history` and `roster`, in that
//! order, and is then *pending announcement*. Other admitted endpoints receive
//! `peer-joined` only after the joiner sends `roster-ack`, or once the
//! announce fallback deadline fires, whichever happens first.

use crate::admission;
use crate::errors::McError;
use crate::observability::metrics as prom;
use crate::store::{with_retry, MeetingRecord, MeetingStore, RetryPolicy};

use super::connection::{ConnectionActor, ConnectionActorHandle};
use super::messages::{
    CloseReason, ControllerMessage, EndpointInfo, JoinOutcome, JoinRequest, MeetingMessage,
    MeetingState,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use common::protocol::{
    ChatMessage, ClientMessage, IceCandidate, PeerInfo, SdpKind, ServerMessage,
    SessionDescription,
};
use common::types::{
    AdmissionStatus, ConnectionId, MeetingId, MeetingSettings, PermissionDelta, Permissions,
    Person, PersonId, Role, SettingsDelta,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Default channel buffer size for the meeting mailbox.
pub const MEETING_CHANNEL_BUFFER: usize = 500;

/// How often the room loop wakes up to reap finished connection actors.
const CONNECTION_HEALTH_INTERVAL: Duration = Duration::from_secs(5);

/// Per-room tunables, derived from [`crate::config::Config`].
#[derive(Debug, Clone, Copy)]
pub struct RoomConfig {
    /// Endpoints (any admission state) a room accepts.
    pub max_participants: usize,
    /// Upper bound on how long a joiner stays unannounced without `roster-ack`.
    pub announce_fallback: Duration,
    /// Chat messages delivered to a newly admitted endpoint.
    pub chat_history_limit: usize,
    /// Retry policy for durable reads and writes on state-changing paths.
    pub store_retry: RetryPolicy,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_participants: 100,
            announce_fallback: Duration::from_millis(300),
            chat_history_limit: 100,
            store_retry: RetryPolicy::default(),
        }
    }
}

impl RoomConfig {
    #[must_use]
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            max_participants: config.max_participants_per_meeting as usize,
            announce_fallback: config.announce_fallback,
            chat_history_limit: config.chat_history_limit,
            store_retry: RetryPolicy {
                attempts: config.store_retry_attempts,
                backoff: config.store_retry_backoff,
            },
        }
    }
}

/// Handle to a `MeetingActor`.
#[derive(Clone, Debug)]
pub struct MeetingActorHandle {
    sender: mpsc::Sender<MeetingMessage>,
    cancel_token: CancellationToken,
    meeting_id: MeetingId,
}

impl MeetingActorHandle {
    /// Get the meeting ID.
    #[must_use]
    pub fn meeting_id(&self) -> &MeetingId {
        &self.meeting_id
    }

    /// Join a connection directly into this room and wait for the admission outcome.
    ///
    /// Production joins are routed through the controller so they can never
    /// reach a room that is being collected.
    pub async fn join(
        &self,
        connection_id: ConnectionId,
        person: Person,
        outbound: mpsc::Sender<ServerMessage>,
        transport_token: CancellationToken,
    ) -> Result<JoinOutcome, McError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue_join(JoinRequest {
            connection_id,
            person,
            outbound,
            transport_token,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| McError::Internal(format!("response receive failed: {e}")))?
    }

    /// Enqueue a join without waiting for its evaluation.
    pub(crate) async fn enqueue_join(&self, request: JoinRequest) -> Result<(), McError> {
        self.sender
            .send(MeetingMessage::Join(request))
            .await
            .map_err(|e| McError::Internal(format!("channel send failed: {e}")))
    }

    /// Enqueue a join without waiting for mailbox capacity.
    ///
    /// When the mailbox is full the join is handed to a background send, so
    /// the caller never waits on this room.
    pub(crate) fn try_enqueue_join(&self, request: JoinRequest) -> Result<(), McError> {
        match self.sender.try_send(MeetingMessage::Join(request)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(message)) => {
                let sender = self.sender.clone();
                tokio::spawn(async move {
                    if let Err(mpsc::error::SendError(MeetingMessage::Join(request))) =
                        sender.send(message).await
                    {
                        let _ = request
                            .respond_to
                            .send(Err(McError::Internal("room closed".to_string())));
                    }
                });
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(McError::Internal("channel send failed: room closed".to_string()))
            }
        }
    }

    /// Deliver a post-join client message.
    pub async fn inbound(
        &self,
        connection_id: ConnectionId,
        message: ClientMessage,
    ) -> Result<(), McError> {
        self.sender
            .send(MeetingMessage::Inbound {
                connection_id,
                message,
            })
            .await
            .map_err(|e| McError::Internal(format!("channel send failed: {e}")))
    }

    /// Notify that a connection's transport went away without `leave`.
    pub async fn connection_disconnected(&self, connection_id: ConnectionId) -> Result<(), McError> {
        self.sender
            .send(MeetingMessage::ConnectionDisconnected { connection_id })
            .await
            .map_err(|e| McError::Internal(format!("channel send failed: {e}")))
    }

    /// Ask the room to stop if it has no endpoints. Returns `true` if it stopped.
    pub async fn close_if_empty(&self) -> Result<bool, McError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(MeetingMessage::CloseIfEmpty { respond_to: tx })
            .await
            .map_err(|e| McError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| McError::Internal(format!("response receive failed: {e}")))
    }

    /// Get the current room state.
    pub async fn get_state(&self) -> Result<MeetingState, McError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(MeetingMessage::GetState { respond_to: tx })
            .await
            .map_err(|e| McError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| McError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the meeting actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// One live connection's participation record.
struct Endpoint {
    person: Person,
    role: Role,
    status: AdmissionStatus,
    permissions: Permissions,
    announced: bool,
    connection: ConnectionActorHandle,
    task_handle: JoinHandle<()>,
}

impl Endpoint {
    fn peer_info(&self, connection_id: ConnectionId) -> PeerInfo {
        PeerInfo {
            connection_id,
            person: self.person.clone(),
            permissions: self.permissions,
            is_host: self.role.is_host(),
        }
    }
}

/// The `MeetingActor` implementation.
pub struct MeetingActor {
    meeting_id: MeetingId,
    receiver: mpsc::Receiver<MeetingMessage>,
    /// Used to schedule announce deadlines without keeping the mailbox open.
    self_sender: mpsc::WeakSender<MeetingMessage>,
    /// Used to ask for collection when the room becomes empty.
    controller: Option<mpsc::WeakSender<ControllerMessage>>,
    /// Cancellation token (child of controller's token).
    cancel_token: CancellationToken,
    store: Arc<dyn MeetingStore>,
    config: RoomConfig,
    endpoints: HashMap<ConnectionId, Endpoint>,
    /// Connections whose status is admitted.
    admitted: HashSet<ConnectionId>,
    /// Open connections per person.
    identities: HashMap<PersonId, HashSet<ConnectionId>>,
    /// Admitted endpoints that have not been broadcast as `peer-joined` yet.
    pending_announcements: HashSet<ConnectionId>,
    /// Connections whose outbound mailbox rejected an event.
    evicted: Vec<ConnectionId>,
    /// Last settings read from the durable record.
    settings: MeetingSettings,
    next_chat_seq: u64,
    /// `RoomEmpty` was sent and no endpoint has been added since.
    collection_requested: bool,
    is_shutting_down: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl MeetingActor {
    /// Spawn a new meeting actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        meeting_id: MeetingId,
        store: Arc<dyn MeetingStore>,
        config: RoomConfig,
        controller: Option<mpsc::WeakSender<ControllerMessage>>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (MeetingActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(MEETING_CHANNEL_BUFFER);

        let actor = Self {
            meeting_id: meeting_id.clone(),
            receiver,
            self_sender: sender.downgrade(),
            controller,
            cancel_token: cancel_token.clone(),
            store,
            config,
            endpoints: HashMap::new(),
            admitted: HashSet::new(),
            identities: HashMap::new(),
            pending_announcements: HashSet::new(),
            evicted: Vec::new(),
            settings: MeetingSettings::default(),
            next_chat_seq: 1,
            collection_requested: false,
            is_shutting_down: false,
            metrics,
            mailbox: MailboxMonitor::new(
                ActorType::Meeting,
                meeting_id.as_str(),
                MEETING_CHANNEL_BUFFER,
            ),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = MeetingActorHandle {
            sender,
            cancel_token,
            meeting_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "mc.actor.meeting", fields(meeting_id = %self.meeting_id))]
    async fn run(mut self) {
        info!(
            target: "mc.actor.meeting",
            meeting_id = %self.meeting_id,
            "MeetingActor started"
        );

        self.init_chat_seq().await;

        let mut health_check = tokio::time::interval(CONNECTION_HEALTH_INTERVAL);

        loop {
            self.check_connection_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "mc.actor.meeting",
                        meeting_id = %self.meeting_id,
                        "MeetingActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                _ = health_check.tick() => {}

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            let should_exit = self.handle_message(message).await;
                            self.reap_evicted();
                            self.mailbox.observe(self.receiver.len());

                            if should_exit {
                                break;
                            }
                        }
                        None => {
                            info!(
                                target: "mc.actor.meeting",
                                meeting_id = %self.meeting_id,
                                "MeetingActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "mc.actor.meeting",
            meeting_id = %self.meeting_id,
            endpoints = self.endpoints.len(),
            messages_processed = self.mailbox.messages_processed(),
            "MeetingActor stopped"
        );
    }

    /// Continue the per-room chat sequence from persisted history.
    async fn init_chat_seq(&mut self) {
        match self.store.find_chat_history(&self.meeting_id, 1).await {
            Ok(history) => {
                self.next_chat_seq = history.last().map_or(1, |m| m.seq.saturating_add(1));
            }
            Err(e) => {
                warn!(
                    target: "mc.actor.meeting",
                    meeting_id = %self.meeting_id,
                    error = %e,
                    "Failed to load chat sequence, starting from 1"
                );
            }
        }
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: MeetingMessage) -> bool {
        match message {
            MeetingMessage::Join(request) => {
                self.handle_join(request).await;
                false
            }

            MeetingMessage::Inbound {
                connection_id,
                message,
            } => {
                let start = Instant::now();
                let message_type = message.message_type();
                if let Err(e) = self.handle_inbound(connection_id, message).await {
                    self.report_error(connection_id, message_type, &e);
                }
                prom::record_message_latency(message_type, start.elapsed());
                false
            }

            MeetingMessage::ConnectionDisconnected { connection_id } => {
                if self.depart(connection_id, CloseReason::Left) {
                    debug!(
                        target: "mc.actor.meeting",
                        meeting_id = %self.meeting_id,
                        connection_id = %connection_id,
                        "Connection disconnected without leave"
                    );
                }
                false
            }

            MeetingMessage::AnnounceDeadline { connection_id } => {
                if self.pending_announcements.contains(&connection_id) {
                    debug!(
                        target: "mc.actor.meeting",
                        meeting_id = %self.meeting_id,
                        connection_id = %connection_id,
                        "Roster not acknowledged in time, announcing"
                    );
                    self.announce(connection_id);
                }
                false
            }

            MeetingMessage::CloseIfEmpty { respond_to } => {
                let empty = self.endpoints.is_empty();
                if empty {
                    self.is_shutting_down = true;
                }
                let _ = respond_to.send(empty);
                empty
            }

            MeetingMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.get_state());
                false
            }
        }
    }

    /// Evaluate a join attempt and deliver the outcome.
    #[instrument(
        skip_all,
        fields(meeting_id = %self.meeting_id, connection_id = %request.connection_id)
    )]
    async fn handle_join(&mut self, request: JoinRequest) {
        let JoinRequest {
            connection_id,
            person,
            outbound,
            transport_token,
            respond_to,
        } = request;

        let result = self
            .evaluate_join(connection_id, person, outbound, transport_token)
            .await;

        match &result {
            Ok(outcome) => prom::record_admission_decision(outcome.status().as_str()),
            Err(e) => {
                prom::record_admission_decision("error");
                prom::record_error("join", e.error_type_label(), e.status_code());
                debug!(
                    target: "mc.actor.meeting",
                    meeting_id = %self.meeting_id,
                    connection_id = %connection_id,
                    error = %e,
                    "Join rejected"
                );
            }
        }

        let _ = respond_to.send(result);
    }

    async fn evaluate_join(
        &mut self,
        connection_id: ConnectionId,
        person: Person,
        outbound: mpsc::Sender<ServerMessage>,
        transport_token: CancellationToken,
    ) -> Result<JoinOutcome, McError> {
        if self.is_shutting_down {
            return Err(McError::Draining);
        }

        if self.endpoints.contains_key(&connection_id) {
            return Err(McError::InvalidState(
                "Connection has already joined".to_string(),
            ));
        }

        if self.endpoints.len() >= self.config.max_participants {
            return Err(McError::MeetingCapacityExceeded(self.meeting_id.to_string()));
        }

        let mut record = self.load_meeting().await?;
        let evaluation = admission::evaluate(&mut record, &person);
        if evaluation.record_changed {
            self.save_meeting(&record).await?;
        }
        self.settings = record.settings;

        match evaluation.outcome {
            AdmissionStatus::Denied | AdmissionStatus::Pending => {
                // Evicted before it ever becomes an endpoint
                let _ = outbound.try_send(ServerMessage::Denied);
                transport_token.cancel();
                info!(
                    target: "mc.actor.meeting",
                    meeting_id = %self.meeting_id,
                    connection_id = %connection_id,
                    person_id = %person.id,
                    "Join denied"
                );
                Ok(JoinOutcome::Denied)
            }

            AdmissionStatus::Waiting => {
                self.insert_endpoint(
                    connection_id,
                    person.clone(),
                    evaluation.role,
                    evaluation.permissions,
                    outbound,
                    transport_token,
                );
                self.send_to(connection_id, ServerMessage::Waiting);

                let request = ServerMessage::AdmissionRequest {
                    person_id: person.id.clone(),
                    name: person.name.clone(),
                    connection_id,
                };
                for host in self.admitted_hosts(None) {
                    self.send_to(host, request.clone());
                }

                info!(
                    target: "mc.actor.meeting",
                    meeting_id = %self.meeting_id,
                    connection_id = %connection_id,
                    person_id = %person.id,
                    "Participant waiting for admission"
                );
                Ok(JoinOutcome::Waiting)
            }

            AdmissionStatus::Admitted => {
                self.insert_endpoint(
                    connection_id,
                    person,
                    evaluation.role,
                    evaluation.permissions,
                    outbound,
                    transport_token,
                );
                self.admit_endpoint(connection_id, evaluation.permissions)
                    .await;
                Ok(JoinOutcome::Admitted {
                    role: evaluation.role,
                    permissions: evaluation.permissions,
                })
            }
        }
    }

    fn insert_endpoint(
        &mut self,
        connection_id: ConnectionId,
        person: Person,
        role: Role,
        permissions: Permissions,
        outbound: mpsc::Sender<ServerMessage>,
        transport_token: CancellationToken,
    ) {
        let (connection, task_handle) = ConnectionActor::spawn(
            connection_id,
            self.meeting_id.clone(),
            outbound,
            transport_token,
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );

        self.identities
            .entry(person.id.clone())
            .or_default()
            .insert(connection_id);

        self.endpoints.insert(
            connection_id,
            Endpoint {
                person,
                role,
                status: AdmissionStatus::Waiting,
                permissions,
                announced: false,
                connection,
                task_handle,
            },
        );
        self.collection_requested = false;
    }

    /// Move an endpoint into the admitted index and run the first half of the
    /// join handshake: `joined`, `chat-history`, `roster`.
    async fn admit_endpoint(&mut self, connection_id: ConnectionId, permissions: Permissions) {
        let Some(endpoint) = self.endpoints.get_mut(&connection_id) else {
            return;
        };
        endpoint.status = AdmissionStatus::Admitted;
        endpoint.permissions = permissions;
        let role = endpoint.role;
        self.admitted.insert(connection_id);

        self.send_to(
            connection_id,
            ServerMessage::Joined {
                connection_id,
                is_host: role.is_host(),
                permissions,
                settings: self.settings,
            },
        );

        let messages = self.load_chat_history().await;
        self.send_to(connection_id, ServerMessage::ChatHistory { messages });

        let peers = self.roster_for(connection_id);
        self.send_to(connection_id, ServerMessage::Roster { peers });

        self.pending_announcements.insert(connection_id);
        self.schedule_announce_deadline(connection_id);

        if role.is_host() {
            let waiting: Vec<ServerMessage> = self
                .endpoints
                .iter()
                .filter(|(_, e)| e.status == AdmissionStatus::Waiting)
                .map(|(id, e)| ServerMessage::AdmissionRequest {
                    person_id: e.person.id.clone(),
                    name: e.person.name.clone(),
                    connection_id: *id,
                })
                .collect();
            for request in waiting {
                self.send_to(connection_id, request);
            }
        }

        info!(
            target: "mc.actor.meeting",
            meeting_id = %self.meeting_id,
            connection_id = %connection_id,
            is_host = role.is_host(),
            admitted = self.admitted.len(),
            "Participant admitted"
        );
    }

    fn schedule_announce_deadline(&self, connection_id: ConnectionId) {
        let weak = self.self_sender.clone();
        let delay = self.config.announce_fallback;
        let cancel = self.cancel_token.clone();

        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    if let Some(sender) = weak.upgrade() {
                        let _ = sender
                            .send(MeetingMessage::AnnounceDeadline { connection_id })
                            .await;
                    }
                }
            }
        });
    }

    /// Second half of the join handshake. Runs at most once per endpoint.
    fn announce(&mut self, connection_id: ConnectionId) {
        if !self.pending_announcements.remove(&connection_id) {
            return;
        }
        let Some(endpoint) = self.endpoints.get_mut(&connection_id) else {
            return;
        };
        endpoint.announced = true;
        let peer = endpoint.peer_info(connection_id);

        let targets: Vec<ConnectionId> = self
            .admitted
            .iter()
            .copied()
            .filter(|id| *id != connection_id)
            .collect();
        let message = ServerMessage::PeerJoined { peer };
        for target in targets {
            self.send_to(target, message.clone());
        }

        debug!(
            target: "mc.actor.meeting",
            meeting_id = %self.meeting_id,
            connection_id = %connection_id,
            "Participant announced"
        );
    }

    /// Dispatch one post-join client message.
    #[instrument(skip_all, fields(meeting_id = %self.meeting_id, connection_id = %connection_id))]
    async fn handle_inbound(
        &mut self,
        connection_id: ConnectionId,
        message: ClientMessage,
    ) -> Result<(), McError> {
        if !self.endpoints.contains_key(&connection_id) {
            debug!(
                target: "mc.actor.meeting",
                meeting_id = %self.meeting_id,
                connection_id = %connection_id,
                message_type = message.message_type(),
                "Message from departed connection, ignoring"
            );
            return Ok(());
        }

        match message {
            ClientMessage::Join { .. } => Err(McError::InvalidState(
                "Connection has already joined".to_string(),
            )),

            ClientMessage::RosterAck => {
                if self.pending_announcements.contains(&connection_id) {
                    self.announce(connection_id);
                }
                Ok(())
            }

            ClientMessage::Admit {
                person_id,
                connection_id: target,
            } => self.handle_admit(connection_id, &person_id, target).await,

            ClientMessage::Deny {
                person_id,
                connection_id: target,
            } => self.handle_deny(connection_id, &person_id, target).await,

            ClientMessage::UpdatePermissions { person_id, delta } => {
                self.handle_update_permissions(connection_id, &person_id, &delta)
                    .await
            }

            ClientMessage::RemoveParticipant { person_id } => {
                self.handle_remove(connection_id, &person_id).await
            }

            ClientMessage::UpdateSettings { delta } => {
                self.handle_update_settings(connection_id, &delta).await
            }

            ClientMessage::RequestScreenShare => {
                let endpoint = self.require_admitted(connection_id)?;
                let granted = endpoint.role.is_host() || endpoint.permissions.can_screen_share;
                self.send_to(connection_id, ServerMessage::ScreenShareDecision { granted });
                Ok(())
            }

            ClientMessage::RequestRoster => {
                self.require_admitted(connection_id)?;
                let peers = self.roster_for(connection_id);
                self.send_to(connection_id, ServerMessage::Roster { peers });
                Ok(())
            }

            ClientMessage::Offer {
                target,
                description,
            } => {
                self.relay_description(connection_id, target, description);
                Ok(())
            }

            ClientMessage::Answer {
                target,
                description,
            } => {
                self.relay_description(connection_id, target, description);
                Ok(())
            }

            ClientMessage::Candidate { target, candidate } => {
                self.relay_candidate(connection_id, target, candidate);
                Ok(())
            }

            ClientMessage::Chat { message_id, text } => {
                self.handle_chat(connection_id, message_id, text).await
            }

            ClientMessage::Leave => {
                self.depart(connection_id, CloseReason::Left);
                Ok(())
            }
        }
    }

    // ========================================================================
    // Admission decisions
    // ========================================================================

    async fn handle_admit(
        &mut self,
        actor: ConnectionId,
        person_id: &PersonId,
        target: ConnectionId,
    ) -> Result<(), McError> {
        self.require_host(actor)?;

        let mut record = self.load_meeting().await?;
        let participant = record
            .participant_mut(person_id)
            .ok_or_else(|| McError::ParticipantNotFound(person_id.to_string()))?;

        if participant.status == AdmissionStatus::Admitted {
            return Err(McError::InvalidState(
                "Participant already admitted".to_string(),
            ));
        }
        participant.status = participant
            .status
            .transition(AdmissionStatus::Admitted)
            .map_err(|e| McError::InvalidState(e.to_string()))?;
        let permissions = participant.permissions;

        self.save_meeting(&record).await?;
        self.settings = record.settings;

        for connection_id in self.waiting_connections_of(person_id) {
            self.admit_endpoint(connection_id, permissions).await;
        }

        self.resolve_for_hosts(actor, person_id, target, AdmissionStatus::Admitted);
        prom::record_admission_decision(AdmissionStatus::Admitted.as_str());
        Ok(())
    }

    async fn handle_deny(
        &mut self,
        actor: ConnectionId,
        person_id: &PersonId,
        target: ConnectionId,
    ) -> Result<(), McError> {
        self.require_host(actor)?;

        let mut record = self.load_meeting().await?;
        let participant = record
            .participant_mut(person_id)
            .ok_or_else(|| McError::ParticipantNotFound(person_id.to_string()))?;

        if participant.status != AdmissionStatus::Waiting {
            return Err(McError::InvalidState(
                "Participant is not waiting for admission".to_string(),
            ));
        }
        participant.status = participant
            .status
            .transition(AdmissionStatus::Denied)
            .map_err(|e| McError::InvalidState(e.to_string()))?;

        self.save_meeting(&record).await?;

        for connection_id in self.waiting_connections_of(person_id) {
            self.send_to(connection_id, ServerMessage::Denied);
            self.depart(connection_id, CloseReason::Denied);
        }

        self.resolve_for_hosts(actor, person_id, target, AdmissionStatus::Denied);
        prom::record_admission_decision(AdmissionStatus::Denied.as_str());
        Ok(())
    }

    /// Keep the waiting lists of the other host connections in sync.
    fn resolve_for_hosts(
        &mut self,
        actor: ConnectionId,
        person_id: &PersonId,
        target: ConnectionId,
        status: AdmissionStatus,
    ) {
        let message = ServerMessage::AdmissionResolved {
            person_id: person_id.clone(),
            connection_id: target,
            status,
        };
        for host in self.admitted_hosts(Some(actor)) {
            self.send_to(host, message.clone());
        }
    }

    // ========================================================================
    // Host controls
    // ========================================================================

    async fn handle_update_permissions(
        &mut self,
        actor: ConnectionId,
        person_id: &PersonId,
        delta: &PermissionDelta,
    ) -> Result<(), McError> {
        self.require_host(actor)?;

        let mut record = self.load_meeting().await?;
        let participant = record
            .participant_mut(person_id)
            .ok_or_else(|| McError::ParticipantNotFound(person_id.to_string()))?;
        let permissions = participant.permissions.merged(delta);
        participant.permissions = permissions;

        self.save_meeting(&record).await?;

        let connections: Vec<ConnectionId> = self
            .identities
            .get(person_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        for connection_id in &connections {
            if let Some(endpoint) = self.endpoints.get_mut(connection_id) {
                endpoint.permissions = permissions;
            }
            self.send_to(*connection_id, ServerMessage::PermissionsChanged { permissions });
        }

        info!(
            target: "mc.actor.meeting",
            meeting_id = %self.meeting_id,
            person_id = %person_id,
            connections = connections.len(),
            "Permissions updated"
        );
        Ok(())
    }

    async fn handle_remove(&mut self, actor: ConnectionId, person_id: &PersonId) -> Result<(), McError> {
        self.require_host(actor)?;

        let mut record = self.load_meeting().await?;
        if record.is_host(person_id) {
            return Err(McError::InvalidState("Cannot remove a host".to_string()));
        }

        let connections: Vec<ConnectionId> = self
            .identities
            .get(person_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        if !record.remove(person_id) && connections.is_empty() {
            return Err(McError::ParticipantNotFound(person_id.to_string()));
        }

        self.save_meeting(&record).await?;

        for connection_id in connections {
            self.send_to(connection_id, ServerMessage::Removed);
            self.depart(connection_id, CloseReason::Removed);
        }

        info!(
            target: "mc.actor.meeting",
            meeting_id = %self.meeting_id,
            person_id = %person_id,
            "Participant removed"
        );
        Ok(())
    }

    async fn handle_update_settings(
        &mut self,
        actor: ConnectionId,
        delta: &SettingsDelta,
    ) -> Result<(), McError> {
        self.require_host(actor)?;

        let mut record = self.load_meeting().await?;
        record.settings = record.settings.merged(delta);
        self.save_meeting(&record).await?;
        self.settings = record.settings;

        let message = ServerMessage::SettingsChanged {
            settings: self.settings,
        };
        let targets: Vec<ConnectionId> = self.admitted.iter().copied().collect();
        for target in targets {
            self.send_to(target, message.clone());
        }
        Ok(())
    }

    // ========================================================================
    // Signaling relay
    // ========================================================================

    fn relay_description(
        &mut self,
        from: ConnectionId,
        target: ConnectionId,
        description: SessionDescription,
    ) {
        let kind = match description.kind {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        };
        let Some(sender) = self.relay_sender(from, target, kind) else {
            return;
        };

        let message = match description.kind {
            SdpKind::Offer => ServerMessage::Offer {
                from,
                from_person: sender,
                description,
            },
            SdpKind::Answer => ServerMessage::Answer { from, description },
        };
        self.send_to(target, message);
        prom::record_signaling_relayed(kind, "relayed");
    }

    fn relay_candidate(&mut self, from: ConnectionId, target: ConnectionId, candidate: IceCandidate) {
        if self.relay_sender(from, target, "candidate").is_none() {
            return;
        }
        self.send_to(target, ServerMessage::Candidate { from, candidate });
        prom::record_signaling_relayed("candidate", "relayed");
    }

    /// Sender identity if both ends are admitted here; otherwise logs and counts the drop.
    fn relay_sender(&self, from: ConnectionId, target: ConnectionId, kind: &'static str) -> Option<Person> {
        let sender = self
            .endpoints
            .get(&from)
            .filter(|e| e.status == AdmissionStatus::Admitted);
        let target_admitted = from != target && self.admitted.contains(&target);

        match sender {
            Some(endpoint) if target_admitted => Some(endpoint.person.clone()),
            _ => {
                debug!(
                    target: "mc.actor.meeting",
                    meeting_id = %self.meeting_id,
                    from = %from,
                    target_connection = %target,
                    kind = kind,
                    "Dropping signaling message, endpoint not admitted"
                );
                prom::record_signaling_relayed(kind, "dropped");
                None
            }
        }
    }

    // ========================================================================
    // Chat relay
    // ========================================================================

    async fn handle_chat(
        &mut self,
        connection_id: ConnectionId,
        message_id: Option<Uuid>,
        text: String,
    ) -> Result<(), McError> {
        let author = self.require_admitted(connection_id)?.person.clone();

        let message = ChatMessage {
            seq: self.next_chat_seq,
            message_id,
            author,
            text,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        };
        self.next_chat_seq = self.next_chat_seq.saturating_add(1);

        let start = Instant::now();
        let persisted = self
            .store
            .append_chat_message(&self.meeting_id, &message)
            .await;
        prom::record_store_latency("append_chat_message", start.elapsed());
        if let Err(e) = persisted {
            warn!(
                target: "mc.actor.meeting",
                meeting_id = %self.meeting_id,
                seq = message.seq,
                error = %e,
                "Failed to persist chat message, delivering anyway"
            );
            prom::record_chat_persist_failure();
        }

        let targets: Vec<ConnectionId> = self.admitted.iter().copied().collect();
        let event = ServerMessage::Chat { message };
        for target in targets {
            self.send_to(target, event.clone());
        }
        Ok(())
    }

    async fn load_chat_history(&self) -> Vec<ChatMessage> {
        let start = Instant::now();
        let result = self
            .store
            .find_chat_history(&self.meeting_id, self.config.chat_history_limit)
            .await;
        prom::record_store_latency("find_chat_history", start.elapsed());

        result.unwrap_or_else(|e| {
            warn!(
                target: "mc.actor.meeting",
                meeting_id = %self.meeting_id,
                error = %e,
                "Failed to load chat history, sending empty history"
            );
            Vec::new()
        })
    }

    // ========================================================================
    // Departure
    // ========================================================================

    /// Remove an endpoint from every index and close its connection.
    ///
    /// Returns `false` if the endpoint was already gone.
    fn depart(&mut self, connection_id: ConnectionId, reason: CloseReason) -> bool {
        let Some(endpoint) = self.endpoints.remove(&connection_id) else {
            return false;
        };
        let was_admitted = self.admitted.remove(&connection_id);
        self.pending_announcements.remove(&connection_id);
        if let Some(connections) = self.identities.get_mut(&endpoint.person.id) {
            connections.remove(&connection_id);
            if connections.is_empty() {
                self.identities.remove(&endpoint.person.id);
            }
        }

        if was_admitted {
            let message = ServerMessage::PeerLeft {
                connection_id,
                person_id: endpoint.person.id.clone(),
            };
            let targets: Vec<ConnectionId> = self.admitted.iter().copied().collect();
            for target in targets {
                self.send_to(target, message.clone());
            }
        } else if endpoint.status == AdmissionStatus::Waiting && reason != CloseReason::Denied {
            let message = ServerMessage::AdmissionWithdrawn {
                person_id: endpoint.person.id.clone(),
                connection_id,
            };
            for host in self.admitted_hosts(None) {
                self.send_to(host, message.clone());
            }
        }

        endpoint.connection.close(reason);

        info!(
            target: "mc.actor.meeting",
            meeting_id = %self.meeting_id,
            connection_id = %connection_id,
            reason = reason.as_str(),
            was_admitted = was_admitted,
            remaining = self.endpoints.len(),
            "Endpoint departed"
        );
        true
    }

    /// Depart every connection that rejected an event since the last message.
    fn reap_evicted(&mut self) {
        while let Some(connection_id) = self.evicted.pop() {
            self.depart(connection_id, CloseReason::SlowConsumer);
        }
        self.maybe_request_collection();
    }

    fn maybe_request_collection(&mut self) {
        if !self.endpoints.is_empty() || self.is_shutting_down || self.collection_requested {
            return;
        }
        if let Some(controller) = self.controller.as_ref().and_then(mpsc::WeakSender::upgrade) {
            // Never block on the controller; the periodic sweep covers a full mailbox
            self.collection_requested = controller
                .try_send(ControllerMessage::RoomEmpty {
                    meeting_id: self.meeting_id.clone(),
                })
                .is_ok();
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn require_admitted(&self, connection_id: ConnectionId) -> Result<&Endpoint, McError> {
        self.endpoints
            .get(&connection_id)
            .filter(|e| e.status == AdmissionStatus::Admitted)
            .ok_or_else(|| McError::PermissionDenied("Not admitted to this meeting".to_string()))
    }

    fn require_host(&self, connection_id: ConnectionId) -> Result<&Endpoint, McError> {
        self.require_admitted(connection_id)
            .ok()
            .filter(|e| e.role.is_host())
            .ok_or_else(|| McError::PermissionDenied("Only a host can do that".to_string()))
    }

    /// Admitted host connections, optionally excluding one.
    fn admitted_hosts(&self, except: Option<ConnectionId>) -> Vec<ConnectionId> {
        self.admitted
            .iter()
            .copied()
            .filter(|id| Some(*id) != except)
            .filter(|id| self.endpoints.get(id).is_some_and(|e| e.role.is_host()))
            .collect()
    }

    fn waiting_connections_of(&self, person_id: &PersonId) -> Vec<ConnectionId> {
        self.identities
            .get(person_id)
            .into_iter()
            .flatten()
            .copied()
            .filter(|id| {
                self.endpoints
                    .get(id)
                    .is_some_and(|e| e.status == AdmissionStatus::Waiting)
            })
            .collect()
    }

    /// Every admitted endpoint except `connection_id`.
    fn roster_for(&self, connection_id: ConnectionId) -> Vec<PeerInfo> {
        self.admitted
            .iter()
            .filter(|id| **id != connection_id)
            .filter_map(|id| self.endpoints.get(id).map(|e| e.peer_info(*id)))
            .collect()
    }

    /// Queue an event for one connection. A rejected event marks it for eviction.
    fn send_to(&mut self, connection_id: ConnectionId, message: ServerMessage) {
        if let Some(endpoint) = self.endpoints.get(&connection_id) {
            if !endpoint.connection.send(message) {
                self.evicted.push(connection_id);
            }
        }
    }

    fn report_error(&mut self, connection_id: ConnectionId, operation: &'static str, err: &McError) {
        prom::record_error(operation, err.error_type_label(), err.status_code());
        warn!(
            target: "mc.actor.meeting",
            meeting_id = %self.meeting_id,
            connection_id = %connection_id,
            operation = operation,
            error = %err,
            "Failed to handle client message"
        );
        self.send_to(connection_id, err.to_server_message());
    }

    async fn load_meeting(&self) -> Result<MeetingRecord, McError> {
        let store = Arc::clone(&self.store);
        let meeting_id = self.meeting_id.clone();

        with_retry(self.config.store_retry, "find_meeting", || {
            let store = Arc::clone(&store);
            let meeting_id = meeting_id.clone();
            async move { store.find_meeting(&meeting_id).await }
        })
        .await?
        .ok_or_else(|| McError::MeetingNotFound(self.meeting_id.to_string()))
    }

    async fn save_meeting(&self, record: &MeetingRecord) -> Result<(), McError> {
        let store = Arc::clone(&self.store);

        with_retry(self.config.store_retry, "save_meeting", || {
            let store = Arc::clone(&store);
            let record = record.clone();
            async move { store.save_meeting(&record).await }
        })
        .await?;
        Ok(())
    }

    fn get_state(&self) -> MeetingState {
        let mut endpoints: Vec<EndpointInfo> = self
            .endpoints
            .iter()
            .map(|(id, e)| EndpointInfo {
                connection_id: *id,
                person: e.person.clone(),
                role: e.role,
                status: e.status,
                permissions: e.permissions,
                announced: e.announced,
            })
            .collect();
        endpoints.sort_by_key(|e| e.connection_id);

        let mut admitted: Vec<ConnectionId> = self.admitted.iter().copied().collect();
        admitted.sort();

        MeetingState {
            meeting_id: self.meeting_id.clone(),
            endpoints,
            admitted,
            next_chat_seq: self.next_chat_seq,
            mailbox_depth: self.receiver.len(),
            is_shutting_down: self.is_shutting_down,
        }
    }

    /// Check health of connection actors.
    async fn check_connection_health(&mut self) {
        let finished: Vec<ConnectionId> = self
            .endpoints
            .iter()
            .filter(|(_, e)| e.task_handle.is_finished())
            .map(|(id, _)| *id)
            .collect();

        let departed = !finished.is_empty();
        for connection_id in finished {
            let Some(endpoint) = self.endpoints.get_mut(&connection_id) else {
                continue;
            };
            match (&mut endpoint.task_handle).await {
                Ok(()) => {
                    debug!(
                        target: "mc.actor.meeting",
                        meeting_id = %self.meeting_id,
                        connection_id = %connection_id,
                        "Connection actor exited"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "mc.actor.meeting",
                            meeting_id = %self.meeting_id,
                            connection_id = %connection_id,
                            error = ?join_error,
                            "Connection actor panicked"
                        );
                        self.metrics.record_panic(ActorType::Connection);
                    }
                }
            }

            self.depart(connection_id, CloseReason::Left);
        }

        if departed || !self.evicted.is_empty() {
            self.reap_evicted();
        }
    }

    /// Perform graceful shutdown.
    async fn graceful_shutdown(&mut self) {
        info!(
            target: "mc.actor.meeting",
            meeting_id = %self.meeting_id,
            endpoints = self.endpoints.len(),
            "Performing graceful shutdown"
        );

        self.is_shutting_down = true;
        self.admitted.clear();
        self.pending_announcements.clear();
        self.identities.clear();

        for endpoint in self.endpoints.values() {
            endpoint.connection.close(CloseReason::Shutdown);
        }

        for (connection_id, endpoint) in self.endpoints.drain() {
            match tokio::time::timeout(Duration::from_secs(5), endpoint.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "mc.actor.meeting",
                        meeting_id = %self.meeting_id,
                        connection_id = %connection_id,
                        "Connection completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "mc.actor.meeting",
                        meeting_id = %self.meeting_id,
                        connection_id = %connection_id,
                        error = ?e,
                        "Connection task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "mc.actor.meeting",
                        meeting_id = %self.meeting_id,
                        connection_id = %connection_id,
                        "Connection shutdown timed out"
                    );
                }
            }
        }

        info!(
            target: "mc.actor.meeting",
            meeting_id = %self.meeting_id,
            "Graceful shutdown complete"
        );
    }
}
