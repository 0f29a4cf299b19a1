//! `MeetingControllerActor` - singleton supervisor for meeting actors.
//!
//! The `MeetingControllerActor` is the top-level actor and acts as the
//! process-wide session store:
//!
//! - Singleton per process
//! - Maps meeting id to a live `MeetingActor`, creating rooms lazily on the
//!   first join and collecting them once empty
//! - Routes every join (get-or-create plus enqueue in one serialized step), so
//!   a join never lands in a room that is being collected
//! - Never waits on a room: questions to rooms run in spawned tasks that post
//!   their answers back, so one slow room cannot hold up joins to others
//! - Owns the root `CancellationToken` for graceful shutdown
//! - Monitors child actor health (panic detection via `JoinHandle`)
//!
//! # Room collection
//!
//! A room that becomes empty sends `RoomEmpty`; the controller then asks the
//! room to close itself and the answer comes back as `RoomClosed`. The room
//! answers from inside its own loop, so a join queued ahead of the question
//! keeps it alive. Joins routed while the question is outstanding are held
//! and delivered once it is answered, either to the same room or to a fresh
//! one. A periodic sweep repeats the question for every room in case a
//! `RoomEmpty` was lost.
//!
//! # Graceful Shutdown
//!
//! On SIGTERM, the controller:
//! 1. Sets `accepting_new = false`
//! 2. Cancels the root `CancellationToken` (propagates to all children)
//! 3. Waits up to the shutdown deadline for rooms to close their connections

use crate::config::Config;
use crate::errors::McError;
use crate::store::MeetingStore;

use super::meeting::{MeetingActor, MeetingActorHandle, RoomConfig};
use super::messages::{ControllerMessage, ControllerStatus, JoinOutcome, JoinRequest, MeetingInfo};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use common::protocol::ServerMessage;
use common::types::{ConnectionId, MeetingId, Person};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the controller mailbox.
const CONTROLLER_CHANNEL_BUFFER: usize = 1000;

/// Default time allowed for rooms to finish during shutdown.
const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Controller tunables, derived from [`Config`].
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub mc_id: String,
    pub max_meetings: usize,
    pub room_sweep_interval: Duration,
    pub room: RoomConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            mc_id: "mc-test".to_string(),
            max_meetings: 1000,
            room_sweep_interval: Duration::from_secs(300),
            room: RoomConfig::default(),
        }
    }
}

impl ControllerConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            mc_id: config.mc_id.clone(),
            max_meetings: config.max_meetings as usize,
            room_sweep_interval: config.room_sweep_interval,
            room: RoomConfig::from_config(config),
        }
    }
}

/// Handle to the `MeetingControllerActor`.
///
/// This is the public interface for interacting with the controller.
/// All methods are async and return results via oneshot channels.
#[derive(Clone, Debug)]
pub struct MeetingControllerActorHandle {
    sender: mpsc::Sender<ControllerMessage>,
    cancel_token: CancellationToken,
}

impl MeetingControllerActorHandle {
    /// Create a new `MeetingControllerActor` and return a handle to it.
    ///
    /// This spawns the actor task and returns immediately.
    #[must_use]
    pub fn new(
        config: ControllerConfig,
        store: Arc<dyn MeetingStore>,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(CONTROLLER_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = MeetingControllerActor::new(
            config,
            receiver,
            sender.downgrade(),
            cancel_token.clone(),
            store,
            metrics,
        );

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Join a connection into the room for `meeting_id`, creating the room if needed.
    ///
    /// Returns the room handle for post-join messages together with the
    /// admission outcome.
    pub async fn join(
        &self,
        meeting_id: MeetingId,
        connection_id: ConnectionId,
        person: Person,
        outbound: mpsc::Sender<ServerMessage>,
        transport_token: CancellationToken,
    ) -> Result<(MeetingActorHandle, JoinOutcome), McError> {
        let (join_tx, join_rx) = tokio::sync::oneshot::channel();
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(ControllerMessage::RouteJoin {
                meeting_id,
                request: JoinRequest {
                    connection_id,
                    person,
                    outbound,
                    transport_token,
                    respond_to: join_tx,
                },
                respond_to: tx,
            })
            .await
            .map_err(|e| McError::Internal(format!("channel send failed: {e}")))?;

        let room = rx
            .await
            .map_err(|e| McError::Internal(format!("response receive failed: {e}")))??;

        let outcome = join_rx
            .await
            .map_err(|e| McError::Internal(format!("response receive failed: {e}")))??;

        Ok((room, outcome))
    }

    /// Get information about a live room.
    pub async fn get_meeting(&self, meeting_id: MeetingId) -> Result<MeetingInfo, McError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(ControllerMessage::GetMeeting {
                meeting_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| McError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| McError::Internal(format!("response receive failed: {e}")))?
    }

    /// Get the current controller status.
    pub async fn get_status(&self) -> Result<ControllerStatus, McError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(ControllerMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| McError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| McError::Internal(format!("response receive failed: {e}")))
    }

    /// Initiate graceful shutdown.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), McError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(ControllerMessage::Shutdown {
                deadline,
                respond_to: tx,
            })
            .await
            .map_err(|e| McError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| McError::Internal(format!("response receive failed: {e}")))?
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// A join waiting for a close question to be answered.
type HeldJoin = (JoinRequest, oneshot::Sender<Result<MeetingActorHandle, McError>>);

/// Internal state for a managed meeting.
struct ManagedMeeting {
    handle: MeetingActorHandle,
    task_handle: JoinHandle<()>,
    /// Room creation timestamp (unix seconds).
    created_at: i64,
    /// Tells this room apart from earlier rooms with the same meeting id.
    generation: u64,
    /// A close question is outstanding.
    closing: bool,
    held_joins: Vec<HeldJoin>,
}

/// The `MeetingControllerActor` implementation.
pub struct MeetingControllerActor {
    mc_id: String,
    config: ControllerConfig,
    receiver: mpsc::Receiver<ControllerMessage>,
    /// Handed to rooms so they can report emptiness without keeping the mailbox open.
    self_sender: mpsc::WeakSender<ControllerMessage>,
    /// Cancellation token (root).
    cancel_token: CancellationToken,
    store: Arc<dyn MeetingStore>,
    meetings: HashMap<MeetingId, ManagedMeeting>,
    /// Whether the controller is accepting new joins.
    accepting_new: bool,
    shutdown_deadline: Duration,
    next_generation: u64,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl MeetingControllerActor {
    fn new(
        config: ControllerConfig,
        receiver: mpsc::Receiver<ControllerMessage>,
        self_sender: mpsc::WeakSender<ControllerMessage>,
        cancel_token: CancellationToken,
        store: Arc<dyn MeetingStore>,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let mailbox = MailboxMonitor::new(
            ActorType::Controller,
            config.mc_id.as_str(),
            CONTROLLER_CHANNEL_BUFFER,
        );

        Self {
            mc_id: config.mc_id.clone(),
            config,
            receiver,
            self_sender,
            cancel_token,
            store,
            meetings: HashMap::new(),
            accepting_new: true,
            shutdown_deadline: DEFAULT_SHUTDOWN_DEADLINE,
            next_generation: 0,
            metrics,
            mailbox,
        }
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "mc.actor.controller", fields(mc_id = %self.mc_id))]
    async fn run(mut self) {
        info!(
            target: "mc.actor.controller",
            mc_id = %self.mc_id,
            "MeetingControllerActor started"
        );

        let mut sweep = tokio::time::interval(self.config.room_sweep_interval);
        // The first tick completes immediately
        sweep.tick().await;

        loop {
            // Check for terminated meeting actors
            self.check_meeting_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "mc.actor.controller",
                        mc_id = %self.mc_id,
                        "MeetingControllerActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                _ = sweep.tick() => {
                    self.sweep_empty_rooms();
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.handle_message(message).await;
                            self.mailbox.observe(self.receiver.len());
                        }
                        None => {
                            info!(
                                target: "mc.actor.controller",
                                mc_id = %self.mc_id,
                                "MeetingControllerActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "mc.actor.controller",
            mc_id = %self.mc_id,
            meetings_remaining = self.meetings.len(),
            messages_processed = self.mailbox.messages_processed(),
            "MeetingControllerActor stopped"
        );
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: ControllerMessage) {
        match message {
            ControllerMessage::RouteJoin {
                meeting_id,
                request,
                respond_to,
            } => {
                self.route_join(meeting_id, request, respond_to);
            }

            ControllerMessage::RoomEmpty { meeting_id } => {
                self.collect_if_empty(&meeting_id);
            }

            ControllerMessage::RoomClosed {
                meeting_id,
                generation,
                closed,
            } => {
                self.on_room_closed(&meeting_id, generation, closed);
            }

            ControllerMessage::GetMeeting {
                meeting_id,
                respond_to,
            } => {
                self.get_meeting(meeting_id, respond_to);
            }

            ControllerMessage::GetStatus { respond_to } => {
                let status = self.get_status();
                let _ = respond_to.send(status);
            }

            ControllerMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                let result = self.initiate_shutdown(deadline);
                let _ = respond_to.send(result);
            }
        }
    }

    /// Get-or-create the room and enqueue the join into it.
    ///
    /// Joins for a room with an outstanding close question are held until the
    /// question is answered.
    fn route_join(
        &mut self,
        meeting_id: MeetingId,
        request: JoinRequest,
        respond_to: oneshot::Sender<Result<MeetingActorHandle, McError>>,
    ) {
        if !self.accepting_new {
            let _ = respond_to.send(Err(McError::Draining));
            return;
        }

        let stale = self
            .meetings
            .get(&meeting_id)
            .is_some_and(|m| m.handle.is_cancelled() || m.task_handle.is_finished());
        if stale {
            self.remove_meeting(&meeting_id);
        }

        if let Some(managed) = self.meetings.get_mut(&meeting_id) {
            if managed.closing {
                debug!(
                    target: "mc.actor.controller",
                    mc_id = %self.mc_id,
                    meeting_id = %meeting_id,
                    "Close question outstanding, holding join"
                );
                managed.held_joins.push((request, respond_to));
                return;
            }
        }

        let handle = match self.meetings.get(&meeting_id) {
            Some(managed) => managed.handle.clone(),
            None => match self.create_meeting(meeting_id) {
                Ok(handle) => handle,
                Err(e) => {
                    let _ = respond_to.send(Err(e));
                    return;
                }
            },
        };

        let result = handle.try_enqueue_join(request).map(|()| handle);
        let _ = respond_to.send(result);
    }

    /// Create a new meeting actor.
    fn create_meeting(&mut self, meeting_id: MeetingId) -> Result<MeetingActorHandle, McError> {
        if self.meetings.len() >= self.config.max_meetings {
            warn!(
                target: "mc.actor.controller",
                mc_id = %self.mc_id,
                max_meetings = self.config.max_meetings,
                "Meeting capacity reached, rejecting new room"
            );
            return Err(McError::McCapacityExceeded);
        }

        debug!(
            target: "mc.actor.controller",
            mc_id = %self.mc_id,
            meeting_id = %meeting_id,
            "Creating new meeting actor"
        );

        let (handle, task_handle) = MeetingActor::spawn(
            meeting_id.clone(),
            Arc::clone(&self.store),
            self.config.room,
            Some(self.self_sender.clone()),
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );

        self.next_generation += 1;
        self.meetings.insert(
            meeting_id.clone(),
            ManagedMeeting {
                handle: handle.clone(),
                task_handle,
                created_at: chrono::Utc::now().timestamp(),
                generation: self.next_generation,
                closing: false,
                held_joins: Vec::new(),
            },
        );

        self.metrics.meeting_created();

        info!(
            target: "mc.actor.controller",
            mc_id = %self.mc_id,
            meeting_id = %meeting_id,
            total_meetings = self.meetings.len(),
            "Meeting actor created"
        );

        Ok(handle)
    }

    /// Ask a room, from a spawned task, to close if it has no endpoints.
    fn collect_if_empty(&mut self, meeting_id: &MeetingId) {
        let Some(managed) = self.meetings.get_mut(meeting_id) else {
            return;
        };
        if managed.closing {
            return;
        }
        managed.closing = true;

        let handle = managed.handle.clone();
        let generation = managed.generation;
        let meeting_id = meeting_id.clone();
        let controller = self.self_sender.clone();
        let mc_id = self.mc_id.clone();
        tokio::spawn(async move {
            let closed = match handle.close_if_empty().await {
                Ok(closed) => closed,
                Err(e) => {
                    debug!(
                        target: "mc.actor.controller",
                        mc_id = %mc_id,
                        meeting_id = %meeting_id,
                        error = %e,
                        "Room unreachable, removing"
                    );
                    true
                }
            };
            if let Some(controller) = controller.upgrade() {
                let _ = controller
                    .send(ControllerMessage::RoomClosed {
                        meeting_id,
                        generation,
                        closed,
                    })
                    .await;
            }
        });
    }

    /// Apply a close answer and release the joins it held.
    fn on_room_closed(&mut self, meeting_id: &MeetingId, generation: u64, closed: bool) {
        let Some(managed) = self.meetings.get_mut(meeting_id) else {
            return;
        };
        if managed.generation != generation {
            // Answer from a room that has already been replaced
            return;
        }
        managed.closing = false;

        if closed {
            debug!(
                target: "mc.actor.controller",
                mc_id = %self.mc_id,
                meeting_id = %meeting_id,
                "Collecting empty room"
            );
            self.remove_meeting(meeting_id);
        } else {
            let held = std::mem::take(&mut managed.held_joins);
            self.release_held_joins(meeting_id, held);
        }
    }

    fn release_held_joins(&mut self, meeting_id: &MeetingId, held: Vec<HeldJoin>) {
        for (request, respond_to) in held {
            self.route_join(meeting_id.clone(), request, respond_to);
        }
    }

    /// Periodic safety net for rooms whose `RoomEmpty` was never delivered.
    fn sweep_empty_rooms(&mut self) {
        let meeting_ids: Vec<MeetingId> = self.meetings.keys().cloned().collect();
        for meeting_id in &meeting_ids {
            self.collect_if_empty(meeting_id);
        }

        debug!(
            target: "mc.actor.controller",
            mc_id = %self.mc_id,
            asked = meeting_ids.len(),
            "Room sweep started"
        );
    }

    /// Answer with information about a meeting from a spawned task.
    fn get_meeting(
        &self,
        meeting_id: MeetingId,
        respond_to: oneshot::Sender<Result<MeetingInfo, McError>>,
    ) {
        let Some(managed) = self.meetings.get(&meeting_id) else {
            let _ = respond_to.send(Err(McError::MeetingNotFound(meeting_id.to_string())));
            return;
        };

        let handle = managed.handle.clone();
        let created_at = managed.created_at;
        let mc_id = self.mc_id.clone();
        tokio::spawn(async move {
            let info = match handle.get_state().await {
                Ok(state) => MeetingInfo {
                    meeting_id,
                    endpoint_count: state.endpoints.len(),
                    admitted_count: state.admitted.len(),
                    created_at,
                },
                Err(_) => {
                    // Meeting actor may have shut down - return cached info
                    warn!(
                        target: "mc.actor.controller",
                        mc_id = %mc_id,
                        meeting_id = %meeting_id,
                        "Failed to query meeting actor state, returning cached info"
                    );
                    MeetingInfo {
                        meeting_id,
                        endpoint_count: 0,
                        admitted_count: 0,
                        created_at,
                    }
                }
            };
            let _ = respond_to.send(Ok(info));
        });
    }

    /// Forget a room and let its task finish in the background.
    ///
    /// Joins held for the room are routed again, which starts a fresh room.
    fn remove_meeting(&mut self, meeting_id: &MeetingId) {
        let Some(mut managed) = self.meetings.remove(meeting_id) else {
            return;
        };
        let held = std::mem::take(&mut managed.held_joins);

        managed.handle.cancel();

        // Don't block the message loop waiting for the room to finish
        let meeting_id_owned = meeting_id.clone();
        let mc_id = self.mc_id.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(Duration::from_secs(5), managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "mc.actor.controller",
                        mc_id = %mc_id,
                        meeting_id = %meeting_id_owned,
                        "Meeting actor task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "mc.actor.controller",
                        mc_id = %mc_id,
                        meeting_id = %meeting_id_owned,
                        error = ?e,
                        "Meeting actor task panicked during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "mc.actor.controller",
                        mc_id = %mc_id,
                        meeting_id = %meeting_id_owned,
                        "Meeting actor task cleanup timed out"
                    );
                }
            }
        });

        self.metrics.meeting_removed();

        info!(
            target: "mc.actor.controller",
            mc_id = %self.mc_id,
            meeting_id = %meeting_id,
            total_meetings = self.meetings.len(),
            "Meeting actor removed"
        );

        self.release_held_joins(meeting_id, held);
    }

    /// Get current controller status.
    fn get_status(&self) -> ControllerStatus {
        ControllerStatus {
            meeting_count: self.meetings.len(),
            connection_count: self.metrics.connection_count(),
            is_draining: !self.accepting_new,
            mailbox_depth: self.receiver.len(),
        }
    }

    /// Initiate graceful shutdown.
    fn initiate_shutdown(&mut self, deadline: Duration) -> Result<(), McError> {
        info!(
            target: "mc.actor.controller",
            mc_id = %self.mc_id,
            meeting_count = self.meetings.len(),
            deadline_secs = deadline.as_secs(),
            "Initiating graceful shutdown"
        );

        self.accepting_new = false;
        self.shutdown_deadline = deadline;

        // Cancel the root token (propagates to all children)
        self.cancel_token.cancel();

        Ok(())
    }

    /// Perform graceful shutdown.
    async fn graceful_shutdown(&mut self) {
        info!(
            target: "mc.actor.controller",
            mc_id = %self.mc_id,
            meeting_count = self.meetings.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;

        // Already done via parent token, but be explicit
        for managed in self.meetings.values() {
            managed.handle.cancel();
        }

        let deadline = tokio::time::Instant::now() + self.shutdown_deadline;
        for (meeting_id, managed) in self.meetings.drain() {
            match tokio::time::timeout_at(deadline, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "mc.actor.controller",
                        mc_id = %self.mc_id,
                        meeting_id = %meeting_id,
                        "Meeting actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "mc.actor.controller",
                        mc_id = %self.mc_id,
                        meeting_id = %meeting_id,
                        error = ?e,
                        "Meeting actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "mc.actor.controller",
                        mc_id = %self.mc_id,
                        meeting_id = %meeting_id,
                        "Meeting actor shutdown timed out"
                    );
                }
            }
            self.metrics.meeting_removed();
        }

        info!(
            target: "mc.actor.controller",
            mc_id = %self.mc_id,
            "Graceful shutdown complete"
        );
    }

    /// Check health of managed meeting actors.
    async fn check_meeting_health(&mut self) {
        let finished: Vec<MeetingId> = self
            .meetings
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(meeting_id, _)| meeting_id.clone())
            .collect();

        for meeting_id in finished {
            if let Some(mut managed) = self.meetings.remove(&meeting_id) {
                let held = std::mem::take(&mut managed.held_joins);
                match managed.task_handle.await {
                    Ok(()) => {
                        info!(
                            target: "mc.actor.controller",
                            mc_id = %self.mc_id,
                            meeting_id = %meeting_id,
                            "Meeting actor exited"
                        );
                    }
                    Err(join_error) => {
                        if join_error.is_panic() {
                            error!(
                                target: "mc.actor.controller",
                                mc_id = %self.mc_id,
                                meeting_id = %meeting_id,
                                error = ?join_error,
                                "Meeting actor panicked - triggering investigation"
                            );
                            self.metrics.record_panic(ActorType::Meeting);
                        }
                    }
                }

                self.metrics.meeting_removed();
                self.release_held_joins(&meeting_id, held);
            }
        }
    }
}
