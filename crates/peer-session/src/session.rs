//! `PeerSessionActor` - one participant's view of a meeting.
//!
//! The session consumes the coordinator's event stream and owns:
//! - one `LinkActor` per remote connection it is negotiating with
//! - the pending negotiation queue, used while local media is not ready
//! - local media and the permissions that gate it
//! - the chat log
//!
//! # Negotiation rules
//!
//! - `roster`: queue every listed peer, then send `roster-ack`. The queue is
//!   drained with the negotiation stagger, so the newcomer offers to the
//!   room one peer at a time.
//! - `peer-joined`: remember the peer and wait for its offer. The newcomer
//!   always initiates.
//! - `peer-left`: tear the link down and forget any pending entry.
//! - Incoming offer while our own offer to the same remote is in flight:
//!   the side with the greater connection id keeps its offer, the other
//!   abandons its link and answers. Any other incoming offer supersedes the
//!   existing link.
//!
//! Application-facing notifications are [`PeerEvent`]s.

use crate::chat::{ChatLog, Received};
use crate::config::PeerConfig;
use crate::engine::{LocalMedia, LocalTrack, MediaEngine, RemoteTrack};
use crate::errors::PeerError;
use crate::link::{LinkActor, LinkCommand, LinkHandle, LinkReport, LinkSetup, LinkState, LinkUpdate};

use common::protocol::{
    ChatMessage, ClientMessage, ErrorKind, IceCandidate, PeerInfo, ServerMessage,
    SessionDescription,
};
use common::types::{
    AdmissionStatus, ConnectionId, MeetingId, MeetingSettings, Permissions, Person, PersonId,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Channel buffer size for the session mailbox.
const SESSION_CHANNEL_BUFFER: usize = 64;

/// Channel buffer size for application events.
const EVENT_CHANNEL_BUFFER: usize = 256;

/// Notifications for the application.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Waiting,
    Admitted {
        connection_id: ConnectionId,
        is_host: bool,
        permissions: Permissions,
        settings: MeetingSettings,
    },
    Denied,
    Removed,
    /// Host only.
    AdmissionRequest {
        person_id: PersonId,
        name: String,
        connection_id: ConnectionId,
    },
    /// Host only.
    AdmissionResolved {
        person_id: PersonId,
        connection_id: ConnectionId,
        status: AdmissionStatus,
    },
    /// Host only. The waiting connection left before a decision.
    AdmissionWithdrawn {
        person_id: PersonId,
        connection_id: ConnectionId,
    },
    PeerJoined(PeerInfo),
    PeerLeft {
        connection_id: ConnectionId,
        person_id: PersonId,
    },
    LinkConnected {
        remote: ConnectionId,
    },
    LinkClosed {
        remote: ConnectionId,
        state: LinkState,
    },
    RemoteTrack {
        remote: ConnectionId,
        track: RemoteTrack,
    },
    /// A message not shown before (history, or someone else's message).
    Chat(ChatMessage),
    PermissionsChanged(Permissions),
    SettingsChanged(MeetingSettings),
    ScreenShare {
        granted: bool,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
    /// The signaling connection is gone.
    Disconnected,
}

/// One link as seen from the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub remote: ConnectionId,
    pub person: Option<Person>,
    pub state: LinkState,
    /// We sent the offer.
    pub outbound: bool,
}

/// Snapshot of a session (for tests and debugging).
#[derive(Debug, Clone)]
pub struct SessionState {
    pub connection_id: Option<ConnectionId>,
    pub admission: AdmissionStatus,
    pub is_host: bool,
    pub permissions: Permissions,
    /// Sorted by remote connection id.
    pub links: Vec<LinkInfo>,
    pub pending: Vec<ConnectionId>,
    pub chat: Vec<ChatMessage>,
    pub screen_sharing: bool,
}

impl SessionState {
    #[must_use]
    pub fn link(&self, remote: ConnectionId) -> Option<&LinkInfo> {
        self.links.iter().find(|l| l.remote == remote)
    }
}

enum SessionMessage {
    Join {
        meeting_id: MeetingId,
        respond_to: oneshot::Sender<Result<(), PeerError>>,
    },
    SetLocalMedia {
        media: LocalMedia,
    },
    Initiate {
        remote: ConnectionId,
        person: Option<Person>,
    },
    SetMicrophone {
        enabled: bool,
        respond_to: oneshot::Sender<bool>,
    },
    SetCamera {
        enabled: bool,
        respond_to: oneshot::Sender<bool>,
    },
    StartScreenShare {
        track: LocalTrack,
        respond_to: oneshot::Sender<Result<(), PeerError>>,
    },
    StopScreenShare,
    SendChat {
        text: String,
        respond_to: oneshot::Sender<Result<ChatMessage, PeerError>>,
    },
    Control {
        message: ClientMessage,
        respond_to: oneshot::Sender<Result<(), PeerError>>,
    },
    GetState {
        respond_to: oneshot::Sender<SessionState>,
    },
    Leave {
        respond_to: oneshot::Sender<Result<(), PeerError>>,
    },
}

/// Handle to a `PeerSessionActor`.
#[derive(Clone, Debug)]
pub struct PeerSessionHandle {
    sender: mpsc::Sender<SessionMessage>,
    cancel_token: CancellationToken,
}

impl PeerSessionHandle {
    /// Spawn a session for `person`.
    ///
    /// `signaling` carries messages to the coordinator and `inbound` yields
    /// its events. Returns the handle and the application event stream.
    pub fn new(
        config: PeerConfig,
        person: Person,
        engine: Arc<dyn MediaEngine>,
        signaling: mpsc::Sender<ClientMessage>,
        inbound: mpsc::Receiver<ServerMessage>,
    ) -> (Self, mpsc::Receiver<PeerEvent>) {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);
        let (events_tx, events) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        let (reports_tx, reports) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();

        let actor = PeerSessionActor {
            config,
            person,
            engine,
            signaling,
            inbound: Some(inbound),
            receiver,
            reports,
            reports_tx,
            events: events_tx,
            cancel_token: cancel_token.clone(),
            connection_id: None,
            admission: AdmissionStatus::Pending,
            is_host: false,
            permissions: Permissions::default(),
            local_media: None,
            screen: None,
            requested_screen: None,
            links: HashMap::new(),
            peers: HashMap::new(),
            pending: VecDeque::new(),
            drain_at: None,
            chat: ChatLog::new(),
            next_link_id: 0,
        };
        tokio::spawn(actor.run());

        (
            Self {
                sender,
                cancel_token,
            },
            events,
        )
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionMessage,
    ) -> Result<T, PeerError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| PeerError::Closed)?;
        rx.await.map_err(|_| PeerError::Closed)
    }

    async fn notify(&self, message: SessionMessage) -> Result<(), PeerError> {
        self.sender.send(message).await.map_err(|_| PeerError::Closed)
    }

    /// Ask the coordinator to join `meeting_id`.
    pub async fn join(&self, meeting_id: MeetingId) -> Result<(), PeerError> {
        self.request(|respond_to| SessionMessage::Join {
            meeting_id,
            respond_to,
        })
        .await?
    }

    /// Local media became available (or changed). Drains the pending queue.
    pub async fn set_local_media(&self, media: LocalMedia) -> Result<(), PeerError> {
        self.notify(SessionMessage::SetLocalMedia { media }).await
    }

    /// Start negotiating with `remote`. No-op if a link already exists.
    pub async fn initiate(
        &self,
        remote: ConnectionId,
        person: Option<Person>,
    ) -> Result<(), PeerError> {
        self.notify(SessionMessage::Initiate { remote, person }).await
    }

    /// Returns whether the microphone is now enabled.
    pub async fn set_microphone_enabled(&self, enabled: bool) -> Result<bool, PeerError> {
        self.request(|respond_to| SessionMessage::SetMicrophone {
            enabled,
            respond_to,
        })
        .await
    }

    /// Returns whether the camera is now enabled.
    pub async fn set_camera_enabled(&self, enabled: bool) -> Result<bool, PeerError> {
        self.request(|respond_to| SessionMessage::SetCamera {
            enabled,
            respond_to,
        })
        .await
    }

    /// Ask the coordinator for permission, then send `track` instead of the camera.
    pub async fn start_screen_share(&self, track: LocalTrack) -> Result<(), PeerError> {
        self.request(|respond_to| SessionMessage::StartScreenShare { track, respond_to })
            .await?
    }

    /// Restore the camera on every link.
    pub async fn stop_screen_share(&self) -> Result<(), PeerError> {
        self.notify(SessionMessage::StopScreenShare).await
    }

    /// Send a chat message. Returns the optimistic copy.
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<ChatMessage, PeerError> {
        let text = text.into();
        self.request(|respond_to| SessionMessage::SendChat { text, respond_to })
            .await?
    }

    /// Send a host control or other raw message to the coordinator.
    pub async fn send_control(&self, message: ClientMessage) -> Result<(), PeerError> {
        self.request(|respond_to| SessionMessage::Control {
            message,
            respond_to,
        })
        .await?
    }

    pub async fn get_state(&self) -> Result<SessionState, PeerError> {
        self.request(|respond_to| SessionMessage::GetState { respond_to })
            .await
    }

    /// Leave the meeting and stop the session.
    pub async fn leave(&self) -> Result<(), PeerError> {
        self.request(|respond_to| SessionMessage::Leave { respond_to })
            .await?
    }

    /// Cancel the session. Every link is closed.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

struct LinkEntry {
    handle: LinkHandle,
    person: Option<Person>,
    state: LinkState,
    outbound: bool,
    /// Opened before local media existed, so nothing was attached.
    bare: bool,
}

struct PendingNegotiation {
    remote: ConnectionId,
    person: Option<Person>,
}

struct PeerSessionActor {
    config: PeerConfig,
    person: Person,
    engine: Arc<dyn MediaEngine>,
    signaling: mpsc::Sender<ClientMessage>,
    /// `None` once the coordinator connection has closed.
    inbound: Option<mpsc::Receiver<ServerMessage>>,
    receiver: mpsc::Receiver<SessionMessage>,
    reports: mpsc::UnboundedReceiver<LinkReport>,
    reports_tx: mpsc::UnboundedSender<LinkReport>,
    events: mpsc::Sender<PeerEvent>,
    cancel_token: CancellationToken,

    connection_id: Option<ConnectionId>,
    admission: AdmissionStatus,
    is_host: bool,
    permissions: Permissions,

    local_media: Option<LocalMedia>,
    /// Track currently sent instead of the camera.
    screen: Option<LocalTrack>,
    /// Track waiting for the coordinator's screen-share decision.
    requested_screen: Option<LocalTrack>,

    links: HashMap<ConnectionId, LinkEntry>,
    /// Identities learned from roster, presence and offers.
    peers: HashMap<ConnectionId, Person>,
    pending: VecDeque<PendingNegotiation>,
    /// When the next pending negotiation starts.
    drain_at: Option<Instant>,
    chat: ChatLog,
    next_link_id: u64,
}

async fn recv_inbound(inbound: &mut Option<mpsc::Receiver<ServerMessage>>) -> Option<ServerMessage> {
    match inbound {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl PeerSessionActor {
    #[instrument(skip_all, name = "peer.session")]
    async fn run(mut self) {
        info!(
            target: "peer.session",
            person_id = %self.person.id,
            ice_servers = self.config.ice_servers.len(),
            "PeerSession started"
        );

        loop {
            tokio::select! {
                // Link reports go before inbound signaling so glare checks
                // see every state change a link has already made.
                biased;

                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "peer.session",
                        person_id = %self.person.id,
                        "PeerSession received cancellation signal"
                    );
                    break;
                }

                Some(report) = self.reports.recv() => {
                    self.handle_report(report);
                }

                message = self.receiver.recv() => {
                    match message {
                        Some(message) => {
                            if self.handle_message(message).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                event = recv_inbound(&mut self.inbound) => {
                    match event {
                        Some(event) => self.handle_server_message(event).await,
                        None => self.on_signaling_closed(),
                    }
                }

                () = sleep_until(self.drain_at) => {
                    self.drain_next().await;
                }
            }
        }

        self.teardown_all();
        info!(
            target: "peer.session",
            person_id = %self.person.id,
            "PeerSession stopped"
        );
    }

    /// Handle one application request. Returns true if the session should stop.
    async fn handle_message(&mut self, message: SessionMessage) -> bool {
        match message {
            SessionMessage::Join {
                meeting_id,
                respond_to,
            } => {
                let result = self
                    .signal(ClientMessage::Join {
                        meeting_id,
                        person: self.person.clone(),
                    })
                    .await;
                let _ = respond_to.send(result);
            }

            SessionMessage::SetLocalMedia { media } => {
                self.local_media = Some(media);
                self.enforce_permissions();
                self.reoffer_bare_links();
                let video = self.outbound_video();
                self.broadcast_video(video).await;
                self.schedule_drain();
            }

            SessionMessage::Initiate { remote, person } => {
                self.initiate(remote, person).await;
            }

            SessionMessage::SetMicrophone {
                enabled,
                respond_to,
            } => {
                let allowed = self.permissions.can_unmute;
                let track = self.local_media.as_ref().and_then(|m| m.audio.as_ref());
                let _ = respond_to.send(set_track_enabled(track, enabled && allowed));
            }

            SessionMessage::SetCamera {
                enabled,
                respond_to,
            } => {
                let allowed = self.permissions.can_enable_video;
                let track = self.local_media.as_ref().and_then(|m| m.video.as_ref());
                let _ = respond_to.send(set_track_enabled(track, enabled && allowed));
            }

            SessionMessage::StartScreenShare { track, respond_to } => {
                self.requested_screen = Some(track);
                let result = self.signal(ClientMessage::RequestScreenShare).await;
                let _ = respond_to.send(result);
            }

            SessionMessage::StopScreenShare => {
                self.stop_screen_share().await;
            }

            SessionMessage::SendChat { text, respond_to } => {
                let message = self.chat.optimistic(self.person.clone(), text);
                let result = self
                    .signal(ClientMessage::Chat {
                        message_id: message.message_id,
                        text: message.text.clone(),
                    })
                    .await
                    .map(|()| message);
                let _ = respond_to.send(result);
            }

            SessionMessage::Control {
                message,
                respond_to,
            } => {
                let result = self.signal(message).await;
                let _ = respond_to.send(result);
            }

            SessionMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }

            SessionMessage::Leave { respond_to } => {
                let result = self.signal(ClientMessage::Leave).await;
                let _ = respond_to.send(result);
                return true;
            }
        }
        false
    }

    async fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Joined {
                connection_id,
                is_host,
                permissions,
                settings,
            } => {
                self.connection_id = Some(connection_id);
                self.admission = AdmissionStatus::Admitted;
                self.is_host = is_host;
                self.apply_permissions(permissions).await;
                self.emit(PeerEvent::Admitted {
                    connection_id,
                    is_host,
                    permissions,
                    settings,
                });
            }

            ServerMessage::Waiting => {
                self.admission = AdmissionStatus::Waiting;
                self.emit(PeerEvent::Waiting);
            }

            ServerMessage::Denied => {
                self.admission = AdmissionStatus::Denied;
                self.teardown_all();
                self.emit(PeerEvent::Denied);
            }

            ServerMessage::Removed => {
                self.teardown_all();
                self.emit(PeerEvent::Removed);
            }

            ServerMessage::AdmissionRequest {
                person_id,
                name,
                connection_id,
            } => self.emit(PeerEvent::AdmissionRequest {
                person_id,
                name,
                connection_id,
            }),

            ServerMessage::AdmissionResolved {
                person_id,
                connection_id,
                status,
            } => self.emit(PeerEvent::AdmissionResolved {
                person_id,
                connection_id,
                status,
            }),

            ServerMessage::AdmissionWithdrawn {
                person_id,
                connection_id,
            } => self.emit(PeerEvent::AdmissionWithdrawn {
                person_id,
                connection_id,
            }),

            ServerMessage::ChatHistory { messages } => {
                for message in self.chat.load_history(messages) {
                    self.emit(PeerEvent::Chat(message));
                }
            }

            ServerMessage::Roster { peers } => {
                // We are the newcomer: we offer to everyone already present
                for peer in peers {
                    self.peers.insert(peer.connection_id, peer.person.clone());
                    self.enqueue(peer.connection_id, Some(peer.person));
                }
                self.schedule_drain();
                if let Err(e) = self.signal(ClientMessage::RosterAck).await {
                    self.on_signaling_error(&e);
                }
            }

            ServerMessage::PeerJoined { peer } => {
                // The newcomer offers to us once it has the roster
                self.peers.insert(peer.connection_id, peer.person.clone());
                self.emit(PeerEvent::PeerJoined(peer));
            }

            ServerMessage::PeerLeft {
                connection_id,
                person_id,
            } => {
                self.peers.remove(&connection_id);
                self.pending.retain(|p| p.remote != connection_id);
                self.teardown(connection_id);
                self.emit(PeerEvent::PeerLeft {
                    connection_id,
                    person_id,
                });
            }

            ServerMessage::Offer {
                from,
                from_person,
                description,
            } => {
                self.on_incoming_offer(from, from_person, description).await;
            }

            ServerMessage::Answer { from, description } => {
                self.on_incoming_answer(from, description).await;
            }

            ServerMessage::Candidate { from, candidate } => {
                self.on_incoming_candidate(from, candidate).await;
            }

            ServerMessage::PermissionsChanged { permissions } => {
                self.apply_permissions(permissions).await;
                self.emit(PeerEvent::PermissionsChanged(permissions));
            }

            ServerMessage::SettingsChanged { settings } => {
                self.emit(PeerEvent::SettingsChanged(settings));
            }

            ServerMessage::ScreenShareDecision { granted } => {
                match self.requested_screen.take() {
                    Some(track) if granted => {
                        self.screen = Some(track.clone());
                        self.broadcast_video(Some(track)).await;
                    }
                    _ => {}
                }
                self.emit(PeerEvent::ScreenShare { granted });
            }

            ServerMessage::Chat { message } => match self.chat.receive(message.clone()) {
                Received::New => self.emit(PeerEvent::Chat(message)),
                Received::Confirmed | Received::Duplicate => {}
            },

            ServerMessage::Error {
                kind,
                code,
                message,
            } => {
                debug!(
                    target: "peer.session",
                    kind = ?kind,
                    code = code,
                    "Coordinator reported an error"
                );
                self.emit(PeerEvent::Error { kind, message });
            }
        }
    }

    // ========================================================================
    // Negotiation
    // ========================================================================

    async fn initiate(&mut self, remote: ConnectionId, person: Option<Person>) {
        if Some(remote) == self.connection_id {
            return;
        }
        if self.links.contains_key(&remote) {
            debug!(
                target: "peer.session",
                remote = %remote,
                "Link already exists, not initiating"
            );
            return;
        }
        if self.local_media.is_none() {
            debug!(
                target: "peer.session",
                remote = %remote,
                "Local media not ready, deferring negotiation"
            );
            self.enqueue(remote, person);
            return;
        }

        let person = person.or_else(|| self.peers.get(&remote).cloned());
        if let Some(handle) = self.open_link(remote, person, true).await {
            handle.command(LinkCommand::Offer).await;
        }
    }

    async fn on_incoming_offer(
        &mut self,
        from: ConnectionId,
        from_person: Person,
        description: SessionDescription,
    ) {
        self.peers.insert(from, from_person.clone());

        if let Some(entry) = self.links.get(&from) {
            let offer_in_flight =
                entry.outbound && matches!(entry.state, LinkState::New | LinkState::OfferSent);
            if offer_in_flight && self.connection_id.is_some_and(|own| own > from) {
                debug!(
                    target: "peer.session",
                    remote = %from,
                    "Offer glare, keeping our offer"
                );
                return;
            }
            debug!(
                target: "peer.session",
                remote = %from,
                state = %entry.state,
                "Incoming offer supersedes existing link"
            );
            self.teardown(from);
        }

        self.pending.retain(|p| p.remote != from);
        if let Some(handle) = self.open_link(from, Some(from_person), false).await {
            handle.command(LinkCommand::Answer { description }).await;
        }
    }

    async fn on_incoming_answer(&mut self, from: ConnectionId, description: SessionDescription) {
        match self.links.get(&from) {
            Some(entry) => {
                entry
                    .handle
                    .command(LinkCommand::RemoteAnswer { description })
                    .await;
            }
            None => warn!(
                target: "peer.session",
                remote = %from,
                "Answer for unknown link, ignoring"
            ),
        }
    }

    async fn on_incoming_candidate(&mut self, from: ConnectionId, candidate: IceCandidate) {
        match self.links.get(&from) {
            Some(entry) => {
                entry
                    .handle
                    .command(LinkCommand::Candidate { candidate })
                    .await;
            }
            None => debug!(
                target: "peer.session",
                remote = %from,
                "Candidate for unknown link, dropping"
            ),
        }
    }

    /// Create a link and its actor. Failures are logged and leave no link behind.
    async fn open_link(
        &mut self,
        remote: ConnectionId,
        person: Option<Person>,
        outbound: bool,
    ) -> Option<LinkHandle> {
        let (link, events) = match self
            .engine
            .create_link(remote, &self.config.ice_servers)
            .await
        {
            Ok(parts) => parts,
            Err(e) => {
                warn!(
                    target: "peer.session",
                    remote = %remote,
                    error = %e,
                    "Failed to create link"
                );
                return None;
            }
        };

        self.next_link_id += 1;
        let (handle, _task) = LinkActor::spawn(LinkSetup {
            link_id: self.next_link_id,
            remote,
            link,
            events,
            tracks: self.outbound_tracks(),
            signaling: self.signaling.clone(),
            reports: self.reports_tx.clone(),
            cancel_token: self.cancel_token.child_token(),
        });

        debug!(
            target: "peer.session",
            remote = %remote,
            link_id = handle.link_id(),
            outbound = outbound,
            "Link created"
        );

        self.links.insert(
            remote,
            LinkEntry {
                handle: handle.clone(),
                person,
                state: LinkState::New,
                outbound,
                bare: self.local_media.is_none(),
            },
        );
        Some(handle)
    }

    fn handle_report(&mut self, report: LinkReport) {
        let Some(entry) = self.links.get_mut(&report.remote) else {
            return;
        };
        if entry.handle.link_id() != report.link_id {
            // From a link that has already been replaced
            return;
        }

        match report.update {
            LinkUpdate::State(state) => {
                entry.state = state;
                let bare = entry.bare;
                if state == LinkState::Connected {
                    self.emit(PeerEvent::LinkConnected {
                        remote: report.remote,
                    });
                    if bare && self.local_media.is_some() {
                        self.reoffer_bare_links();
                        self.schedule_drain();
                    }
                } else if state.is_terminal() {
                    self.links.remove(&report.remote);
                    self.emit(PeerEvent::LinkClosed {
                        remote: report.remote,
                        state,
                    });
                }
            }
            LinkUpdate::RemoteTrack(track) => self.emit(PeerEvent::RemoteTrack {
                remote: report.remote,
                track,
            }),
        }
    }

    /// Close the link to `remote`, if any.
    fn teardown(&mut self, remote: ConnectionId) {
        if let Some(entry) = self.links.remove(&remote) {
            entry.handle.close();
            self.emit(PeerEvent::LinkClosed {
                remote,
                state: LinkState::Closed,
            });
        }
    }

    fn teardown_all(&mut self) {
        let remotes: Vec<ConnectionId> = self.links.keys().copied().collect();
        for remote in remotes {
            self.teardown(remote);
        }
        self.pending.clear();
        self.drain_at = None;
    }

    // ========================================================================
    // Pending queue
    // ========================================================================

    /// Queue a negotiation with `remote` unless one is already queued.
    fn enqueue(&mut self, remote: ConnectionId, person: Option<Person>) {
        if Some(remote) == self.connection_id || self.pending.iter().any(|p| p.remote == remote) {
            return;
        }
        self.pending.push_back(PendingNegotiation { remote, person });
    }

    fn schedule_drain(&mut self) {
        if self.drain_at.is_none() && !self.pending.is_empty() && self.local_media.is_some() {
            self.drain_at = Some(Instant::now());
        }
    }

    /// Start the next deferred negotiation and space out the one after it.
    async fn drain_next(&mut self) {
        self.drain_at = None;
        if self.local_media.is_none() {
            return;
        }
        if let Some(next) = self.pending.pop_front() {
            self.initiate(next.remote, next.person).await;
        }
        if !self.pending.is_empty() {
            self.drain_at = Some(Instant::now() + self.config.negotiation_stagger);
        }
    }

    // ========================================================================
    // Local media
    // ========================================================================

    /// Tracks attached to a new link: microphone plus camera or screen.
    fn outbound_tracks(&self) -> Vec<LocalTrack> {
        let audio = self.local_media.as_ref().and_then(|m| m.audio.clone());
        audio.into_iter().chain(self.outbound_video()).collect()
    }

    fn outbound_video(&self) -> Option<LocalTrack> {
        self.screen
            .clone()
            .or_else(|| self.local_media.as_ref().and_then(|m| m.video.clone()))
    }

    async fn broadcast_video(&self, track: Option<LocalTrack>) {
        for entry in self.links.values() {
            entry
                .handle
                .command(LinkCommand::ReplaceVideo {
                    track: track.clone(),
                })
                .await;
        }
    }

    /// Links answered before local media existed carry none of our tracks.
    /// Once such a link is connected and media is available, drop it and
    /// queue a fresh offer, which the remote accepts in place of its link.
    /// Links still negotiating are handled when they report connected.
    fn reoffer_bare_links(&mut self) {
        if self.local_media.is_none() {
            return;
        }
        let bare: Vec<(ConnectionId, Option<Person>)> = self
            .links
            .iter()
            .filter(|(_, entry)| entry.bare && entry.state == LinkState::Connected)
            .map(|(remote, entry)| (*remote, entry.person.clone()))
            .collect();
        for (remote, person) in bare {
            debug!(
                target: "peer.session",
                remote = %remote,
                "Re-offering link opened without local media"
            );
            self.teardown(remote);
            self.enqueue(remote, person);
        }
    }

    async fn stop_screen_share(&mut self) {
        if self.screen.take().is_none() {
            return;
        }
        let camera = self.outbound_video();
        self.broadcast_video(camera).await;
        self.schedule_drain();
    }

    async fn apply_permissions(&mut self, permissions: Permissions) {
        self.permissions = permissions;
        self.enforce_permissions();
        if !self.is_host && !permissions.can_screen_share && self.screen.is_some() {
            info!(
                target: "peer.session",
                person_id = %self.person.id,
                "Screen share permission revoked, restoring camera"
            );
            self.stop_screen_share().await;
        }
    }

    /// Disable local tracks the current permissions do not allow.
    fn enforce_permissions(&self) {
        let Some(media) = &self.local_media else {
            return;
        };
        if !self.permissions.can_unmute {
            set_track_enabled(media.audio.as_ref(), false);
        }
        if !self.permissions.can_enable_video {
            set_track_enabled(media.video.as_ref(), false);
        }
    }

    // ========================================================================
    // Plumbing
    // ========================================================================

    async fn signal(&self, message: ClientMessage) -> Result<(), PeerError> {
        if self.inbound.is_none() {
            return Err(PeerError::Signaling("connection closed".to_string()));
        }
        self.signaling
            .send(message)
            .await
            .map_err(|e| PeerError::Signaling(format!("channel send failed: {e}")))
    }

    fn on_signaling_error(&self, err: &PeerError) {
        warn!(
            target: "peer.session",
            person_id = %self.person.id,
            error = %err,
            "Failed to reach coordinator"
        );
    }

    fn on_signaling_closed(&mut self) {
        info!(
            target: "peer.session",
            person_id = %self.person.id,
            links = self.links.len(),
            "Signaling connection closed"
        );
        self.inbound = None;
        self.teardown_all();
        self.emit(PeerEvent::Disconnected);
    }

    fn emit(&self, event: PeerEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!(
                target: "peer.session",
                person_id = %self.person.id,
                error = %e,
                "Application event dropped"
            );
        }
    }

    fn snapshot(&self) -> SessionState {
        let mut links: Vec<LinkInfo> = self
            .links
            .iter()
            .map(|(remote, entry)| LinkInfo {
                remote: *remote,
                person: entry.person.clone(),
                state: entry.state,
                outbound: entry.outbound,
            })
            .collect();
        links.sort_by_key(|l| l.remote);

        SessionState {
            connection_id: self.connection_id,
            admission: self.admission,
            is_host: self.is_host,
            permissions: self.permissions,
            links,
            pending: self.pending.iter().map(|p| p.remote).collect(),
            chat: self.chat.messages().cloned().collect(),
            screen_sharing: self.screen.is_some(),
        }
    }
}

/// Enable or disable `track`. Returns the resulting state (false if there is no track).
fn set_track_enabled(track: Option<&LocalTrack>, enabled: bool) -> bool {
    match track {
        Some(track) => {
            track.set_enabled(enabled);
            enabled
        }
        None => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::mock::{FakeMediaEngine, FakeNetwork};
    use std::time::Duration;

    struct Peer {
        handle: PeerSessionHandle,
        events: mpsc::Receiver<PeerEvent>,
        to_server: mpsc::Receiver<ClientMessage>,
        from_server: mpsc::Sender<ServerMessage>,
    }

    fn spawn_peer(network: &FakeNetwork, id: &str) -> Peer {
        let (signaling, to_server) = mpsc::channel(64);
        let (from_server, inbound) = mpsc::channel(64);
        let engine = Arc::new(FakeMediaEngine::new(network, id));
        let (handle, events) = PeerSessionHandle::new(
            PeerConfig::default(),
            Person::new(id, id.to_uppercase()),
            engine,
            signaling,
            inbound,
        );
        Peer {
            handle,
            events,
            to_server,
            from_server,
        }
    }

    fn peer_info(connection_id: ConnectionId, id: &str) -> PeerInfo {
        PeerInfo {
            connection_id,
            person: Person::new(id, id.to_uppercase()),
            permissions: Permissions::full(),
            is_host: false,
        }
    }

    fn media() -> LocalMedia {
        LocalMedia::new(Some(LocalTrack::audio("mic")), Some(LocalTrack::video("cam")))
    }

    impl Peer {
        async fn deliver(&self, message: ServerMessage) {
            self.from_server.send(message).await.unwrap();
        }

        async fn admit(&mut self, connection_id: ConnectionId, permissions: Permissions) {
            self.deliver(ServerMessage::Joined {
                connection_id,
                is_host: false,
                permissions,
                settings: MeetingSettings::default(),
            })
            .await;
            self.next_event().await;
        }

        async fn next_event(&mut self) -> PeerEvent {
            tokio::time::timeout(Duration::from_secs(2), self.events.recv())
                .await
                .unwrap()
                .unwrap()
        }

        async fn next_signal(&mut self) -> ClientMessage {
            tokio::time::timeout(Duration::from_secs(2), self.to_server.recv())
                .await
                .unwrap()
                .unwrap()
        }

        async fn next_offer_target(&mut self) -> ConnectionId {
            loop {
                if let ClientMessage::Offer { target, .. } = self.next_signal().await {
                    return target;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_join_sends_join_message() {
        let network = FakeNetwork::new();
        let mut peer = spawn_peer(&network, "a");

        peer.handle.join(MeetingId::new("m")).await.unwrap();
        match peer.next_signal().await {
            ClientMessage::Join { meeting_id, person } => {
                assert_eq!(meeting_id, MeetingId::new("m"));
                assert_eq!(person.id.as_str(), "a");
            }
            other => panic!("expected join, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_roster_initiates_then_acks() {
        let network = FakeNetwork::new();
        let mut peer = spawn_peer(&network, "a");
        peer.handle.set_local_media(media()).await.unwrap();
        peer.admit(ConnectionId::new(), Permissions::full()).await;

        let others = [ConnectionId::new(), ConnectionId::new()];
        peer.deliver(ServerMessage::Roster {
            peers: vec![peer_info(others[0], "b"), peer_info(others[1], "c")],
        })
        .await;

        let mut offered = Vec::new();
        loop {
            match peer.next_signal().await {
                ClientMessage::Offer { target, .. } => offered.push(target),
                ClientMessage::RosterAck => break,
                ClientMessage::Candidate { .. } => {}
                other => panic!("unexpected {other:?}"),
            }
        }
        // Offers may still be in flight when the ack goes out
        while offered.len() < 2 {
            offered.push(peer.next_offer_target().await);
        }
        offered.sort();
        let mut expected = others.to_vec();
        expected.sort();
        assert_eq!(offered, expected);
    }

    #[tokio::test]
    async fn test_initiate_twice_creates_one_link() {
        let network = FakeNetwork::new();
        let mut peer = spawn_peer(&network, "a");
        peer.handle.set_local_media(media()).await.unwrap();
        peer.admit(ConnectionId::new(), Permissions::full()).await;

        let remote = ConnectionId::new();
        peer.handle.initiate(remote, None).await.unwrap();
        peer.handle.initiate(remote, None).await.unwrap();

        assert_eq!(peer.next_offer_target().await, remote);
        let state = peer.handle.get_state().await.unwrap();
        assert_eq!(state.links.len(), 1);
        assert_eq!(network.open_links("a"), 1);
        assert_eq!(network.offers_created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_queue_drains_in_order_with_stagger() {
        let network = FakeNetwork::new();
        let mut peer = spawn_peer(&network, "a");
        peer.admit(ConnectionId::new(), Permissions::full()).await;

        let remotes = [ConnectionId::new(), ConnectionId::new(), ConnectionId::new()];
        for remote in remotes {
            peer.handle.initiate(remote, None).await.unwrap();
        }
        // Duplicate intents are not queued twice
        peer.handle.initiate(remotes[0], None).await.unwrap();

        let state = peer.handle.get_state().await.unwrap();
        assert_eq!(state.pending, remotes.to_vec());
        assert!(state.links.is_empty());

        let started = Instant::now();
        peer.handle.set_local_media(media()).await.unwrap();

        let mut offsets = Vec::new();
        for expected in remotes {
            assert_eq!(peer.next_offer_target().await, expected);
            offsets.push(started.elapsed());
        }
        assert!(offsets[0] < Duration::from_millis(200));
        assert!(offsets[1] >= Duration::from_millis(200));
        assert!(offsets[2] >= Duration::from_millis(400));
        assert!(peer.handle.get_state().await.unwrap().pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_roster_offers_are_staggered() {
        let network = FakeNetwork::new();
        let mut peer = spawn_peer(&network, "a");
        peer.handle.set_local_media(media()).await.unwrap();
        peer.admit(ConnectionId::new(), Permissions::full()).await;

        let others = [ConnectionId::new(), ConnectionId::new(), ConnectionId::new()];
        let started = Instant::now();
        peer.deliver(ServerMessage::Roster {
            peers: others.iter().map(|id| peer_info(*id, "b")).collect(),
        })
        .await;

        let mut offsets = Vec::new();
        for expected in others {
            assert_eq!(peer.next_offer_target().await, expected);
            offsets.push(started.elapsed());
        }
        assert!(offsets[0] < Duration::from_millis(200));
        assert!(offsets[1] >= Duration::from_millis(200));
        assert!(offsets[2] >= Duration::from_millis(400));
        assert_eq!(network.offers_created(), 3);
    }

    #[tokio::test]
    async fn test_peer_joined_waits_for_newcomer_offer() {
        let network = FakeNetwork::new();
        let mut peer = spawn_peer(&network, "a");
        peer.handle.set_local_media(media()).await.unwrap();
        peer.admit(ConnectionId::new(), Permissions::full()).await;

        let newcomer = ConnectionId::new();
        peer.deliver(ServerMessage::PeerJoined {
            peer: peer_info(newcomer, "b"),
        })
        .await;
        assert!(matches!(peer.next_event().await, PeerEvent::PeerJoined(_)));

        let state = peer.handle.get_state().await.unwrap();
        assert!(state.links.is_empty());
        assert!(state.pending.is_empty());
        assert_eq!(network.offers_created(), 0);
        while let Ok(signal) = peer.to_server.try_recv() {
            assert!(!matches!(signal, ClientMessage::Offer { .. }));
        }
    }

    #[tokio::test]
    async fn test_peer_left_drops_pending_entry_and_link() {
        let network = FakeNetwork::new();
        let mut peer = spawn_peer(&network, "a");
        peer.admit(ConnectionId::new(), Permissions::full()).await;

        let queued = ConnectionId::new();
        peer.deliver(ServerMessage::Roster {
            peers: vec![peer_info(queued, "b")],
        })
        .await;
        assert_eq!(peer.handle.get_state().await.unwrap().pending, vec![queued]);

        peer.deliver(ServerMessage::PeerLeft {
            connection_id: queued,
            person_id: PersonId::new("b"),
        })
        .await;
        assert!(matches!(peer.next_event().await, PeerEvent::PeerLeft { .. }));

        let state = peer.handle.get_state().await.unwrap();
        assert!(state.pending.is_empty());

        // Media arriving later does not resurrect the departed peer
        peer.handle.set_local_media(media()).await.unwrap();
        let state = peer.handle.get_state().await.unwrap();
        assert!(state.links.is_empty());
        assert_eq!(network.offers_created(), 0);
    }

    #[tokio::test]
    async fn test_revoked_permission_disables_track_without_renegotiation() {
        let network = FakeNetwork::new();
        let mut peer = spawn_peer(&network, "a");
        let local = media();
        peer.handle.set_local_media(local.clone()).await.unwrap();
        peer.admit(ConnectionId::new(), Permissions::full()).await;

        let remote = ConnectionId::new();
        peer.handle.initiate(remote, None).await.unwrap();
        peer.next_offer_target().await;
        let offers_before = network.offers_created();

        let revoked = Permissions {
            can_unmute: false,
            ..Permissions::full()
        };
        peer.deliver(ServerMessage::PermissionsChanged {
            permissions: revoked,
        })
        .await;
        loop {
            if let PeerEvent::PermissionsChanged(p) = peer.next_event().await {
                assert_eq!(p, revoked);
                break;
            }
        }

        let audio = local.audio.as_ref().unwrap();
        assert!(!audio.is_enabled());
        assert!(local.video.as_ref().unwrap().is_enabled());
        assert_eq!(network.offers_created(), offers_before);

        // The user cannot turn it back on while the permission is revoked
        assert!(!peer.handle.set_microphone_enabled(true).await.unwrap());
        assert!(!audio.is_enabled());
    }

    #[tokio::test]
    async fn test_camera_toggle_and_host_controls() {
        let network = FakeNetwork::new();
        let mut peer = spawn_peer(&network, "a");
        let local = media();
        peer.handle.set_local_media(local.clone()).await.unwrap();
        peer.admit(ConnectionId::new(), Permissions::full()).await;

        let camera = local.video.as_ref().unwrap();
        assert!(!peer.handle.set_camera_enabled(false).await.unwrap());
        assert!(!camera.is_enabled());
        assert!(peer.handle.set_camera_enabled(true).await.unwrap());
        assert!(camera.is_enabled());

        let waiting = ConnectionId::new();
        peer.handle
            .send_control(ClientMessage::Admit {
                person_id: PersonId::new("g-1"),
                connection_id: waiting,
            })
            .await
            .unwrap();
        match peer.next_signal().await {
            ClientMessage::Admit {
                person_id,
                connection_id,
            } => {
                assert_eq!(person_id, PersonId::new("g-1"));
                assert_eq!(connection_id, waiting);
            }
            other => panic!("expected admit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_answer_for_unknown_link_is_ignored() {
        let network = FakeNetwork::new();
        let mut peer = spawn_peer(&network, "a");
        peer.admit(ConnectionId::new(), Permissions::full()).await;

        peer.deliver(ServerMessage::Answer {
            from: ConnectionId::new(),
            description: SessionDescription::answer("fake-answer 1 2 3"),
        })
        .await;
        peer.deliver(ServerMessage::Candidate {
            from: ConnectionId::new(),
            candidate: IceCandidate {
                candidate: "candidate:x".to_string(),
                sdp_mid: None,
                sdp_mline_index: None,
            },
        })
        .await;

        let state = peer.handle.get_state().await.unwrap();
        assert!(state.links.is_empty());
        assert_eq!(state.admission, AdmissionStatus::Admitted);
    }

    #[tokio::test]
    async fn test_chat_echo_is_not_duplicated() {
        let network = FakeNetwork::new();
        let mut peer = spawn_peer(&network, "a");
        peer.admit(ConnectionId::new(), Permissions::full()).await;

        let sent = peer.handle.send_chat("hi").await.unwrap();
        assert!(matches!(
            peer.next_signal().await,
            ClientMessage::Chat { message_id, .. } if message_id == sent.message_id
        ));

        peer.deliver(ServerMessage::Chat {
            message: ChatMessage { seq: 1, ..sent.clone() },
        })
        .await;
        let reply = ChatMessage {
            seq: 2,
            message_id: None,
            author: Person::new("b", "B"),
            text: "hello".to_string(),
            timestamp_ms: sent.timestamp_ms,
        };
        peer.deliver(ServerMessage::Chat {
            message: reply.clone(),
        })
        .await;

        // Only the other author's message reaches the application
        assert_eq!(peer.next_event().await, PeerEvent::Chat(reply));
        let state = peer.handle.get_state().await.unwrap();
        assert_eq!(state.chat.len(), 2);
        assert_eq!(state.chat[0].seq, 1);
    }

    #[tokio::test]
    async fn test_host_sees_waiting_guest_withdraw() {
        let network = FakeNetwork::new();
        let mut peer = spawn_peer(&network, "a");
        peer.admit(ConnectionId::new(), Permissions::full()).await;

        let guest = ConnectionId::new();
        peer.deliver(ServerMessage::AdmissionRequest {
            person_id: PersonId::new("g"),
            name: "G".to_string(),
            connection_id: guest,
        })
        .await;
        assert!(matches!(peer.next_event().await, PeerEvent::AdmissionRequest { .. }));

        peer.deliver(ServerMessage::AdmissionWithdrawn {
            person_id: PersonId::new("g"),
            connection_id: guest,
        })
        .await;
        assert_eq!(
            peer.next_event().await,
            PeerEvent::AdmissionWithdrawn {
                person_id: PersonId::new("g"),
                connection_id: guest,
            }
        );
    }

    #[tokio::test]
    async fn test_denied_and_disconnect_events() {
        let network = FakeNetwork::new();
        let Peer {
            handle,
            mut events,
            from_server,
            ..
        } = spawn_peer(&network, "a");
        async fn next(events: &mut mpsc::Receiver<PeerEvent>) -> PeerEvent {
            tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap()
        }

        from_server.send(ServerMessage::Waiting).await.unwrap();
        assert_eq!(next(&mut events).await, PeerEvent::Waiting);
        from_server.send(ServerMessage::Denied).await.unwrap();
        assert_eq!(next(&mut events).await, PeerEvent::Denied);
        assert_eq!(
            handle.get_state().await.unwrap().admission,
            AdmissionStatus::Denied
        );

        drop(from_server);
        assert_eq!(next(&mut events).await, PeerEvent::Disconnected);
        assert!(matches!(
            handle.send_chat("anyone?").await,
            Err(PeerError::Signaling(_))
        ));
    }
}
