//! Direct media link to one remote connection.
//!
//! A `LinkActor` owns one [`PeerLink`] and serializes everything that
//! touches it: our offer, an answer to their offer, their answer, trickled
//! candidates, track swaps and teardown. Links to different remotes run in
//! parallel.
//!
//! # State Machine
//!
//! ```text
//! New ──► OfferSent ──► AnswerReceived ──► Connected
//!  └────► Answering ─────────────────────► Connected
//! any ──► Failed | Closed   (terminal)
//! ```
//!
//! A link in a terminal state is gone. The session may create a new one
//! for the same remote, starting again from `New`.

use crate::engine::{Connectivity, LinkEvent, LocalTrack, PeerLink, RemoteTrack};
use crate::errors::PeerError;

use common::protocol::{ClientMessage, IceCandidate, SessionDescription};
use common::types::ConnectionId;
use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Channel buffer size for link commands.
const LINK_CHANNEL_BUFFER: usize = 32;

/// Negotiation state of one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    New,
    OfferSent,
    AnswerReceived,
    Answering,
    Connected,
    Failed,
    Closed,
}

impl LinkState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            LinkState::New => "new",
            LinkState::OfferSent => "offer-sent",
            LinkState::AnswerReceived => "answer-received",
            LinkState::Answering => "answering",
            LinkState::Connected => "connected",
            LinkState::Failed => "failed",
            LinkState::Closed => "closed",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, LinkState::Failed | LinkState::Closed)
    }

    /// Apply one transition.
    ///
    /// # Errors
    ///
    /// Returns `PeerError::InvalidTransition` for any edge not in the table.
    pub fn transition(self, next: LinkState) -> Result<LinkState, PeerError> {
        use LinkState::{AnswerReceived, Answering, Closed, Connected, Failed, New, OfferSent};

        let allowed = match (self, next) {
            (Failed | Closed, _) => false,
            (_, Failed | Closed) => true,
            (New, OfferSent | Answering)
            | (OfferSent, AnswerReceived)
            | (AnswerReceived | Answering, Connected) => true,
            _ => false,
        };

        if allowed {
            Ok(next)
        } else {
            Err(PeerError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commands from the session to a link.
#[derive(Debug)]
pub(crate) enum LinkCommand {
    /// Start the outbound path.
    Offer,
    /// Start the inbound path with the remote offer.
    Answer { description: SessionDescription },
    /// The remote answered our offer.
    RemoteAnswer { description: SessionDescription },
    Candidate { candidate: IceCandidate },
    ReplaceVideo { track: Option<LocalTrack> },
}

/// What a link tells its session.
#[derive(Debug)]
pub(crate) enum LinkUpdate {
    State(LinkState),
    RemoteTrack(RemoteTrack),
}

#[derive(Debug)]
pub(crate) struct LinkReport {
    pub remote: ConnectionId,
    pub link_id: u64,
    pub update: LinkUpdate,
}

/// Handle to a `LinkActor`.
#[derive(Debug, Clone)]
pub(crate) struct LinkHandle {
    sender: mpsc::Sender<LinkCommand>,
    cancel_token: CancellationToken,
    link_id: u64,
}

impl LinkHandle {
    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    /// Queue a command. A stopped link ignores it.
    pub async fn command(&self, command: LinkCommand) {
        if self.sender.send(command).await.is_err() {
            debug!(
                target: "peer.link",
                link_id = self.link_id,
                "Link already stopped, dropping command"
            );
        }
    }

    /// Tear the link down without waiting for queued commands.
    pub fn close(&self) {
        self.cancel_token.cancel();
    }
}

pub(crate) struct LinkActor {
    link_id: u64,
    remote: ConnectionId,
    link: Box<dyn PeerLink>,
    events: mpsc::Receiver<LinkEvent>,
    receiver: mpsc::Receiver<LinkCommand>,
    signaling: mpsc::Sender<ClientMessage>,
    reports: mpsc::UnboundedSender<LinkReport>,
    cancel_token: CancellationToken,
    state: LinkState,
}

/// Dependencies of a new link.
pub(crate) struct LinkSetup {
    pub link_id: u64,
    pub remote: ConnectionId,
    pub link: Box<dyn PeerLink>,
    pub events: mpsc::Receiver<LinkEvent>,
    pub tracks: Vec<LocalTrack>,
    pub signaling: mpsc::Sender<ClientMessage>,
    pub reports: mpsc::UnboundedSender<LinkReport>,
    pub cancel_token: CancellationToken,
}

impl LinkActor {
    pub fn spawn(setup: LinkSetup) -> (LinkHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(LINK_CHANNEL_BUFFER);

        let actor = Self {
            link_id: setup.link_id,
            remote: setup.remote,
            link: setup.link,
            events: setup.events,
            receiver,
            signaling: setup.signaling,
            reports: setup.reports,
            cancel_token: setup.cancel_token.clone(),
            state: LinkState::New,
        };

        let task = tokio::spawn(actor.run(setup.tracks));

        let handle = LinkHandle {
            sender,
            cancel_token: setup.cancel_token,
            link_id: setup.link_id,
        };
        (handle, task)
    }

    #[instrument(skip_all, name = "peer.link", fields(remote = %self.remote, link_id = self.link_id))]
    async fn run(mut self, tracks: Vec<LocalTrack>) {
        for track in tracks {
            if let Err(e) = self.link.attach_track(track).await {
                self.fail(&e);
            }
        }

        while !self.state.is_terminal() {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    self.set_state(LinkState::Closed);
                }

                command = self.receiver.recv() => {
                    match command {
                        Some(command) => {
                            if let Err(e) = self.handle_command(command).await {
                                self.fail(&e);
                            }
                        }
                        None => self.set_state(LinkState::Closed),
                    }
                }

                Some(event) = self.events.recv() => {
                    if let Err(e) = self.handle_event(event).await {
                        self.fail(&e);
                    }
                }
            }
        }

        self.link.close().await;
        info!(
            target: "peer.link",
            remote = %self.remote,
            link_id = self.link_id,
            state = %self.state,
            "Link stopped"
        );
    }

    async fn handle_command(&mut self, command: LinkCommand) -> Result<(), PeerError> {
        match command {
            LinkCommand::Offer => {
                self.state.transition(LinkState::OfferSent)?;
                let offer = self.link.create_offer().await?;
                self.link.set_local_description(offer.clone()).await?;
                self.set_state(LinkState::OfferSent);
                self.signal(ClientMessage::Offer {
                    target: self.remote,
                    description: offer,
                })
                .await
            }

            LinkCommand::Answer { description } => {
                self.set_state(self.state.transition(LinkState::Answering)?);
                self.link.set_remote_description(description).await?;
                let answer = self.link.create_answer().await?;
                self.link.set_local_description(answer.clone()).await?;
                self.signal(ClientMessage::Answer {
                    target: self.remote,
                    description: answer,
                })
                .await
            }

            LinkCommand::RemoteAnswer { description } => {
                if self.state != LinkState::OfferSent {
                    // Late or duplicate answer
                    warn!(
                        target: "peer.link",
                        remote = %self.remote,
                        state = %self.state,
                        "Answer without a pending offer, ignoring"
                    );
                    return Ok(());
                }
                self.link.set_remote_description(description).await?;
                self.set_state(LinkState::AnswerReceived);
                Ok(())
            }

            LinkCommand::Candidate { candidate } => {
                if let Err(e) = self.link.add_candidate(candidate).await {
                    debug!(
                        target: "peer.link",
                        remote = %self.remote,
                        error = %e,
                        "Candidate rejected, ignoring"
                    );
                }
                Ok(())
            }

            LinkCommand::ReplaceVideo { track } => {
                if let Err(e) = self.link.replace_video_track(track).await {
                    warn!(
                        target: "peer.link",
                        remote = %self.remote,
                        error = %e,
                        "Video track swap failed"
                    );
                }
                Ok(())
            }

        }
    }

    async fn handle_event(&mut self, event: LinkEvent) -> Result<(), PeerError> {
        match event {
            LinkEvent::LocalCandidate(candidate) => {
                self.signal(ClientMessage::Candidate {
                    target: self.remote,
                    candidate,
                })
                .await
            }

            LinkEvent::Connectivity(Connectivity::Connected) => {
                match self.state.transition(LinkState::Connected) {
                    Ok(next) => self.set_state(next),
                    Err(e) => debug!(
                        target: "peer.link",
                        remote = %self.remote,
                        error = %e,
                        "Ignoring connectivity report"
                    ),
                }
                Ok(())
            }

            LinkEvent::Connectivity(Connectivity::Disconnected) => {
                debug!(
                    target: "peer.link",
                    remote = %self.remote,
                    "Connectivity interrupted"
                );
                Ok(())
            }

            LinkEvent::Connectivity(Connectivity::Failed) => {
                self.set_state(LinkState::Failed);
                Ok(())
            }

            LinkEvent::Connectivity(Connectivity::Closed) => {
                self.set_state(LinkState::Closed);
                Ok(())
            }

            LinkEvent::RemoteTrack(track) => {
                self.report(LinkUpdate::RemoteTrack(track));
                Ok(())
            }
        }
    }

    async fn signal(&self, message: ClientMessage) -> Result<(), PeerError> {
        if self.cancel_token.is_cancelled() {
            // Abandoned link: its descriptions must not reach the remote
            return Ok(());
        }
        self.signaling
            .send(message)
            .await
            .map_err(|e| PeerError::Signaling(format!("channel send failed: {e}")))
    }

    fn set_state(&mut self, next: LinkState) {
        if self.state == next {
            return;
        }
        debug!(
            target: "peer.link",
            remote = %self.remote,
            from = %self.state,
            to = %next,
            "Link state changed"
        );
        self.state = next;
        self.report(LinkUpdate::State(next));
    }

    fn fail(&mut self, err: &PeerError) {
        warn!(
            target: "peer.link",
            remote = %self.remote,
            state = %self.state,
            error = %err,
            "Negotiation failed, tearing down link"
        );
        self.set_state(LinkState::Failed);
    }

    fn report(&self, update: LinkUpdate) {
        let _ = self.reports.send(LinkReport {
            remote: self.remote,
            link_id: self.link_id,
            update,
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::mock::{FakeMediaEngine, FakeNetwork};
    use crate::engine::MediaEngine;
    use std::time::Duration;

    #[test]
    fn test_transition_table() {
        use LinkState::{AnswerReceived, Answering, Closed, Connected, Failed, New, OfferSent};

        assert_eq!(New.transition(OfferSent).unwrap(), OfferSent);
        assert_eq!(New.transition(Answering).unwrap(), Answering);
        assert_eq!(OfferSent.transition(AnswerReceived).unwrap(), AnswerReceived);
        assert_eq!(AnswerReceived.transition(Connected).unwrap(), Connected);
        assert_eq!(Answering.transition(Connected).unwrap(), Connected);

        for state in [New, OfferSent, AnswerReceived, Answering, Connected] {
            assert_eq!(state.transition(Failed).unwrap(), Failed);
            assert_eq!(state.transition(Closed).unwrap(), Closed);
        }

        assert!(New.transition(Connected).is_err());
        assert!(OfferSent.transition(Connected).is_err());
        assert!(Answering.transition(AnswerReceived).is_err());
        assert!(Connected.transition(OfferSent).is_err());
        assert!(Closed.transition(New).is_err());
        assert!(Failed.transition(Closed).is_err());
    }

    struct Harness {
        handle: LinkHandle,
        task: JoinHandle<()>,
        signaling: mpsc::Receiver<ClientMessage>,
        reports: mpsc::UnboundedReceiver<LinkReport>,
    }

    async fn spawn_link(engine: &FakeMediaEngine, remote: ConnectionId) -> Harness {
        let (link, events) = engine.create_link(remote, &[]).await.unwrap();
        let (signaling_tx, signaling) = mpsc::channel(16);
        let (reports_tx, reports) = mpsc::unbounded_channel();
        let (handle, task) = LinkActor::spawn(LinkSetup {
            link_id: 1,
            remote,
            link,
            events,
            tracks: vec![LocalTrack::audio("mic")],
            signaling: signaling_tx,
            reports: reports_tx,
            cancel_token: CancellationToken::new(),
        });
        Harness {
            handle,
            task,
            signaling,
            reports,
        }
    }

    async fn next_state(reports: &mut mpsc::UnboundedReceiver<LinkReport>) -> LinkState {
        loop {
            let report = tokio::time::timeout(Duration::from_secs(1), reports.recv())
                .await
                .unwrap()
                .unwrap();
            if let LinkUpdate::State(state) = report.update {
                return state;
            }
        }
    }

    #[tokio::test]
    async fn test_offer_path_sends_offer_then_candidate() {
        let network = FakeNetwork::new();
        let engine = FakeMediaEngine::new(&network, "a");
        let remote = ConnectionId::new();
        let mut h = spawn_link(&engine, remote).await;

        h.handle.command(LinkCommand::Offer).await;

        assert_eq!(next_state(&mut h.reports).await, LinkState::OfferSent);
        assert!(matches!(
            h.signaling.recv().await,
            Some(ClientMessage::Offer { target, .. }) if target == remote
        ));
        assert!(matches!(
            h.signaling.recv().await,
            Some(ClientMessage::Candidate { target, .. }) if target == remote
        ));
    }

    #[tokio::test]
    async fn test_answer_without_offer_is_ignored() {
        let network = FakeNetwork::new();
        let engine = FakeMediaEngine::new(&network, "a");
        let mut h = spawn_link(&engine, ConnectionId::new()).await;

        h.handle
            .command(LinkCommand::RemoteAnswer {
                description: SessionDescription::answer("fake-answer 9 9 9"),
            })
            .await;
        h.handle.command(LinkCommand::Offer).await;

        // The stray answer caused no transition
        assert_eq!(next_state(&mut h.reports).await, LinkState::OfferSent);

        h.handle.close();
        assert_eq!(next_state(&mut h.reports).await, LinkState::Closed);
        h.task.await.unwrap();
        assert_eq!(network.open_links("a"), 0);
    }

    #[tokio::test]
    async fn test_closed_link_sends_nothing() {
        let network = FakeNetwork::new();
        let engine = FakeMediaEngine::new(&network, "a");
        let mut h = spawn_link(&engine, ConnectionId::new()).await;

        h.handle.close();
        h.handle.command(LinkCommand::Offer).await;

        assert_eq!(next_state(&mut h.reports).await, LinkState::Closed);
        h.task.await.unwrap();
        assert!(h.signaling.try_recv().is_err());
        assert_eq!(network.offers_created(), 0);
    }

    #[tokio::test]
    async fn test_engine_failure_marks_link_failed() {
        let network = FakeNetwork::new();
        let engine = FakeMediaEngine::new(&network, "a");
        engine.fail_next_offers(1);
        let mut h = spawn_link(&engine, ConnectionId::new()).await;

        h.handle.command(LinkCommand::Offer).await;

        assert_eq!(next_state(&mut h.reports).await, LinkState::Failed);
        h.task.await.unwrap();
        assert_eq!(network.open_links("a"), 0);
        assert!(h.signaling.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_two_links_connect() {
        let network = FakeNetwork::new();
        let a = FakeMediaEngine::new(&network, "a");
        let b = FakeMediaEngine::new(&network, "b");
        let mut offerer = spawn_link(&a, ConnectionId::new()).await;
        let mut answerer = spawn_link(&b, ConnectionId::new()).await;

        offerer.handle.command(LinkCommand::Offer).await;
        let Some(ClientMessage::Offer { description, .. }) = offerer.signaling.recv().await else {
            panic!("expected offer");
        };
        answerer
            .handle
            .command(LinkCommand::Answer { description })
            .await;
        let Some(ClientMessage::Answer { description, .. }) = answerer.signaling.recv().await
        else {
            panic!("expected answer");
        };
        offerer
            .handle
            .command(LinkCommand::RemoteAnswer { description })
            .await;

        assert_eq!(next_state(&mut offerer.reports).await, LinkState::OfferSent);
        assert_eq!(
            next_state(&mut offerer.reports).await,
            LinkState::AnswerReceived
        );
        assert_eq!(next_state(&mut offerer.reports).await, LinkState::Connected);
        assert_eq!(next_state(&mut answerer.reports).await, LinkState::Answering);
        assert_eq!(next_state(&mut answerer.reports).await, LinkState::Connected);
        assert_eq!(network.connected_pairs(), 1);

        // Closing one side closes the other
        offerer.handle.close();
        assert_eq!(next_state(&mut answerer.reports).await, LinkState::Closed);
    }
}
