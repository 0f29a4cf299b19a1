//! Media engine abstraction.
//!
//! The session never talks to a media stack directly. It creates one
//! [`PeerLink`] per remote connection through a [`MediaEngine`] and drives
//! the offer/answer exchange through that trait. Connectivity changes,
//! gathered candidates and incoming tracks come back as [`LinkEvent`]s on
//! the channel returned alongside the link.
//!
//! [`mock`] provides an in-process engine for tests and offline runs.

use crate::errors::PeerError;
use async_trait::async_trait;
use common::protocol::{IceCandidate, SessionDescription};
use common::types::ConnectionId;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// An outgoing media track.
///
/// Clones share the enabled flag, so disabling the session's copy silences
/// the track on every link it is attached to.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: Arc<AtomicBool>,
}

impl LocalTrack {
    #[must_use]
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    #[must_use]
    pub fn audio(id: impl Into<String>) -> Self {
        Self::new(id, TrackKind::Audio)
    }

    #[must_use]
    pub fn video(id: impl Into<String>) -> Self {
        Self::new(id, TrackKind::Video)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

/// Locally captured media. Either track may be missing (no device, declined).
#[derive(Debug, Clone, Default)]
pub struct LocalMedia {
    pub audio: Option<LocalTrack>,
    pub video: Option<LocalTrack>,
}

impl LocalMedia {
    #[must_use]
    pub fn new(audio: Option<LocalTrack>, video: Option<LocalTrack>) -> Self {
        Self { audio, video }
    }
}

/// A track received from a remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Connectivity as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Connected,
    /// Temporary loss; the engine may recover on its own.
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous notifications from one link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    LocalCandidate(IceCandidate),
    Connectivity(Connectivity),
    RemoteTrack(RemoteTrack),
}

/// One direct media link to a remote connection.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn attach_track(&mut self, track: LocalTrack) -> Result<(), PeerError>;

    async fn create_offer(&mut self) -> Result<SessionDescription, PeerError>;

    /// Requires a remote offer to have been applied.
    async fn create_answer(&mut self) -> Result<SessionDescription, PeerError>;

    async fn set_local_description(&mut self, description: SessionDescription)
        -> Result<(), PeerError>;

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), PeerError>;

    async fn add_candidate(&mut self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Swap the outgoing video without renegotiation. `None` sends no video.
    async fn replace_video_track(&mut self, track: Option<LocalTrack>) -> Result<(), PeerError>;

    async fn close(&mut self);
}

/// A link plus the channel its events arrive on.
pub type LinkParts = (Box<dyn PeerLink>, mpsc::Receiver<LinkEvent>);

/// Factory for [`PeerLink`]s.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_link(
        &self,
        remote: ConnectionId,
        ice_servers: &[String],
    ) -> Result<LinkParts, PeerError>;
}

pub mod mock {
    //! In-process media engine.
    //!
    //! Every [`FakeMediaEngine`] sharing one [`FakeNetwork`] can reach the
    //! others. Session descriptions are plain tokens naming the link that
    //! produced them, and a pair of links becomes connected only when an
    //! offerer applies the answer generated for its own current offer.

    use super::{
        Connectivity, LinkEvent, LinkParts, LocalTrack, MediaEngine, PeerLink, RemoteTrack,
        TrackKind,
    };
    use crate::errors::PeerError;
    use async_trait::async_trait;
    use common::protocol::{IceCandidate, SdpKind, SessionDescription};
    use common::types::ConnectionId;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
    use tokio::sync::mpsc;

    const EVENT_BUFFER: usize = 64;

    /// Shared fabric connecting fake engines.
    #[derive(Debug, Clone, Default)]
    pub struct FakeNetwork {
        state: Arc<Mutex<NetworkState>>,
    }

    #[derive(Debug, Default)]
    struct NetworkState {
        next_link: u64,
        next_serial: u64,
        offers_created: usize,
        links: HashMap<u64, FakeEndpoint>,
    }

    #[derive(Debug)]
    struct FakeEndpoint {
        owner: String,
        remote: ConnectionId,
        events: mpsc::Sender<LinkEvent>,
        tracks: Vec<LocalTrack>,
        local_offer: Option<u64>,
        remote_offer: Option<(u64, u64)>,
        partner: Option<u64>,
        candidates: usize,
        closed: bool,
    }

    impl FakeEndpoint {
        fn notify(&self, event: LinkEvent) {
            let _ = self.events.try_send(event);
        }

        fn remote_tracks(&self) -> Vec<RemoteTrack> {
            self.tracks
                .iter()
                .map(|t| RemoteTrack {
                    id: t.id().to_string(),
                    kind: t.kind(),
                })
                .collect()
        }
    }

    impl FakeNetwork {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        fn lock(&self) -> MutexGuard<'_, NetworkState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Links of `owner` that have not been closed.
        #[must_use]
        pub fn open_links(&self, owner: &str) -> usize {
            self.lock()
                .links
                .values()
                .filter(|l| l.owner == owner && !l.closed)
                .count()
        }

        /// Open links of `owner` that completed the offer/answer exchange.
        #[must_use]
        pub fn connected_links(&self, owner: &str) -> usize {
            self.lock()
                .links
                .values()
                .filter(|l| l.owner == owner && !l.closed && l.partner.is_some())
                .count()
        }

        /// Open connected pairs across the whole network.
        #[must_use]
        pub fn connected_pairs(&self) -> usize {
            self.lock()
                .links
                .values()
                .filter(|l| !l.closed && l.partner.is_some())
                .count()
                / 2
        }

        #[must_use]
        pub fn offers_created(&self) -> usize {
            self.lock().offers_created
        }

        /// Candidates applied to open links of `owner`.
        #[must_use]
        pub fn candidates_applied(&self, owner: &str) -> usize {
            self.lock()
                .links
                .values()
                .filter(|l| l.owner == owner && !l.closed)
                .map(|l| l.candidates)
                .sum()
        }

        /// Outgoing video track id on each open link of `owner`, keyed by remote.
        #[must_use]
        pub fn video_tracks(&self, owner: &str) -> HashMap<ConnectionId, Option<String>> {
            self.lock()
                .links
                .values()
                .filter(|l| l.owner == owner && !l.closed)
                .map(|l| {
                    let video = l
                        .tracks
                        .iter()
                        .find(|t| t.kind() == TrackKind::Video)
                        .map(|t| t.id().to_string());
                    (l.remote, video)
                })
                .collect()
        }
    }

    /// Media engine for one participant on a [`FakeNetwork`].
    #[derive(Debug, Clone)]
    pub struct FakeMediaEngine {
        network: FakeNetwork,
        owner: String,
        offer_failures: Arc<AtomicUsize>,
    }

    impl FakeMediaEngine {
        #[must_use]
        pub fn new(network: &FakeNetwork, owner: impl Into<String>) -> Self {
            Self {
                network: network.clone(),
                owner: owner.into(),
                offer_failures: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// Make the next `count` offers fail.
        pub fn fail_next_offers(&self, count: usize) {
            self.offer_failures.store(count, Ordering::SeqCst);
        }

        #[must_use]
        pub fn network(&self) -> &FakeNetwork {
            &self.network
        }
    }

    #[async_trait]
    impl MediaEngine for FakeMediaEngine {
        async fn create_link(
            &self,
            remote: ConnectionId,
            _ice_servers: &[String],
        ) -> Result<LinkParts, PeerError> {
            let (events, receiver) = mpsc::channel(EVENT_BUFFER);
            let id = {
                let mut state = self.network.lock();
                state.next_link += 1;
                let id = state.next_link;
                state.links.insert(
                    id,
                    FakeEndpoint {
                        owner: self.owner.clone(),
                        remote,
                        events,
                        tracks: Vec::new(),
                        local_offer: None,
                        remote_offer: None,
                        partner: None,
                        candidates: 0,
                        closed: false,
                    },
                );
                id
            };

            let link = FakeLink {
                id,
                network: self.network.clone(),
                offer_failures: Arc::clone(&self.offer_failures),
            };
            Ok((Box::new(link), receiver))
        }
    }

    struct FakeLink {
        id: u64,
        network: FakeNetwork,
        offer_failures: Arc<AtomicUsize>,
    }

    fn engine_error(message: impl Into<String>) -> PeerError {
        PeerError::Engine(message.into())
    }

    /// Parse `<tag> <n> <n> ...` into its numeric fields.
    fn parse_token(sdp: &str, tag: &str) -> Result<Vec<u64>, PeerError> {
        let mut parts = sdp.split_whitespace();
        if parts.next() != Some(tag) {
            return Err(engine_error(format!("not a {tag} description")));
        }
        parts
            .map(|p| p.parse().map_err(|_| engine_error("malformed description")))
            .collect()
    }

    impl FakeLink {
        fn with_endpoint<T>(
            &self,
            f: impl FnOnce(&mut NetworkState, u64) -> Result<T, PeerError>,
        ) -> Result<T, PeerError> {
            let mut state = self.network.lock();
            match state.links.get(&self.id) {
                Some(endpoint) if !endpoint.closed => f(&mut state, self.id),
                _ => Err(engine_error("link closed")),
            }
        }
    }

    #[async_trait]
    impl PeerLink for FakeLink {
        async fn attach_track(&mut self, track: LocalTrack) -> Result<(), PeerError> {
            self.with_endpoint(|state, id| {
                if let Some(endpoint) = state.links.get_mut(&id) {
                    endpoint.tracks.push(track);
                }
                Ok(())
            })
        }

        async fn create_offer(&mut self) -> Result<SessionDescription, PeerError> {
            let injected = self
                .offer_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected {
                return Err(engine_error("injected offer failure"));
            }

            self.with_endpoint(|state, id| {
                state.next_serial += 1;
                state.offers_created += 1;
                let serial = state.next_serial;
                if let Some(endpoint) = state.links.get_mut(&id) {
                    endpoint.local_offer = Some(serial);
                }
                Ok(SessionDescription::offer(format!("fake-offer {id} {serial}")))
            })
        }

        async fn create_answer(&mut self) -> Result<SessionDescription, PeerError> {
            self.with_endpoint(|state, id| {
                let offer = state.links.get(&id).and_then(|e| e.remote_offer);
                let (offerer, serial) =
                    offer.ok_or_else(|| engine_error("no remote offer to answer"))?;
                Ok(SessionDescription::answer(format!(
                    "fake-answer {id} {offerer} {serial}"
                )))
            })
        }

        async fn set_local_description(
            &mut self,
            _description: SessionDescription,
        ) -> Result<(), PeerError> {
            self.with_endpoint(|state, id| {
                if let Some(endpoint) = state.links.get(&id) {
                    endpoint.notify(LinkEvent::LocalCandidate(IceCandidate {
                        candidate: format!("candidate:{id} 1 udp 2122260223 127.0.0.1 9 typ host"),
                        sdp_mid: Some("0".to_string()),
                        sdp_mline_index: Some(0),
                    }));
                }
                Ok(())
            })
        }

        async fn set_remote_description(
            &mut self,
            description: SessionDescription,
        ) -> Result<(), PeerError> {
            self.with_endpoint(|state, id| match description.kind {
                SdpKind::Offer => {
                    let fields = parse_token(&description.sdp, "fake-offer")?;
                    let &[offerer, serial] = fields.as_slice() else {
                        return Err(engine_error("malformed offer"));
                    };
                    if let Some(endpoint) = state.links.get_mut(&id) {
                        endpoint.remote_offer = Some((offerer, serial));
                    }
                    Ok(())
                }
                SdpKind::Answer => {
                    let fields = parse_token(&description.sdp, "fake-answer")?;
                    let &[answerer, offerer, serial] = fields.as_slice() else {
                        return Err(engine_error("malformed answer"));
                    };
                    let own_offer = state.links.get(&id).and_then(|e| e.local_offer);
                    if offerer != id || own_offer != Some(serial) {
                        return Err(engine_error("answer does not match the local offer"));
                    }
                    let answerer_tracks = match state.links.get(&answerer) {
                        Some(peer) if !peer.closed => peer.remote_tracks(),
                        _ => return Err(engine_error("remote link is gone")),
                    };

                    let own_tracks = match state.links.get_mut(&id) {
                        Some(endpoint) => {
                            endpoint.partner = Some(answerer);
                            endpoint.notify(LinkEvent::Connectivity(Connectivity::Connected));
                            for track in answerer_tracks {
                                endpoint.notify(LinkEvent::RemoteTrack(track));
                            }
                            endpoint.remote_tracks()
                        }
                        None => Vec::new(),
                    };
                    if let Some(peer) = state.links.get_mut(&answerer) {
                        peer.partner = Some(id);
                        peer.notify(LinkEvent::Connectivity(Connectivity::Connected));
                        for track in own_tracks {
                            peer.notify(LinkEvent::RemoteTrack(track));
                        }
                    }
                    Ok(())
                }
            })
        }

        async fn add_candidate(&mut self, _candidate: IceCandidate) -> Result<(), PeerError> {
            self.with_endpoint(|state, id| {
                if let Some(endpoint) = state.links.get_mut(&id) {
                    endpoint.candidates += 1;
                }
                Ok(())
            })
        }

        async fn replace_video_track(
            &mut self,
            track: Option<LocalTrack>,
        ) -> Result<(), PeerError> {
            self.with_endpoint(|state, id| {
                if let Some(endpoint) = state.links.get_mut(&id) {
                    endpoint.tracks.retain(|t| t.kind() != TrackKind::Video);
                    endpoint.tracks.extend(track);
                }
                Ok(())
            })
        }

        async fn close(&mut self) {
            let mut state = self.network.lock();
            let partner = match state.links.get_mut(&self.id) {
                Some(endpoint) if !endpoint.closed => {
                    endpoint.closed = true;
                    endpoint.partner
                }
                _ => return,
            };
            if let Some(peer) = partner.and_then(|p| state.links.get(&p)) {
                if !peer.closed {
                    peer.notify(LinkEvent::Connectivity(Connectivity::Closed));
                }
            }
        }
    }

}
