//! Sessions negotiating with each other through an in-memory relay.
//!
//! The relay stands in for the coordinator: it assigns connection ids and
//! forwards offer/answer/candidate messages between sessions. Presence and
//! admission events are delivered by the tests themselves.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::protocol::{ClientMessage, PeerInfo, ServerMessage};
use common::types::{ConnectionId, MeetingSettings, Permissions, Person, PersonId};
use peer_session::engine::mock::{FakeMediaEngine, FakeNetwork};
use peer_session::{
    LinkState, LocalMedia, LocalTrack, PeerConfig, PeerEvent, PeerSessionHandle, SessionState,
};
use tokio::sync::mpsc;

#[derive(Clone, Default)]
struct Relay {
    routes: Arc<Mutex<HashMap<ConnectionId, mpsc::Sender<ServerMessage>>>>,
}

impl Relay {
    fn route(&self, target: ConnectionId) -> Option<mpsc::Sender<ServerMessage>> {
        self.routes.lock().unwrap().get(&target).cloned()
    }

    fn spawn_forwarder(
        &self,
        id: ConnectionId,
        person: Person,
        mut outbound: mpsc::Receiver<ClientMessage>,
    ) {
        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                let (target, event) = match message {
                    ClientMessage::Offer {
                        target,
                        description,
                    } => (
                        target,
                        ServerMessage::Offer {
                            from: id,
                            from_person: person.clone(),
                            description,
                        },
                    ),
                    ClientMessage::Answer {
                        target,
                        description,
                    } => (
                        target,
                        ServerMessage::Answer {
                            from: id,
                            description,
                        },
                    ),
                    ClientMessage::Candidate { target, candidate } => (
                        target,
                        ServerMessage::Candidate {
                            from: id,
                            candidate,
                        },
                    ),
                    ClientMessage::RequestScreenShare => {
                        (id, ServerMessage::ScreenShareDecision { granted: true })
                    }
                    _ => continue,
                };
                if let Some(route) = relay.route(target) {
                    let _ = route.send(event).await;
                }
            }
        });
    }
}

struct Participant {
    id: ConnectionId,
    person: Person,
    handle: PeerSessionHandle,
    events: mpsc::Receiver<PeerEvent>,
    inbound: mpsc::Sender<ServerMessage>,
    media: LocalMedia,
}

impl Participant {
    async fn spawn(relay: &Relay, network: &FakeNetwork, name: &str) -> Self {
        let id = ConnectionId::new();
        let person = Person::new(name, name.to_uppercase());
        let (signaling, outbound) = mpsc::channel(64);
        let (inbound, inbound_rx) = mpsc::channel(64);
        relay.routes.lock().unwrap().insert(id, inbound.clone());
        relay.spawn_forwarder(id, person.clone(), outbound);

        let engine = Arc::new(FakeMediaEngine::new(network, name));
        let (handle, events) =
            PeerSessionHandle::new(PeerConfig::default(), person.clone(), engine, signaling, inbound_rx);

        let participant = Self {
            id,
            person,
            handle,
            events,
            inbound,
            media: LocalMedia::new(
                Some(LocalTrack::audio(format!("{name}-mic"))),
                Some(LocalTrack::video(format!("{name}-cam"))),
            ),
        };
        participant
            .deliver(ServerMessage::Joined {
                connection_id: id,
                is_host: false,
                permissions: Permissions::full(),
                settings: MeetingSettings::default(),
            })
            .await;
        participant
    }

    fn info(&self) -> PeerInfo {
        PeerInfo {
            connection_id: self.id,
            person: self.person.clone(),
            permissions: Permissions::full(),
            is_host: false,
        }
    }

    async fn deliver(&self, message: ServerMessage) {
        self.inbound.send(message).await.unwrap();
    }

    async fn ready(&self) {
        self.handle.set_local_media(self.media.clone()).await.unwrap();
    }

    async fn wait_for(&self, what: &str, check: impl Fn(&SessionState) -> bool) -> SessionState {
        for _ in 0..200 {
            let state = self.handle.get_state().await.unwrap();
            if check(&state) {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never reached: {what}", self.person.id);
    }

    async fn wait_connected(&self, remote: ConnectionId) {
        self.wait_for("link connected", |s| {
            s.link(remote).is_some_and(|l| l.state == LinkState::Connected)
        })
        .await;
    }

    async fn next_matching(&mut self, check: impl Fn(&PeerEvent) -> bool) -> PeerEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), self.events.recv())
                .await
                .expect("no matching event in time")
                .expect("event stream closed");
            if check(&event) {
                return event;
            }
        }
    }
}

async fn connected_pair(network: &FakeNetwork) -> (Participant, Participant) {
    let relay = Relay::default();
    let a = Participant::spawn(&relay, network, "a").await;
    let b = Participant::spawn(&relay, network, "b").await;
    a.ready().await;
    b.ready().await;

    // b is the newcomer and offers to a
    b.deliver(ServerMessage::Roster {
        peers: vec![a.info()],
    })
    .await;
    a.wait_connected(b.id).await;
    b.wait_connected(a.id).await;
    (a, b)
}

#[tokio::test]
async fn test_roster_newcomer_connects_and_sees_tracks() {
    let network = FakeNetwork::new();
    let (mut a, b) = connected_pair(&network).await;

    let state = b.handle.get_state().await.unwrap();
    let link = state.link(a.id).unwrap();
    assert!(link.outbound);
    assert_eq!(link.person.as_ref(), Some(&a.person));

    // The answering side learned who offered
    let state = a.handle.get_state().await.unwrap();
    assert_eq!(state.link(b.id).unwrap().person.as_ref(), Some(&b.person));
    assert!(!state.link(b.id).unwrap().outbound);

    let track = a
        .next_matching(|e| matches!(e, PeerEvent::RemoteTrack { .. }))
        .await;
    match track {
        PeerEvent::RemoteTrack { remote, track } => {
            assert_eq!(remote, b.id);
            assert!(track.id.starts_with("b-"));
        }
        other => panic!("expected remote track, got {other:?}"),
    }
    assert_eq!(network.connected_pairs(), 1);
    a.wait_for("remote candidates applied", |_| network.candidates_applied("a") > 0)
        .await;
}

#[tokio::test]
async fn test_simultaneous_offers_settle_on_one_link() {
    for _ in 0..10 {
        let network = FakeNetwork::new();
        let relay = Relay::default();
        let a = Participant::spawn(&relay, &network, "a").await;
        let b = Participant::spawn(&relay, &network, "b").await;

        // Both sides decide to negotiate before media is ready
        a.handle.initiate(b.id, Some(b.person.clone())).await.unwrap();
        b.handle.initiate(a.id, Some(a.person.clone())).await.unwrap();
        a.wait_for("queued", |s| s.pending == vec![b.id]).await;
        b.wait_for("queued", |s| s.pending == vec![a.id]).await;

        tokio::join!(a.ready(), b.ready());

        a.wait_connected(b.id).await;
        b.wait_connected(a.id).await;

        // Exactly one side's offer survived
        let a_state = a.handle.get_state().await.unwrap();
        let b_state = b.handle.get_state().await.unwrap();
        assert_eq!(a_state.links.len(), 1);
        assert_eq!(b_state.links.len(), 1);
        assert_ne!(
            a_state.link(b.id).unwrap().outbound,
            b_state.link(a.id).unwrap().outbound
        );

        assert_eq!(network.connected_pairs(), 1);
        assert_eq!(network.open_links("a"), 1);
        assert_eq!(network.open_links("b"), 1);
    }
}

#[tokio::test]
async fn test_peer_left_tears_down_both_ends() {
    let network = FakeNetwork::new();
    let (mut a, mut b) = connected_pair(&network).await;

    a.deliver(ServerMessage::PeerLeft {
        connection_id: b.id,
        person_id: PersonId::new("b"),
    })
    .await;

    a.next_matching(|e| matches!(e, PeerEvent::LinkClosed { remote, .. } if *remote == b.id))
        .await;
    let closed = b
        .next_matching(|e| matches!(e, PeerEvent::LinkClosed { .. }))
        .await;
    assert_eq!(
        closed,
        PeerEvent::LinkClosed {
            remote: a.id,
            state: LinkState::Closed,
        }
    );
    assert_eq!(network.connected_pairs(), 0);
    assert!(a.handle.get_state().await.unwrap().links.is_empty());
    assert!(b.handle.get_state().await.unwrap().links.is_empty());
}

#[tokio::test]
async fn test_screen_share_swaps_video_on_every_link() {
    let network = FakeNetwork::new();
    let (mut a, b) = connected_pair(&network).await;

    a.handle
        .start_screen_share(LocalTrack::video("a-screen"))
        .await
        .unwrap();
    a.next_matching(|e| matches!(e, PeerEvent::ScreenShare { granted: true }))
        .await;
    let offers_before = network.offers_created();
    let sending = |id: &str| {
        let expected = Some(id.to_string());
        let network = network.clone();
        let remote = b.id;
        move |_: &SessionState| network.video_tracks("a").get(&remote) == Some(&expected)
    };

    let state = a.wait_for("screen on link", sending("a-screen")).await;
    assert!(state.screen_sharing);

    a.handle.stop_screen_share().await.unwrap();
    let state = a.wait_for("camera on link", sending("a-cam")).await;
    assert!(!state.screen_sharing);

    // Swapping tracks does not renegotiate
    assert_eq!(network.offers_created(), offers_before);
}

#[tokio::test]
async fn test_revoked_screen_share_restores_camera() {
    let network = FakeNetwork::new();
    let (mut a, b) = connected_pair(&network).await;

    a.handle
        .start_screen_share(LocalTrack::video("a-screen"))
        .await
        .unwrap();
    a.wait_for("sharing", |s| s.screen_sharing).await;

    let revoked = Permissions {
        can_screen_share: false,
        ..Permissions::full()
    };
    a.deliver(ServerMessage::PermissionsChanged {
        permissions: revoked,
    })
    .await;
    a.next_matching(|e| matches!(e, PeerEvent::PermissionsChanged(_)))
        .await;

    let state = a.handle.get_state().await.unwrap();
    assert!(!state.screen_sharing);
    assert_eq!(state.permissions, revoked);
    a.wait_for("camera restored", |_| {
        network.video_tracks("a").get(&b.id) == Some(&Some("a-cam".to_string()))
    })
    .await;
    // Audio and camera stay as they were
    assert!(a.media.audio.as_ref().unwrap().is_enabled());
    assert!(a.media.video.as_ref().unwrap().is_enabled());
}

#[tokio::test]
async fn test_fresh_offer_after_teardown_reconnects() {
    let network = FakeNetwork::new();
    let (a, b) = connected_pair(&network).await;
    let offers_before = network.offers_created();

    // a drops its link and negotiates again
    a.deliver(ServerMessage::PeerLeft {
        connection_id: b.id,
        person_id: PersonId::new("b"),
    })
    .await;
    a.wait_for("link gone", |s| s.links.is_empty()).await;
    a.handle.initiate(b.id, None).await.unwrap();

    a.wait_connected(b.id).await;
    b.wait_connected(a.id).await;
    assert_eq!(network.offers_created(), offers_before + 1);
    assert_eq!(network.connected_pairs(), 1);
    assert_eq!(network.open_links("b"), 1);
}

#[tokio::test]
async fn test_link_answered_before_media_is_reoffered_once_ready() {
    let network = FakeNetwork::new();
    let relay = Relay::default();
    let a = Participant::spawn(&relay, &network, "a").await;
    let mut b = Participant::spawn(&relay, &network, "b").await;
    b.ready().await;

    // a answers b's offer while it still has nothing to send
    b.deliver(ServerMessage::Roster {
        peers: vec![a.info()],
    })
    .await;
    a.wait_connected(b.id).await;
    b.wait_connected(a.id).await;
    assert!(!a.handle.get_state().await.unwrap().link(b.id).unwrap().outbound);

    a.ready().await;

    let track = b
        .next_matching(
            |e| matches!(e, PeerEvent::RemoteTrack { track, .. } if track.id == "a-mic"),
        )
        .await;
    match track {
        PeerEvent::RemoteTrack { remote, .. } => assert_eq!(remote, a.id),
        other => panic!("expected remote track, got {other:?}"),
    }

    let state = a
        .wait_for("re-offered link connected", |s| {
            s.link(b.id)
                .is_some_and(|l| l.outbound && l.state == LinkState::Connected)
        })
        .await;
    assert_eq!(state.links.len(), 1);
    b.wait_connected(a.id).await;
    assert_eq!(network.connected_pairs(), 1);
}
