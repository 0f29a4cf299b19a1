//! End-to-end tests for the WebSocket signaling route.
//!
//! Binds the real router on an ephemeral port and talks to it with a
//! tungstenite client.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::protocol::{ClientMessage, ErrorKind, ServerMessage};
use common::types::{AdmissionStatus, MeetingId, Permissions};
use futures_util::{SinkExt, StreamExt};
use mc_test_utils::{guest, host, spawn_controller, MockMeetingStore, TestMeeting};
use meeting_controller::transport::{signaling_router, SignalingState, TransportConfig};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const MEETING: &str = "all-hands";
const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server(store: MockMeetingStore, config: TransportConfig) -> SocketAddr {
    let state = Arc::new(SignalingState {
        controller: spawn_controller(store),
        config,
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, signaling_router(state)).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr) -> Socket {
    let (socket, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    socket
}

async fn send(socket: &mut Socket, message: &ClientMessage) {
    socket
        .send(Message::Text(message.encode().unwrap()))
        .await
        .unwrap();
}

async fn send_join(socket: &mut Socket, person: common::types::Person) {
    send(
        socket,
        &ClientMessage::Join {
            meeting_id: MeetingId::new(MEETING),
            person,
        },
    )
    .await;
}

/// Next event, or `None` once the server closes the socket.
async fn recv(socket: &mut Socket) -> Option<ServerMessage> {
    loop {
        let frame = tokio::time::timeout(FRAME_TIMEOUT, socket.next())
            .await
            .expect("no frame from server in time");
        match frame {
            Some(Ok(Message::Text(text))) => return Some(ServerMessage::decode(&text).unwrap()),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(other)) => panic!("unexpected frame {other:?}"),
        }
    }
}

async fn expect_event(socket: &mut Socket) -> ServerMessage {
    recv(socket).await.expect("socket closed")
}

async fn handshake(socket: &mut Socket) -> ServerMessage {
    let joined = expect_event(socket).await;
    assert!(matches!(joined, ServerMessage::Joined { .. }), "{joined:?}");
    assert!(matches!(
        expect_event(socket).await,
        ServerMessage::ChatHistory { .. }
    ));
    assert!(matches!(
        expect_event(socket).await,
        ServerMessage::Roster { .. }
    ));
    send(socket, &ClientMessage::RosterAck).await;
    joined
}

fn open_store() -> MockMeetingStore {
    MockMeetingStore::with_meetings([TestMeeting::new(MEETING).open().build()])
}

#[tokio::test]
async fn test_host_joins_over_websocket() {
    let addr = start_server(open_store(), TransportConfig::default()).await;
    let mut socket = connect(addr).await;

    send_join(&mut socket, host()).await;
    match handshake(&mut socket).await {
        ServerMessage::Joined {
            is_host,
            permissions,
            ..
        } => {
            assert!(is_host);
            assert_eq!(permissions, Permissions::full());
        }
        other => panic!("expected joined, got {other:?}"),
    }
}

#[tokio::test]
async fn test_bad_frames_before_join_keep_socket_open() {
    let addr = start_server(open_store(), TransportConfig::default()).await;
    let mut socket = connect(addr).await;

    socket
        .send(Message::Text("{\"type\":\"bogus\"}".to_string()))
        .await
        .unwrap();
    match expect_event(&mut socket).await {
        ServerMessage::Error { kind, .. } => assert_eq!(kind, ErrorKind::InvalidState),
        other => panic!("expected error, got {other:?}"),
    }

    send(&mut socket, &ClientMessage::RequestRoster).await;
    match expect_event(&mut socket).await {
        ServerMessage::Error { message, .. } => assert!(message.contains("Join required")),
        other => panic!("expected error, got {other:?}"),
    }

    send_join(&mut socket, guest("g-1")).await;
    handshake(&mut socket).await;
}

#[tokio::test]
async fn test_unknown_meeting_reports_not_found() {
    let addr = start_server(MockMeetingStore::new(), TransportConfig::default()).await;
    let mut socket = connect(addr).await;

    send_join(&mut socket, guest("g-1")).await;
    match expect_event(&mut socket).await {
        ServerMessage::Error { kind, .. } => assert_eq!(kind, ErrorKind::NotFound),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_denied_person_is_told_and_disconnected() {
    let store = MockMeetingStore::with_meetings([TestMeeting::new(MEETING)
        .with_participant(guest("banned"), AdmissionStatus::Denied, Permissions::default())
        .build()]);
    let addr = start_server(store, TransportConfig::default()).await;
    let mut socket = connect(addr).await;

    send_join(&mut socket, guest("banned")).await;
    assert_eq!(recv(&mut socket).await, Some(ServerMessage::Denied));
    assert_eq!(recv(&mut socket).await, None);
}

#[tokio::test]
async fn test_dropped_socket_announces_peer_left() {
    let addr = start_server(open_store(), TransportConfig::default()).await;

    let mut staying = connect(addr).await;
    send_join(&mut staying, host()).await;
    handshake(&mut staying).await;

    let mut leaving = connect(addr).await;
    send_join(&mut leaving, guest("g-1")).await;
    let leaving_id = match handshake(&mut leaving).await {
        ServerMessage::Joined { connection_id, .. } => connection_id,
        other => panic!("expected joined, got {other:?}"),
    };
    assert!(matches!(
        expect_event(&mut staying).await,
        ServerMessage::PeerJoined { peer } if peer.connection_id == leaving_id
    ));

    drop(leaving);

    match expect_event(&mut staying).await {
        ServerMessage::PeerLeft { connection_id, .. } => assert_eq!(connection_id, leaving_id),
        other => panic!("expected peer-left, got {other:?}"),
    }
}

#[tokio::test]
async fn test_idle_socket_is_closed() {
    let config = TransportConfig {
        ping_interval: Duration::from_secs(30),
        idle_timeout: Duration::from_millis(200),
    };
    let addr = start_server(open_store(), config).await;
    let mut socket = connect(addr).await;

    send_join(&mut socket, guest("g-1")).await;
    handshake(&mut socket).await;

    assert_eq!(recv(&mut socket).await, None);
}
