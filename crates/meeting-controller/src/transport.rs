//! WebSocket signaling transport.
//!
//! One socket carries one connection. The first text frame must be a `join`;
//! every later frame is forwarded to the room the join landed in. Outbound
//! events are written by a dedicated writer task fed from an mpsc channel,
//! which is the sink handed to the room's `ConnectionActor`.
//!
//! The socket closes when:
//! - the client closes it or stops sending frames for the idle timeout
//! - the room closes the connection (leave, deny, removal, slow consumer, shutdown)

use crate::actors::{JoinOutcome, MeetingActorHandle, MeetingControllerActorHandle};
use crate::config::Config;
use crate::errors::McError;
use crate::observability::metrics as prom;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use common::protocol::{ClientMessage, ServerMessage};
use common::types::ConnectionId;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Buffer between a connection actor and the socket writer.
const OUTBOUND_BUFFER: usize = 64;

/// Time the writer gets to flush and close after the reader exits.
const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Socket tunables, derived from [`Config`].
#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl TransportConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            ping_interval: config.ws_ping_interval,
            idle_timeout: config.ws_idle_timeout,
        }
    }
}

/// Shared state for the signaling router.
#[derive(Clone)]
pub struct SignalingState {
    pub controller: MeetingControllerActorHandle,
    pub config: TransportConfig,
}

/// Create the signaling router (`GET /ws`).
pub fn signaling_router(state: Arc<SignalingState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<SignalingState>>) -> Response {
    let connection_id = ConnectionId::new();
    ws.on_upgrade(move |socket| handle_socket(socket, connection_id, state))
}

/// Why the reader stopped.
enum ReadEnd {
    /// Peer closed, errored, or went idle.
    Transport,
    /// The room closed the connection.
    Closed,
}

#[instrument(skip_all, name = "mc.transport.ws", fields(connection_id = %connection_id))]
async fn handle_socket(socket: WebSocket, connection_id: ConnectionId, state: Arc<SignalingState>) {
    let started = Instant::now();
    prom::record_signaling_connection("opened");

    let (ws_tx, ws_rx) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let transport_token = CancellationToken::new();

    let writer = tokio::spawn(run_writer(
        ws_tx,
        outbound_rx,
        transport_token.clone(),
        state.config.ping_interval,
        connection_id,
    ));

    let mut reader = Reader {
        connection_id,
        ws_rx,
        outbound: outbound_tx,
        transport_token: transport_token.clone(),
        idle_timeout: state.config.idle_timeout,
    };

    if let Some(room) = reader.await_join(&state.controller).await {
        let end = reader.forward(&room).await;
        if matches!(end, ReadEnd::Transport) {
            // Same departure path as leave; unknown connections are ignored by the room
            if let Err(e) = room.connection_disconnected(connection_id).await {
                debug!(
                    target: "mc.transport.ws",
                    connection_id = %connection_id,
                    error = %e,
                    "Room gone before disconnect was delivered"
                );
            }
        }
    }

    transport_token.cancel();
    drop(reader);

    if tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, writer)
        .await
        .is_err()
    {
        warn!(
            target: "mc.transport.ws",
            connection_id = %connection_id,
            "Socket writer did not finish in time"
        );
    }

    prom::record_signaling_connection("closed");
    prom::record_signaling_session_duration(started.elapsed());

    info!(
        target: "mc.transport.ws",
        connection_id = %connection_id,
        duration_secs = started.elapsed().as_secs(),
        "Signaling socket closed"
    );
}

struct Reader {
    connection_id: ConnectionId,
    ws_rx: SplitStream<WebSocket>,
    outbound: mpsc::Sender<ServerMessage>,
    transport_token: CancellationToken,
    idle_timeout: Duration,
}

impl Reader {
    /// Read frames until a join succeeds. `None` means the socket is done.
    async fn await_join(&mut self, controller: &MeetingControllerActorHandle) -> Option<MeetingActorHandle> {
        loop {
            let text = match self.next_text().await {
                Ok(text) => text,
                Err(_) => return None,
            };

            let message = match ClientMessage::decode(&text) {
                Ok(message) => message,
                Err(e) => {
                    self.send_error(&McError::Protocol(e.to_string())).await;
                    continue;
                }
            };

            let ClientMessage::Join { meeting_id, person } = message else {
                self.send_error(&McError::InvalidState("Join required".to_string()))
                    .await;
                continue;
            };

            debug!(
                target: "mc.transport.ws",
                connection_id = %self.connection_id,
                meeting_id = %meeting_id,
                "Join requested"
            );

            match controller
                .join(
                    meeting_id,
                    self.connection_id,
                    person,
                    self.outbound.clone(),
                    self.transport_token.clone(),
                )
                .await
            {
                Ok((_, JoinOutcome::Denied)) => {
                    prom::record_signaling_connection("rejected");
                    return None;
                }
                Ok((room, _)) => {
                    prom::record_signaling_connection("joined");
                    return Some(room);
                }
                Err(e) => {
                    prom::record_signaling_connection("rejected");
                    self.send_error(&e).await;
                }
            }
        }
    }

    /// Forward every frame to the room until either side ends the connection.
    async fn forward(&mut self, room: &MeetingActorHandle) -> ReadEnd {
        loop {
            let text = match self.next_text().await {
                Ok(text) => text,
                Err(end) => return end,
            };

            match ClientMessage::decode(&text) {
                Ok(message) => {
                    if let Err(e) = room.inbound(self.connection_id, message).await {
                        warn!(
                            target: "mc.transport.ws",
                            connection_id = %self.connection_id,
                            error = %e,
                            "Room unavailable, closing socket"
                        );
                        return ReadEnd::Closed;
                    }
                }
                Err(e) => self.send_error(&McError::Protocol(e.to_string())).await,
            }
        }
    }

    /// Next text frame, skipping control frames.
    async fn next_text(&mut self) -> Result<String, ReadEnd> {
        loop {
            let frame = tokio::select! {
                () = self.transport_token.cancelled() => return Err(ReadEnd::Closed),
                frame = tokio::time::timeout(self.idle_timeout, self.ws_rx.next()) => frame,
            };

            match frame {
                Err(_) => {
                    prom::record_signaling_connection("idle_timeout");
                    debug!(
                        target: "mc.transport.ws",
                        connection_id = %self.connection_id,
                        "Socket idle, closing"
                    );
                    return Err(ReadEnd::Transport);
                }
                Ok(None | Some(Ok(Message::Close(_)))) => return Err(ReadEnd::Transport),
                Ok(Some(Err(e))) => {
                    debug!(
                        target: "mc.transport.ws",
                        connection_id = %self.connection_id,
                        error = %e,
                        "Socket read failed"
                    );
                    return Err(ReadEnd::Transport);
                }
                Ok(Some(Ok(Message::Text(text)))) => return Ok(text),
                Ok(Some(Ok(Message::Binary(_)))) => {
                    self.send_error(&McError::Protocol("Binary frames are not supported".to_string()))
                        .await;
                }
                Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
            }
        }
    }

    async fn send_error(&self, err: &McError) {
        prom::record_error("transport", err.error_type_label(), err.status_code());
        let _ = self.outbound.send(err.to_server_message()).await;
    }
}

async fn run_writer(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerMessage>,
    transport_token: CancellationToken,
    ping_interval: Duration,
    connection_id: ConnectionId,
) {
    let mut ping = tokio::time::interval(ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ping.tick().await;

    loop {
        tokio::select! {
            biased;

            message = outbound.recv() => {
                let Some(message) = message else { break };
                if write_event(&mut ws_tx, &message, connection_id).await.is_err() {
                    transport_token.cancel();
                    return;
                }
            }

            () = transport_token.cancelled() => {
                // Deliver whatever the room queued before closing (denied, removed, ...)
                while let Ok(message) = outbound.try_recv() {
                    if write_event(&mut ws_tx, &message, connection_id).await.is_err() {
                        return;
                    }
                }
                break;
            }

            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    transport_token.cancel();
                    return;
                }
            }
        }
    }

    let _ = ws_tx.send(Message::Close(None)).await;
    let _ = ws_tx.close().await;
}

async fn write_event(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
    connection_id: ConnectionId,
) -> Result<(), ()> {
    let text = match message.encode() {
        Ok(text) => text,
        Err(e) => {
            warn!(
                target: "mc.transport.ws",
                connection_id = %connection_id,
                message_type = message.message_type(),
                error = %e,
                "Failed to encode event, skipping"
            );
            return Ok(());
        }
    };

    ws_tx.send(Message::Text(text)).await.map_err(|e| {
        debug!(
            target: "mc.transport.ws",
            connection_id = %connection_id,
            error = %e,
            "Socket write failed"
        );
    })
}
