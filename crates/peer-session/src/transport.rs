//! WebSocket connection to the coordinator.
//!
//! One task owns the socket. It forwards decoded [`ServerMessage`]s to the
//! session and writes queued [`ClientMessage`]s as text frames. When the
//! socket closes the inbound channel closes with it, which the session
//! reports as [`crate::PeerEvent::Disconnected`].

use crate::errors::PeerError;

use common::protocol::{ClientMessage, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Buffer for frames in either direction.
const SIGNALING_CHANNEL_BUFFER: usize = 128;

/// Owner of the coordinator socket task.
#[derive(Debug)]
pub struct SignalingClient {
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

impl SignalingClient {
    /// Connect to `url`.
    ///
    /// Returns the client, the sender for outbound messages and the receiver
    /// of coordinator messages, ready to hand to a peer session.
    ///
    /// # Errors
    ///
    /// Returns `PeerError::Signaling` if the WebSocket handshake fails.
    pub async fn connect(
        url: &str,
    ) -> Result<
        (
            Self,
            mpsc::Sender<ClientMessage>,
            mpsc::Receiver<ServerMessage>,
        ),
        PeerError,
    > {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| PeerError::Signaling(format!("connect to {url} failed: {e}")))?;
        info!(target: "peer.signaling", url = %url, "Connected to coordinator");

        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound) = mpsc::channel::<ClientMessage>(SIGNALING_CHANNEL_BUFFER);
        let (inbound_tx, inbound) = mpsc::channel::<ServerMessage>(SIGNALING_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }

                    message = outbound.recv() => {
                        let Some(message) = message else {
                            let _ = write.send(Message::Close(None)).await;
                            break;
                        };
                        let frame = match message.encode() {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!(target: "peer.signaling", error = %e, "Dropping unencodable message");
                                continue;
                            }
                        };
                        if let Err(e) = write.send(Message::Text(frame)).await {
                            warn!(target: "peer.signaling", error = %e, "Socket write failed");
                            break;
                        }
                    }

                    frame = read.next() => {
                        match frame {
                            Some(Ok(Message::Text(text))) => match ServerMessage::decode(&text) {
                                Ok(message) => {
                                    if inbound_tx.send(message).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    warn!(target: "peer.signaling", error = %e, "Ignoring malformed frame");
                                }
                            },
                            Some(Ok(Message::Close(_))) | None => {
                                debug!(target: "peer.signaling", "Coordinator closed the socket");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(target: "peer.signaling", error = %e, "Socket read failed");
                                break;
                            }
                        }
                    }
                }
            }
            debug!(target: "peer.signaling", "Signaling task stopped");
        });

        Ok((Self { cancel_token, task }, outbound_tx, inbound))
    }

    /// Close the socket gracefully.
    pub fn close(&self) {
        self.cancel_token.cancel();
    }

    /// Drop the socket without a close handshake, as a crashed client would.
    pub fn abort(&self) {
        self.task.abort();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
