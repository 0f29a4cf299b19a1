//! `ConnectionActor` - per-socket outbound actor.
//!
//! Each `ConnectionActor`:
//! - Serves exactly one signaling socket that has joined a room
//! - Forwards events from its `MeetingActor` to the socket writer, in order
//! - Closes the socket when asked to, or when its room is cancelled
//!
//! The room never awaits a slow client. [`ConnectionActorHandle::send`] uses
//! `try_send`; when the mailbox is full the connection is evicted instead.
//!
//! # Lifecycle
//!
//! 1. Spawned by the `MeetingActor` once a join is evaluated as waiting or admitted
//! 2. Runs until the room closes it, the socket writer goes away, or the room is cancelled
//! 3. Cancellation via child token propagates from `MeetingActor`

use super::messages::{CloseReason, ConnectionMessage};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use common::protocol::ServerMessage;
use common::types::{ConnectionId, MeetingId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the connection mailbox.
pub const CONNECTION_CHANNEL_BUFFER: usize = 200;

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    connection_id: ConnectionId,
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionActorHandle {
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Queue an event for the client without waiting.
    ///
    /// Returns `false` if the event could not be queued. A full mailbox
    /// evicts the connection; the caller should treat it as departed.
    pub fn send(&self, message: ServerMessage) -> bool {
        match self.sender.try_send(ConnectionMessage::Send { message }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.mailbox.record_drop();
                warn!(
                    target: "mc.actor.connection",
                    connection_id = %self.connection_id,
                    "Connection mailbox full, evicting slow consumer"
                );
                self.cancel_token.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the actor to flush queued events and close the socket.
    ///
    /// Falls back to cancellation if the close request cannot be queued.
    pub fn close(&self, reason: CloseReason) {
        if self
            .sender
            .try_send(ConnectionMessage::Close { reason })
            .is_err()
        {
            self.cancel_token.cancel();
        }
    }

    /// Cancel the connection actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    connection_id: ConnectionId,
    meeting_id: MeetingId,
    receiver: mpsc::Receiver<ConnectionMessage>,
    /// Outbound sink of the socket writer task.
    outbound: mpsc::Sender<ServerMessage>,
    /// Cancelling this closes the socket.
    transport_token: CancellationToken,
    /// Cancellation token (child of meeting's token).
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionActor {
    /// Spawn a new connection actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        connection_id: ConnectionId,
        meeting_id: MeetingId,
        outbound: mpsc::Sender<ServerMessage>,
        transport_token: CancellationToken,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);
        let mailbox = Arc::new(MailboxMonitor::new(
            ActorType::Connection,
            connection_id.to_string(),
            CONNECTION_CHANNEL_BUFFER,
        ));

        metrics.connection_created();

        let actor = Self {
            connection_id,
            meeting_id,
            receiver,
            outbound,
            transport_token,
            cancel_token: cancel_token.clone(),
            metrics,
            mailbox: Arc::clone(&mailbox),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            connection_id,
            mailbox,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "mc.actor.connection",
        fields(connection_id = %self.connection_id, meeting_id = %self.meeting_id)
    )]
    async fn run(mut self) {
        debug!(
            target: "mc.actor.connection",
            connection_id = %self.connection_id,
            meeting_id = %self.meeting_id,
            "ConnectionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "mc.actor.connection",
                        connection_id = %self.connection_id,
                        "ConnectionActor received cancellation signal"
                    );
                    break;
                }

                () = self.transport_token.cancelled() => {
                    debug!(
                        target: "mc.actor.connection",
                        connection_id = %self.connection_id,
                        "Transport closed, exiting"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            let should_exit = self.handle_message(message).await;
                            self.mailbox.observe(self.receiver.len());

                            if should_exit {
                                break;
                            }
                        }
                        None => {
                            debug!(
                                target: "mc.actor.connection",
                                connection_id = %self.connection_id,
                                "ConnectionActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        // The writer drains whatever is already in `outbound` before closing
        self.transport_token.cancel();
        self.metrics.connection_closed();

        info!(
            target: "mc.actor.connection",
            connection_id = %self.connection_id,
            messages_processed = self.mailbox.messages_processed(),
            "ConnectionActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: ConnectionMessage) -> bool {
        match message {
            ConnectionMessage::Send { message } => {
                let message_type = message.message_type();
                // A writer that stopped reading must not pin this actor past eviction
                tokio::select! {
                    result = self.outbound.send(message) => {
                        if result.is_err() {
                            debug!(
                                target: "mc.actor.connection",
                                connection_id = %self.connection_id,
                                message_type = message_type,
                                "Socket writer gone, dropping event"
                            );
                            return true;
                        }
                        false
                    }
                    () = self.cancel_token.cancelled() => true,
                    () = self.transport_token.cancelled() => true,
                }
            }

            ConnectionMessage::Close { reason } => {
                debug!(
                    target: "mc.actor.connection",
                    connection_id = %self.connection_id,
                    reason = reason.as_str(),
                    "Closing connection"
                );
                true
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spawn_actor(
        buffer: usize,
    ) -> (
        ConnectionActorHandle,
        JoinHandle<()>,
        mpsc::Receiver<ServerMessage>,
        CancellationToken,
        CancellationToken,
    ) {
        let (outbound, outbound_rx) = mpsc::channel(buffer);
        let transport = CancellationToken::new();
        let parent = CancellationToken::new();
        let (handle, task) = ConnectionActor::spawn(
            ConnectionId::new(),
            MeetingId::new("meeting-1"),
            outbound,
            transport.clone(),
            parent.child_token(),
            ActorMetrics::new(),
        );
        (handle, task, outbound_rx, transport, parent)
    }

    #[tokio::test]
    async fn test_connection_actor_forwards_in_order() {
        let (handle, _task, mut rx, _transport, _parent) = spawn_actor(16);

        assert!(handle.send(ServerMessage::Waiting));
        assert!(handle.send(ServerMessage::Denied));

        assert_eq!(rx.recv().await, Some(ServerMessage::Waiting));
        assert_eq!(rx.recv().await, Some(ServerMessage::Denied));

        handle.cancel();
    }

    #[tokio::test]
    async fn test_connection_actor_close_flushes_then_closes_transport() {
        let (handle, task, mut rx, transport, _parent) = spawn_actor(16);

        handle.send(ServerMessage::Removed);
        handle.close(CloseReason::Removed);

        let result = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(result.is_ok());
        assert!(transport.is_cancelled());
        assert_eq!(rx.recv().await, Some(ServerMessage::Removed));
    }

    #[tokio::test]
    async fn test_connection_actor_parent_cancellation() {
        let (_handle, task, _rx, transport, parent) = spawn_actor(16);

        parent.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(result.is_ok());
        assert!(transport.is_cancelled());
    }

    #[tokio::test]
    async fn test_connection_actor_exits_when_transport_closes() {
        let (handle, task, _rx, transport, _parent) = spawn_actor(16);

        transport.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(result.is_ok());
        assert!(!handle.send(ServerMessage::Waiting));
    }

    #[tokio::test]
    async fn test_slow_consumer_is_evicted() {
        // Writer buffer of one that nobody reads, so the actor blocks on the
        // second event and its mailbox fills up behind it.
        let (handle, task, _rx, transport, _parent) = spawn_actor(1);

        let mut accepted = 0;
        for _ in 0..(CONNECTION_CHANNEL_BUFFER + 10) {
            if handle.send(ServerMessage::Waiting) {
                accepted += 1;
            } else {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(accepted <= CONNECTION_CHANNEL_BUFFER + 2);
        assert!(handle.is_cancelled());

        let result = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(result.is_ok());
        assert!(transport.is_cancelled());
    }
}
