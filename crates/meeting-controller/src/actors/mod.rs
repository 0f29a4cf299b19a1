//! Actor model implementation for the Meeting Controller.
//!
//! ```text
//! MeetingControllerActor (singleton per process, the session store)
//! └── supervises N MeetingActors
//!     └── MeetingActor (one per live room)
//!         ├── owns endpoints, admitted index and chat sequence
//!         └── supervises N ConnectionActors
//!             └── ConnectionActor (one per joined signaling socket)
//! ```
//!
//! # Key Design Decisions
//!
//! - **One connection per meeting**: A person in two tabs has two endpoints
//! - **Single writer per room**: Every state change for a room happens in its `MeetingActor`
//! - **CancellationToken propagation**: Parent actors pass child tokens for graceful shutdown
//! - **Mailbox monitoring**: Depth thresholds with metrics (Meeting: 100/500, Connection: 50/200)
//! - **Message passing**: All inter-actor communication via `tokio::sync::mpsc` channels
//!
//! # Modules
//!
//! - [`controller`] - `MeetingControllerActor` singleton that creates and collects rooms
//! - [`meeting`] - `MeetingActor` per live room: admission, presence, permissions, relay, chat
//! - [`connection`] - `ConnectionActor` per joined socket
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod connection;
pub mod controller;
pub mod meeting;
pub mod messages;
pub mod metrics;

// Re-export primary types
pub use connection::{ConnectionActor, ConnectionActorHandle};
pub use controller::{ControllerConfig, MeetingControllerActor, MeetingControllerActorHandle};
pub use meeting::{MeetingActor, MeetingActorHandle, RoomConfig};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
