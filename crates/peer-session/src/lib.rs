//! Peer Session Library
//!
//! The participant side of a meeting. A [`PeerSessionHandle`] follows the
//! coordinator's event stream and keeps one media link per remote
//! connection, negotiating each over the signaling channel.
//!
//! # Architecture
//!
//! ```text
//! PeerSessionActor (one per participant connection)
//! └── LinkActor (one per remote connection)
//! ```
//!
//! Negotiation on a link is serialized by its `LinkActor`. The session
//! resolves offer glare and defers negotiation until local media is ready.
//!
//! # Modules
//!
//! - [`chat`] - Chat log with optimistic send and de-duplication
//! - [`config`] - Session configuration from environment
//! - [`engine`] - Media engine abstraction and an in-process fake
//! - [`errors`] - Error types
//! - [`link`] - Link state machine and actor
//! - [`session`] - Session actor and handle
//! - [`transport`] - WebSocket connection to the coordinator

pub mod chat;
pub mod config;
pub mod engine;
pub mod errors;
pub mod link;
pub mod session;
pub mod transport;

pub use chat::{ChatLog, DedupKey, Received};
pub use config::PeerConfig;
pub use engine::{LocalMedia, LocalTrack, MediaEngine, PeerLink, RemoteTrack, TrackKind};
pub use errors::PeerError;
pub use link::LinkState;
pub use session::{LinkInfo, PeerEvent, PeerSessionHandle, SessionState};
pub use transport::SignalingClient;
