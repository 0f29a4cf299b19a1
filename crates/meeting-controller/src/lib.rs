//! Meeting Controller (MC) Service Library
//!
//! The Meeting Controller is the server-side session coordinator for live
//! meetings. It is responsible for:
//!
//! - Room membership and admission (waiting room, host admit/deny)
//! - Presence: roster delivery and `peer-joined` / `peer-left` broadcasts
//! - Propagating host-controlled permissions and settings to every open
//!   connection of a person
//! - Relaying offer/answer/candidate messages between admitted endpoints
//! - Sequencing, persisting and fanning out chat
//!
//! # Architecture
//!
//! ```text
//! MeetingControllerActor (singleton per process, the session store)
//! └── MeetingActor (one per live room)
//!     └── ConnectionActor (one per joined WebSocket)
//! ```
//!
//! Each room is a single writer: every message for a meeting is processed in
//! order by its `MeetingActor`, so admission, presence and chat sequencing
//! never race.
//!
//! # Modules
//!
//! - [`actors`] - Actor model implementation
//! - [`admission`] - Pure admission evaluation
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with client-facing error codes
//! - [`observability`] - Health endpoints and Prometheus metrics
//! - [`store`] - Durable meeting records and chat history
//! - [`transport`] - WebSocket signaling route

pub mod actors;
pub mod admission;
pub mod config;
pub mod errors;
pub mod observability;
pub mod store;
pub mod transport;
