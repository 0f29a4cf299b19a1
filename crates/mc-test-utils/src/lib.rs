//! # MC Test Utilities
//!
//! Shared test utilities for the Meeting Controller (MC) service.
//!
//! This crate provides mock implementations and test fixtures for
//! isolated MC testing without sockets or real storage.
//!
//! ## Modules
//!
//! - `fixtures` - Pre-configured meeting records and people
//! - `mock_store` - Scriptable meeting store that can fail on demand
//! - `client` - In-process connection that joins through the controller
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mc_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let store = MockMeetingStore::with_meetings([TestMeeting::new("standup").build()]);
//!     let controller = spawn_controller(store.clone());
//!
//!     let mut host = TestClient::join(&controller, "standup", host()).await;
//!     host.expect_handshake().await;
//!
//!     // Run your test...
//! }
//! ```
//!
//! ## Test Patterns
//!
//! ### Store Failure Tests
//!
//! ```rust,ignore
//! let store = MockMeetingStore::with_meetings([meeting]).fail_saves(usize::MAX);
//!
//! // Admission path exhausts its retries and reports a transient error
//! host.send(ClientMessage::Admit { .. }).await;
//! assert!(matches!(host.next().await, ServerMessage::Error { .. }));
//! ```

pub mod client;
pub mod fixtures;
pub mod mock_store;

// Re-export commonly used items
pub use client::*;
pub use fixtures::*;
pub use mock_store::*;
