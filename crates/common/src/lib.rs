//! Common utilities and types shared across meeting components.
//!
//! Both the server-side coordinator (`meeting-controller`) and the
//! client-side negotiation logic (`peer-session`) depend on this crate, so
//! anything that crosses the signaling wire lives here.

#![warn(clippy::pedantic)]

/// Module for common error types
pub mod error;

/// Module for common data types
pub mod types;

/// Module for the JSON signaling protocol
pub mod protocol;
