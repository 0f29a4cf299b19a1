//! Peer session configuration.

use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default spacing between deferred negotiations once local media is ready.
pub const DEFAULT_NEGOTIATION_STAGGER_MS: u64 = 200;

/// Default STUN server handed to the media engine.
pub const DEFAULT_ICE_SERVERS: &str = "stun:stun.l.google.com:19302";

/// Default coordinator signaling URL.
pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080/ws";

/// Peer session configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Delay between consecutive `initiate` calls when draining the pending queue.
    pub negotiation_stagger: Duration,

    /// ICE server URLs, comma separated in the environment.
    pub ice_servers: Vec<String>,

    /// Coordinator WebSocket URL.
    pub signaling_url: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            negotiation_stagger: Duration::from_millis(DEFAULT_NEGOTIATION_STAGGER_MS),
            ice_servers: vec![DEFAULT_ICE_SERVERS.to_string()],
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PeerConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl PeerConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `PeerConfigError::InvalidValue` if a variable is present but unusable.
    pub fn from_env() -> Result<Self, PeerConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a map of variables.
    ///
    /// # Errors
    ///
    /// Returns `PeerConfigError::InvalidValue` if a variable is present but unusable.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, PeerConfigError> {
        let negotiation_stagger = match vars.get("PEER_NEGOTIATION_STAGGER_MS") {
            None => Duration::from_millis(DEFAULT_NEGOTIATION_STAGGER_MS),
            Some(raw) => raw.trim().parse().map(Duration::from_millis).map_err(|_| {
                PeerConfigError::InvalidValue(format!("PEER_NEGOTIATION_STAGGER_MS={raw}"))
            })?,
        };

        let ice_servers: Vec<String> = vars
            .get("PEER_ICE_SERVERS")
            .map_or(DEFAULT_ICE_SERVERS, String::as_str)
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if ice_servers.is_empty() {
            return Err(PeerConfigError::InvalidValue(
                "PEER_ICE_SERVERS must list at least one server".to_string(),
            ));
        }

        let signaling_url = vars
            .get("PEER_SIGNALING_URL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_URL.to_string());
        if !(signaling_url.starts_with("ws://") || signaling_url.starts_with("wss://")) {
            return Err(PeerConfigError::InvalidValue(format!(
                "PEER_SIGNALING_URL={signaling_url}"
            )));
        }

        Ok(Self {
            negotiation_stagger,
            ice_servers,
            signaling_url,
        })
    }
}
