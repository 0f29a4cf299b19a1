//! Meeting Controller configuration.
//!
//! Configuration is loaded from environment variables. Every numeric value
//! that is present but unparseable is rejected rather than defaulted.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default WebSocket signaling bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default MC instance ID prefix.
pub const DEFAULT_MC_ID_PREFIX: &str = "mc";

/// Default maximum number of live rooms.
pub const DEFAULT_MAX_MEETINGS: u32 = 1000;

/// Default maximum number of endpoints in one room.
pub const DEFAULT_MAX_PARTICIPANTS_PER_MEETING: u32 = 100;

/// Default fallback delay before a joiner is announced without a roster ack.
pub const DEFAULT_ANNOUNCE_FALLBACK_MS: u64 = 300;

/// Default interval for the empty-room safety sweep.
pub const DEFAULT_ROOM_SWEEP_INTERVAL_SECONDS: u64 = 300;

/// Default number of chat messages replayed to a joiner.
pub const DEFAULT_CHAT_HISTORY_LIMIT: usize = 100;

/// Default attempts for durable writes on admission and permission paths.
pub const DEFAULT_STORE_RETRY_ATTEMPTS: u32 = 3;

/// Default linear backoff step between store retries.
pub const DEFAULT_STORE_RETRY_BACKOFF_MS: u64 = 50;

/// Default WebSocket ping interval.
pub const DEFAULT_WS_PING_INTERVAL_SECONDS: u64 = 20;

/// Default WebSocket idle timeout.
pub const DEFAULT_WS_IDLE_TIMEOUT_SECONDS: u64 = 60;

/// Meeting Controller configuration.
#[derive(Clone)]
pub struct Config {
    /// WebSocket signaling bind address (default: "0.0.0.0:8080").
    pub signaling_bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Unique identifier for this MC instance.
    pub mc_id: String,

    /// Maximum concurrent rooms this MC can handle.
    pub max_meetings: u32,

    /// Maximum endpoints per room.
    pub max_participants_per_meeting: u32,

    /// Deadline after roster delivery before the joiner is announced anyway.
    pub announce_fallback: Duration,

    /// Interval of the empty-room sweep.
    pub room_sweep_interval: Duration,

    /// Number of chat messages delivered on admission.
    pub chat_history_limit: usize,

    /// Attempts for durable writes on admission/permission/settings paths.
    pub store_retry_attempts: u32,

    /// Backoff step between store retries.
    pub store_retry_backoff: Duration,

    /// Interval between server pings on the signaling socket.
    pub ws_ping_interval: Duration,

    /// A socket with no inbound traffic for this long is closed.
    pub ws_idle_timeout: Duration,

    /// Optional JSON file seeding the in-memory meeting store.
    pub meetings_file: Option<PathBuf>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("signaling_bind_address", &self.signaling_bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("mc_id", &self.mc_id)
            .field("max_meetings", &self.max_meetings)
            .field(
                "max_participants_per_meeting",
                &self.max_participants_per_meeting,
            )
            .field("announce_fallback", &self.announce_fallback)
            .field("room_sweep_interval", &self.room_sweep_interval)
            .field("chat_history_limit", &self.chat_history_limit)
            .field("store_retry_attempts", &self.store_retry_attempts)
            .field("store_retry_backoff", &self.store_retry_backoff)
            .field("ws_ping_interval", &self.ws_ping_interval)
            .field("ws_idle_timeout", &self.ws_idle_timeout)
            .field("meetings_file", &self.meetings_file)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Parse an optional numeric variable, rejecting garbage.
fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name}={raw}"))),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let signaling_bind_address = vars
            .get("MC_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("MC_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        // Capacity limits
        let max_meetings = parse_var(vars, "MC_MAX_MEETINGS", DEFAULT_MAX_MEETINGS)?;
        let max_participants_per_meeting = parse_var(
            vars,
            "MC_MAX_PARTICIPANTS_PER_MEETING",
            DEFAULT_MAX_PARTICIPANTS_PER_MEETING,
        )?;
        if max_meetings == 0 || max_participants_per_meeting == 0 {
            return Err(ConfigError::InvalidValue(
                "capacity limits must be greater than zero".to_string(),
            ));
        }

        // Room lifecycle timing
        let announce_fallback = Duration::from_millis(parse_var(
            vars,
            "MC_ANNOUNCE_FALLBACK_MS",
            DEFAULT_ANNOUNCE_FALLBACK_MS,
        )?);
        let room_sweep_interval = Duration::from_secs(parse_var(
            vars,
            "MC_ROOM_SWEEP_INTERVAL_SECONDS",
            DEFAULT_ROOM_SWEEP_INTERVAL_SECONDS,
        )?);
        if room_sweep_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "MC_ROOM_SWEEP_INTERVAL_SECONDS must be greater than zero".to_string(),
            ));
        }

        let chat_history_limit =
            parse_var(vars, "MC_CHAT_HISTORY_LIMIT", DEFAULT_CHAT_HISTORY_LIMIT)?;

        // Store retry policy
        let store_retry_attempts = parse_var(
            vars,
            "MC_STORE_RETRY_ATTEMPTS",
            DEFAULT_STORE_RETRY_ATTEMPTS,
        )?
        .max(1);
        let store_retry_backoff = Duration::from_millis(parse_var(
            vars,
            "MC_STORE_RETRY_BACKOFF_MS",
            DEFAULT_STORE_RETRY_BACKOFF_MS,
        )?);

        // Socket keepalive
        let ws_ping_interval = Duration::from_secs(parse_var(
            vars,
            "MC_WS_PING_INTERVAL_SECONDS",
            DEFAULT_WS_PING_INTERVAL_SECONDS,
        )?);
        let ws_idle_timeout = Duration::from_secs(parse_var(
            vars,
            "MC_WS_IDLE_TIMEOUT_SECONDS",
            DEFAULT_WS_IDLE_TIMEOUT_SECONDS,
        )?);
        if ws_ping_interval.is_zero() || ws_idle_timeout <= ws_ping_interval {
            return Err(ConfigError::InvalidValue(
                "MC_WS_IDLE_TIMEOUT_SECONDS must exceed a non-zero MC_WS_PING_INTERVAL_SECONDS"
                    .to_string(),
            ));
        }

        let meetings_file = vars
            .get("MC_MEETINGS_FILE")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        // Generate MC instance ID
        let mc_id = vars.get("MC_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_MC_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            signaling_bind_address,
            health_bind_address,
            mc_id,
            max_meetings,
            max_participants_per_meeting,
            announce_fallback,
            room_sweep_interval,
            chat_history_limit,
            store_retry_attempts,
            store_retry_backoff,
            ws_ping_interval,
            ws_idle_timeout,
            meetings_file,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn base_vars() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let vars = base_vars();

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.signaling_bind_address, DEFAULT_SIGNALING_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert_eq!(config.max_meetings, DEFAULT_MAX_MEETINGS);
        assert_eq!(
            config.max_participants_per_meeting,
            DEFAULT_MAX_PARTICIPANTS_PER_MEETING
        );
        assert_eq!(config.announce_fallback, Duration::from_millis(300));
        assert_eq!(config.room_sweep_interval, Duration::from_secs(300));
        assert_eq!(config.chat_history_limit, 100);
        assert_eq!(config.store_retry_attempts, 3);
        assert_eq!(config.store_retry_backoff, Duration::from_millis(50));
        assert_eq!(config.ws_ping_interval, Duration::from_secs(20));
        assert_eq!(config.ws_idle_timeout, Duration::from_secs(60));
        assert!(config.meetings_file.is_none());
        // MC ID should be auto-generated
        assert!(config.mc_id.starts_with("mc-"));
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let mut vars = base_vars();
        vars.insert(
            "MC_SIGNALING_BIND_ADDRESS".to_string(),
            "127.0.0.1:9090".to_string(),
        );
        vars.insert(
            "MC_HEALTH_BIND_ADDRESS".to_string(),
            "127.0.0.1:8082".to_string(),
        );
        vars.insert("MC_MAX_MEETINGS".to_string(), "500".to_string());
        vars.insert(
            "MC_MAX_PARTICIPANTS_PER_MEETING".to_string(),
            "12".to_string(),
        );
        vars.insert("MC_ANNOUNCE_FALLBACK_MS".to_string(), "150".to_string());
        vars.insert("MC_CHAT_HISTORY_LIMIT".to_string(), "20".to_string());
        vars.insert("MC_STORE_RETRY_ATTEMPTS".to_string(), "5".to_string());
        vars.insert(
            "MC_MEETINGS_FILE".to_string(),
            "/etc/huddle/meetings.json".to_string(),
        );

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.signaling_bind_address, "127.0.0.1:9090");
        assert_eq!(config.health_bind_address, "127.0.0.1:8082");
        assert_eq!(config.max_meetings, 500);
        assert_eq!(config.max_participants_per_meeting, 12);
        assert_eq!(config.announce_fallback, Duration::from_millis(150));
        assert_eq!(config.chat_history_limit, 20);
        assert_eq!(config.store_retry_attempts, 5);
        assert_eq!(
            config.meetings_file,
            Some(PathBuf::from("/etc/huddle/meetings.json"))
        );
    }

    #[test]
    fn test_mc_id_custom_value() {
        let mut vars = base_vars();
        vars.insert("MC_ID".to_string(), "mc-custom-001".to_string());

        let config = Config::from_vars(&vars).expect("Config should load successfully");
        assert_eq!(config.mc_id, "mc-custom-001");
    }

    #[test]
    fn test_from_vars_rejects_unparseable_number() {
        let mut vars = base_vars();
        vars.insert("MC_MAX_MEETINGS".to_string(), "lots".to_string());

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(v)) if v.contains("MC_MAX_MEETINGS")));
    }

    #[test]
    fn test_from_vars_rejects_zero_capacity() {
        let mut vars = base_vars();
        vars.insert(
            "MC_MAX_PARTICIPANTS_PER_MEETING".to_string(),
            "0".to_string(),
        );

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_from_vars_rejects_idle_timeout_below_ping() {
        let mut vars = base_vars();
        vars.insert("MC_WS_PING_INTERVAL_SECONDS".to_string(), "30".to_string());
        vars.insert("MC_WS_IDLE_TIMEOUT_SECONDS".to_string(), "10".to_string());

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_zero_retry_attempts_means_one_try() {
        let mut vars = base_vars();
        vars.insert("MC_STORE_RETRY_ATTEMPTS".to_string(), "0".to_string());

        let config = Config::from_vars(&vars).unwrap();
        assert_eq!(config.store_retry_attempts, 1);
    }
}
