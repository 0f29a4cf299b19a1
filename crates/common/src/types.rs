//! Common data types for meeting components.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a meeting
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeetingId(pub String);

impl MeetingId {
    /// Wrap an existing meeting identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MeetingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a person, stable across their connections
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersonId(pub String);

impl PersonId {
    /// Wrap an existing person identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PersonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for one live connection, assigned by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new random connection ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A person as presented to the rest of the meeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub id: PersonId,
    pub name: String,
}

impl Person {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: PersonId::new(id),
            name: name.into(),
        }
    }
}

/// Role of an endpoint within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Guest,
}

impl Role {
    #[must_use]
    pub const fn is_host(self) -> bool {
        matches!(self, Role::Host)
    }
}

/// Admission status of a person (durable) or an endpoint (transient).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionStatus {
    /// Connection attempted to join, no decision yet.
    Pending,
    /// Parked in the waiting room until a host decides.
    Waiting,
    /// Part of the meeting.
    Admitted,
    /// Refused by a host. Sticky for the lifetime of the meeting record.
    Denied,
}

/// Rejected admission status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid admission transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: AdmissionStatus,
    pub to: AdmissionStatus,
}

impl AdmissionStatus {
    /// Returns the status as a string for logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            AdmissionStatus::Pending => "pending",
            AdmissionStatus::Waiting => "waiting",
            AdmissionStatus::Admitted => "admitted",
            AdmissionStatus::Denied => "denied",
        }
    }

    /// Exhaustive transition table.
    ///
    /// `Admitted -> Admitted` and `Denied -> Denied` are the idempotent
    /// re-entry paths taken when the same person joins again.
    #[must_use]
    pub const fn can_transition_to(self, to: AdmissionStatus) -> bool {
        use AdmissionStatus::{Admitted, Denied, Pending, Waiting};
        matches!(
            (self, to),
            (Pending, Waiting | Admitted | Denied)
                | (Waiting, Waiting | Admitted | Denied)
                | (Admitted, Admitted)
                | (Denied, Denied)
        )
    }

    /// Move to `to` if the table allows it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` for any pair not in the table.
    pub fn transition(self, to: AdmissionStatus) -> Result<AdmissionStatus, InvalidTransition> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }
}

impl fmt::Display for AdmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capabilities a host grants to a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Permissions {
    pub can_unmute: bool,
    pub can_enable_video: bool,
    pub can_screen_share: bool,
}

impl Permissions {
    /// Everything allowed (hosts).
    #[must_use]
    pub const fn full() -> Self {
        Self {
            can_unmute: true,
            can_enable_video: true,
            can_screen_share: true,
        }
    }

    /// Merge a partial update, last write wins per field.
    #[must_use]
    pub fn merged(self, delta: &PermissionDelta) -> Self {
        Self {
            can_unmute: delta.can_unmute.unwrap_or(self.can_unmute),
            can_enable_video: delta.can_enable_video.unwrap_or(self.can_enable_video),
            can_screen_share: delta.can_screen_share.unwrap_or(self.can_screen_share),
        }
    }
}

/// Partial permission update sent by a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PermissionDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_unmute: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_enable_video: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_screen_share: Option<bool>,
}

impl PermissionDelta {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.can_unmute.is_none() && self.can_enable_video.is_none() && self.can_screen_share.is_none()
    }
}

/// Durable per-meeting settings controlling entry behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeetingSettings {
    /// Guests wait for a host decision before entering.
    pub require_admission: bool,
    /// New guests enter without the right to unmute.
    pub mute_mic_on_entry: bool,
    /// New guests enter without the right to enable video.
    pub disable_video_on_entry: bool,
    /// Guests may share their screen (only applied when admission is not gated).
    pub allow_screen_share: bool,
}

impl Default for MeetingSettings {
    fn default() -> Self {
        Self {
            require_admission: true,
            mute_mic_on_entry: false,
            disable_video_on_entry: false,
            allow_screen_share: true,
        }
    }
}

impl MeetingSettings {
    #[must_use]
    pub fn merged(self, delta: &SettingsDelta) -> Self {
        Self {
            require_admission: delta.require_admission.unwrap_or(self.require_admission),
            mute_mic_on_entry: delta.mute_mic_on_entry.unwrap_or(self.mute_mic_on_entry),
            disable_video_on_entry: delta
                .disable_video_on_entry
                .unwrap_or(self.disable_video_on_entry),
            allow_screen_share: delta.allow_screen_share.unwrap_or(self.allow_screen_share),
        }
    }
}

/// Partial settings update sent by a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SettingsDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_admission: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mute_mic_on_entry: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_video_on_entry: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_screen_share: Option<bool>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_transition_table() {
        use AdmissionStatus::{Admitted, Denied, Pending, Waiting};

        assert_eq!(Pending.transition(Waiting), Ok(Waiting));
        assert_eq!(Waiting.transition(Admitted), Ok(Admitted));
        assert_eq!(Waiting.transition(Denied), Ok(Denied));
        assert_eq!(Denied.transition(Denied), Ok(Denied));
        assert_eq!(Admitted.transition(Admitted), Ok(Admitted));

        // A denied person never becomes admitted again
        assert!(Denied.transition(Admitted).is_err());
        assert!(Denied.transition(Waiting).is_err());
        assert!(Admitted.transition(Waiting).is_err());
        assert!(Admitted.transition(Denied).is_err());
        assert!(Waiting.transition(Pending).is_err());
    }

    #[test]
    fn test_permission_merge_keeps_unset_fields() {
        let current = Permissions::full();
        let delta = PermissionDelta {
            can_unmute: Some(false),
            ..PermissionDelta::default()
        };

        let merged = current.merged(&delta);
        assert!(!merged.can_unmute);
        assert!(merged.can_enable_video);
        assert!(merged.can_screen_share);
        assert!(!delta.is_empty());
        assert!(PermissionDelta::default().is_empty());
    }

    #[test]
    fn test_settings_defaults() {
        let settings = MeetingSettings::default();
        assert!(settings.require_admission);
        assert!(!settings.mute_mic_on_entry);
        assert!(!settings.disable_video_on_entry);
        assert!(settings.allow_screen_share);

        // Missing fields fall back to defaults when deserializing
        let parsed: MeetingSettings = serde_json::from_str(r#"{"mute_mic_on_entry":true}"#).unwrap();
        assert!(parsed.require_admission);
        assert!(parsed.mute_mic_on_entry);
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let id = MeetingId::new("standup");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"standup\"");
        assert_eq!(id.to_string(), "standup");

        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
    }
}
