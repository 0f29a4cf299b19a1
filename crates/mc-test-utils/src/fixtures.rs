//! Pre-configured test data fixtures for MC testing.
//!
//! Provides builders and test data for:
//! - Meeting records with various settings
//! - Hosts and guests
//! - Stored participant records

use common::types::{AdmissionStatus, MeetingId, MeetingSettings, Permissions, Person, PersonId};
use meeting_controller::store::{MeetingRecord, ParticipantRecord};
use uuid::Uuid;

/// Person id of the host created by [`host`] and used by [`TestMeeting::new`].
pub const HOST_ID: &str = "host-1";

/// The meeting host.
#[must_use]
pub fn host() -> Person {
    Person::new(HOST_ID, "Hannah Host")
}

/// A guest with a readable id.
#[must_use]
pub fn guest(id: &str) -> Person {
    Person::new(id, format!("Guest {id}"))
}

/// A guest with a random id.
#[must_use]
pub fn random_guest() -> Person {
    guest(&format!("guest-{}", Uuid::new_v4()))
}

/// Test meeting fixture.
#[derive(Debug, Clone)]
pub struct TestMeeting {
    record: MeetingRecord,
}

impl TestMeeting {
    /// Create a meeting hosted by [`HOST_ID`] with default settings
    /// (admission required).
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            record: MeetingRecord::new(MeetingId::new(id), PersonId::new(HOST_ID)),
        }
    }

    /// Create a test meeting with a random ID.
    #[must_use]
    pub fn random() -> Self {
        Self::new(format!("meeting-{}", Uuid::new_v4()))
    }

    /// Set the host.
    #[must_use]
    pub fn hosted_by(mut self, host_id: &str) -> Self {
        self.record.host_id = PersonId::new(host_id);
        self
    }

    /// Guests join without waiting for a host.
    #[must_use]
    pub fn open(mut self) -> Self {
        self.record.settings.require_admission = false;
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: MeetingSettings) -> Self {
        self.record.settings = settings;
        self
    }

    /// Add a stored participant record.
    #[must_use]
    pub fn with_participant(
        mut self,
        person: Person,
        status: AdmissionStatus,
        permissions: Permissions,
    ) -> Self {
        self.record.upsert(ParticipantRecord {
            person,
            status,
            permissions,
        });
        self
    }

    #[must_use]
    pub fn id(&self) -> &MeetingId {
        &self.record.meeting_id
    }

    #[must_use]
    pub fn build(self) -> MeetingRecord {
        self.record
    }
}
