//! Durable meeting store seam.
//!
//! The coordinator never owns durable state. Meeting records (settings plus
//! the per-person admission record) and chat history live behind
//! [`MeetingStore`], injected into every room at spawn time. The in-memory
//! implementation backs the standalone binary and most tests.

use crate::observability::metrics;
use common::protocol::ChatMessage;
use common::types::{AdmissionStatus, MeetingId, MeetingSettings, Permissions, Person, PersonId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Failure reported by a meeting store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backing storage cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Operation did not complete in time.
    #[error("store operation timed out")]
    Timeout,

    /// Stored data could not be (de)serialized.
    #[error("store data invalid: {0}")]
    Serialization(String),
}

/// Durable per-person record inside a meeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub person: Person,
    pub status: AdmissionStatus,
    pub permissions: Permissions,
}

/// Durable meeting record as owned by the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingRecord {
    pub meeting_id: MeetingId,
    /// The meeting creator. Every connection of this person is host-privileged.
    pub host_id: PersonId,
    #[serde(default)]
    pub settings: MeetingSettings,
    #[serde(default)]
    pub participants: Vec<ParticipantRecord>,
}

impl MeetingRecord {
    #[must_use]
    pub fn new(meeting_id: MeetingId, host_id: PersonId) -> Self {
        Self {
            meeting_id,
            host_id,
            settings: MeetingSettings::default(),
            participants: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_host(&self, person_id: &PersonId) -> bool {
        is_host(self, person_id)
    }

    #[must_use]
    pub fn participant(&self, person_id: &PersonId) -> Option<&ParticipantRecord> {
        self.participants.iter().find(|p| &p.person.id == person_id)
    }

    pub fn participant_mut(&mut self, person_id: &PersonId) -> Option<&mut ParticipantRecord> {
        self.participants
            .iter_mut()
            .find(|p| &p.person.id == person_id)
    }

    /// Insert or replace the record for `record.person.id`.
    pub fn upsert(&mut self, record: ParticipantRecord) {
        match self.participant_mut(&record.person.id) {
            Some(existing) => *existing = record,
            None => self.participants.push(record),
        }
    }

    /// Delete the record for a person. Returns whether one existed.
    pub fn remove(&mut self, person_id: &PersonId) -> bool {
        let before = self.participants.len();
        self.participants.retain(|p| &p.person.id != person_id);
        self.participants.len() != before
    }
}

/// Whether `person_id` holds the host role for `meeting`.
#[must_use]
pub fn is_host(meeting: &MeetingRecord, person_id: &PersonId) -> bool {
    &meeting.host_id == person_id
}

/// Persistence collaborator consumed by rooms.
#[async_trait::async_trait]
pub trait MeetingStore: Send + Sync {
    /// Look up a meeting. `Ok(None)` means the meeting does not exist.
    async fn find_meeting(&self, meeting_id: &MeetingId)
        -> Result<Option<MeetingRecord>, StoreError>;

    /// Idempotent upsert of settings and participant list.
    async fn save_meeting(&self, meeting: &MeetingRecord) -> Result<(), StoreError>;

    /// The last `limit` chat messages in delivery order.
    async fn find_chat_history(
        &self,
        meeting_id: &MeetingId,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError>;

    async fn append_chat_message(
        &self,
        meeting_id: &MeetingId,
        message: &ChatMessage,
    ) -> Result<(), StoreError>;
}

/// Retry policy for durable writes on admission and permission paths.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// A single attempt, no backoff.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Run a store operation, retrying with linear backoff.
///
/// Latency of every attempt is recorded under `mc_store_latency_seconds`.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    operation: &'static str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        let start = Instant::now();
        let result = op().await;
        metrics::record_store_latency(operation, start.elapsed());

        match result {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!(
                    target: "mc.store",
                    operation = operation,
                    attempt = attempt,
                    error = %e,
                    "Store operation failed, retrying"
                );
                tokio::time::sleep(policy.backoff * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// In-memory meeting store.
#[derive(Debug, Default)]
pub struct InMemoryMeetingStore {
    meetings: RwLock<HashMap<MeetingId, MeetingRecord>>,
    chat: RwLock<HashMap<MeetingId, Vec<ChatMessage>>>,
}

impl InMemoryMeetingStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with `records`.
    #[must_use]
    pub fn with_meetings(records: impl IntoIterator<Item = MeetingRecord>) -> Self {
        let meetings = records
            .into_iter()
            .map(|m| (m.meeting_id.clone(), m))
            .collect();
        Self {
            meetings: RwLock::new(meetings),
            chat: RwLock::new(HashMap::new()),
        }
    }

    /// Load meeting records from a JSON array on disk.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the file cannot be read and
    /// `StoreError::Serialization` if it is not a list of meeting records.
    pub fn from_json_file(path: &Path) -> Result<Self, StoreError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", path.display())))?;
        let records: Vec<MeetingRecord> =
            serde_json::from_str(&raw).map_err(|e| StoreError::Serialization(e.to_string()))?;

        debug!(
            target: "mc.store",
            meetings = records.len(),
            "Seeded meeting store from file"
        );

        Ok(Self::with_meetings(records))
    }

    /// Create or replace a meeting record.
    pub async fn insert_meeting(&self, record: MeetingRecord) {
        self.meetings
            .write()
            .await
            .insert(record.meeting_id.clone(), record);
    }

    /// Number of meeting records.
    pub async fn meeting_count(&self) -> usize {
        self.meetings.read().await.len()
    }
}

#[async_trait::async_trait]
impl MeetingStore for InMemoryMeetingStore {
    async fn find_meeting(
        &self,
        meeting_id: &MeetingId,
    ) -> Result<Option<MeetingRecord>, StoreError> {
        Ok(self.meetings.read().await.get(meeting_id).cloned())
    }

    async fn save_meeting(&self, meeting: &MeetingRecord) -> Result<(), StoreError> {
        self.meetings
            .write()
            .await
            .insert(meeting.meeting_id.clone(), meeting.clone());
        Ok(())
    }

    async fn find_chat_history(
        &self,
        meeting_id: &MeetingId,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let chat = self.chat.read().await;
        let Some(messages) = chat.get(meeting_id) else {
            return Ok(Vec::new());
        };
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.iter().skip(skip).cloned().collect())
    }

    async fn append_chat_message(
        &self,
        meeting_id: &MeetingId,
        message: &ChatMessage,
    ) -> Result<(), StoreError> {
        self.chat
            .write()
            .await
            .entry(meeting_id.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }
}
