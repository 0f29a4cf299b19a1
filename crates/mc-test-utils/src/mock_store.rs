//! Scriptable meeting store for MC testing.
//!
//! Wraps [`InMemoryMeetingStore`] and can be told to fail specific
//! operations, so retry and best-effort paths can be exercised.
//!
//! # Example
//!
//! ```rust,ignore
//! use mc_test_utils::MockMeetingStore;
//!
//! let store = MockMeetingStore::with_meetings([meeting])
//!     .fail_saves(2)          // first two saves fail, third succeeds
//!     .fail_chat_appends();   // chat is never persisted
//! ```

use async_trait::async_trait;
use common::protocol::ChatMessage;
use common::types::MeetingId;
use meeting_controller::store::{InMemoryMeetingStore, MeetingRecord, MeetingStore, StoreError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Mock meeting store with injectable failures.
#[derive(Debug, Clone, Default)]
pub struct MockMeetingStore {
    inner: Arc<InMemoryMeetingStore>,
    failures: Arc<Mutex<Failures>>,
    calls: Arc<Calls>,
}

/// Remaining injected failures per operation (`usize::MAX` = always).
#[derive(Debug, Default)]
struct Failures {
    find: usize,
    save: usize,
    history: usize,
    append: usize,
}

#[derive(Debug, Default)]
struct Calls {
    find: AtomicUsize,
    save: AtomicUsize,
    history: AtomicUsize,
    append: AtomicUsize,
}

fn injected(operation: &str) -> StoreError {
    StoreError::Unavailable(format!("injected {operation} failure"))
}

/// Consume one scripted failure if any remain.
fn take(remaining: &mut usize) -> bool {
    match *remaining {
        0 => false,
        usize::MAX => true,
        _ => {
            *remaining -= 1;
            true
        }
    }
}

impl MockMeetingStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `records`.
    #[must_use]
    pub fn with_meetings(records: impl IntoIterator<Item = MeetingRecord>) -> Self {
        Self {
            inner: Arc::new(InMemoryMeetingStore::with_meetings(records)),
            ..Self::default()
        }
    }

    /// Fail the next `count` lookups.
    #[must_use]
    pub fn fail_finds(self, count: usize) -> Self {
        self.failures.lock().unwrap().find = count;
        self
    }

    /// Fail the next `count` saves.
    #[must_use]
    pub fn fail_saves(self, count: usize) -> Self {
        self.failures.lock().unwrap().save = count;
        self
    }

    /// Fail every chat history read.
    #[must_use]
    pub fn fail_chat_history(self) -> Self {
        self.failures.lock().unwrap().history = usize::MAX;
        self
    }

    /// Fail every chat append.
    #[must_use]
    pub fn fail_chat_appends(self) -> Self {
        self.failures.lock().unwrap().append = usize::MAX;
        self
    }

    /// Stop injecting failures.
    pub fn heal(&self) {
        *self.failures.lock().unwrap() = Failures::default();
    }

    pub fn find_calls(&self) -> usize {
        self.calls.find.load(Ordering::SeqCst)
    }

    pub fn save_calls(&self) -> usize {
        self.calls.save.load(Ordering::SeqCst)
    }

    pub fn append_calls(&self) -> usize {
        self.calls.append.load(Ordering::SeqCst)
    }

    /// Current stored record, bypassing failure injection.
    pub async fn meeting(&self, meeting_id: &str) -> Option<MeetingRecord> {
        self.inner
            .find_meeting(&MeetingId::new(meeting_id))
            .await
            .unwrap()
    }

    /// Full stored chat log, bypassing failure injection.
    pub async fn chat(&self, meeting_id: &str) -> Vec<ChatMessage> {
        self.inner
            .find_chat_history(&MeetingId::new(meeting_id), usize::MAX)
            .await
            .unwrap()
    }

    /// Append a message directly, as if persisted by an earlier room.
    pub async fn seed_chat(&self, meeting_id: &str, message: ChatMessage) {
        self.inner
            .append_chat_message(&MeetingId::new(meeting_id), &message)
            .await
            .unwrap();
    }
}

#[async_trait]
impl MeetingStore for MockMeetingStore {
    async fn find_meeting(
        &self,
        meeting_id: &MeetingId,
    ) -> Result<Option<MeetingRecord>, StoreError> {
        self.calls.find.fetch_add(1, Ordering::SeqCst);
        if take(&mut self.failures.lock().unwrap().find) {
            return Err(injected("find_meeting"));
        }
        self.inner.find_meeting(meeting_id).await
    }

    async fn save_meeting(&self, meeting: &MeetingRecord) -> Result<(), StoreError> {
        self.calls.save.fetch_add(1, Ordering::SeqCst);
        if take(&mut self.failures.lock().unwrap().save) {
            return Err(injected("save_meeting"));
        }
        self.inner.save_meeting(meeting).await
    }

    async fn find_chat_history(
        &self,
        meeting_id: &MeetingId,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        self.calls.history.fetch_add(1, Ordering::SeqCst);
        if take(&mut self.failures.lock().unwrap().history) {
            return Err(injected("find_chat_history"));
        }
        self.inner.find_chat_history(meeting_id, limit).await
    }

    async fn append_chat_message(
        &self,
        meeting_id: &MeetingId,
        message: &ChatMessage,
    ) -> Result<(), StoreError> {
        self.calls.append.fetch_add(1, Ordering::SeqCst);
        if take(&mut self.failures.lock().unwrap().append) {
            return Err(injected("append_chat_message"));
        }
        self.inner.append_chat_message(meeting_id, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestMeeting;

    #[tokio::test]
    async fn test_scripted_save_failures_run_out() {
        let store = MockMeetingStore::with_meetings([TestMeeting::new("m").build()]).fail_saves(2);
        let record = store.meeting("m").await.unwrap();

        assert!(store.save_meeting(&record).await.is_err());
        assert!(store.save_meeting(&record).await.is_err());
        assert!(store.save_meeting(&record).await.is_ok());
        assert_eq!(store.save_calls(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_until_healed() {
        let store = MockMeetingStore::new().fail_chat_appends();
        let message = ChatMessage {
            seq: 1,
            message_id: None,
            author: crate::fixtures::host(),
            text: "hi".to_string(),
            timestamp_ms: 0,
        };
        let meeting_id = MeetingId::new("m");

        assert!(store.append_chat_message(&meeting_id, &message).await.is_err());
        assert!(store.append_chat_message(&meeting_id, &message).await.is_err());

        store.heal();
        assert!(store.append_chat_message(&meeting_id, &message).await.is_ok());
        assert_eq!(store.chat("m").await.len(), 1);
    }
}
