//! Client-side chat log.
//!
//! Messages are shown optimistically when sent and replaced by the
//! coordinator's echo, which carries the room sequence number. Echoes and
//! replayed history are de-duplicated against what is already displayed.

use common::protocol::ChatMessage;
use common::types::{Person, PersonId};
use uuid::Uuid;

/// Identity used to recognise the same message twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    /// Client-generated message id.
    Id(Uuid),
    /// Messages without an id: author, text and timestamp rounded to the second.
    Composite {
        author: PersonId,
        text: String,
        second: i64,
    },
}

impl DedupKey {
    #[must_use]
    pub fn of(message: &ChatMessage) -> Self {
        match message.message_id {
            Some(id) => DedupKey::Id(id),
            None => DedupKey::Composite {
                author: message.author.id.clone(),
                text: message.text.clone(),
                second: round_to_second(message.timestamp_ms),
            },
        }
    }
}

/// Milliseconds to the nearest whole second.
fn round_to_second(timestamp_ms: i64) -> i64 {
    (timestamp_ms + 500).div_euclid(1000)
}

/// Result of [`ChatLog::receive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// Not seen before; appended.
    New,
    /// Replaced our optimistic copy.
    Confirmed,
    Duplicate,
}

#[derive(Debug, Clone)]
struct Entry {
    key: DedupKey,
    message: ChatMessage,
    confirmed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ChatLog {
    entries: Vec<Entry>,
}

impl ChatLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message we are about to send and return the copy to display.
    pub fn optimistic(&mut self, author: Person, text: impl Into<String>) -> ChatMessage {
        let message = ChatMessage {
            seq: 0,
            message_id: Some(Uuid::new_v4()),
            author,
            text: text.into(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        };
        self.entries.push(Entry {
            key: DedupKey::of(&message),
            message: message.clone(),
            confirmed: false,
        });
        message
    }

    /// Merge a message delivered by the coordinator.
    pub fn receive(&mut self, message: ChatMessage) -> Received {
        let key = DedupKey::of(&message);
        match self.entries.iter_mut().find(|e| e.key == key) {
            Some(entry) if entry.confirmed => Received::Duplicate,
            Some(entry) => {
                entry.message = message;
                entry.confirmed = true;
                Received::Confirmed
            }
            None => {
                self.entries.push(Entry {
                    key,
                    message,
                    confirmed: true,
                });
                Received::New
            }
        }
    }

    /// Merge replayed history. Returns the messages that were not already shown.
    pub fn load_history(&mut self, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
        messages
            .into_iter()
            .filter_map(|m| match self.receive(m.clone()) {
                Received::New => Some(m),
                Received::Confirmed | Received::Duplicate => None,
            })
            .collect()
    }

    /// Displayed messages, oldest first.
    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.entries.iter().map(|e| &e.message)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
