//! Actor bookkeeping: live room/connection counts and mailbox backlog.
//!
//! Each actor owns a [`MailboxMonitor`] and reports the number of messages
//! still queued every time it takes one off its mailbox. The backlog is
//! graded against the mailbox capacity:
//!
//! | Level    | Backlog            |
//! |----------|--------------------|
//! | Normal   | below 1/4 capacity |
//! | Elevated | 1/4 to 3/4         |
//! | Critical | above 3/4          |
//!
//! Level changes are logged once per crossing. Every count is mirrored to the
//! Prometheus recorder through [`crate::observability::metrics`].

use crate::observability::metrics as prom;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Actor type for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// `MeetingControllerActor` (singleton).
    Controller,
    /// `MeetingActor` (one per live room).
    Meeting,
    /// `ConnectionActor` (one per joined socket).
    Connection,
}

impl ActorType {
    /// Returns the actor type as a string for metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Controller => "controller",
            ActorType::Meeting => "meeting",
            ActorType::Connection => "connection",
        }
    }
}

/// How far behind an actor is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MailboxLevel {
    Normal,
    Elevated,
    Critical,
}

impl MailboxLevel {
    /// Grade `backlog` against a mailbox of `capacity` slots.
    #[must_use]
    pub const fn grade(backlog: usize, capacity: usize) -> Self {
        if backlog.saturating_mul(4) > capacity.saturating_mul(3) {
            MailboxLevel::Critical
        } else if backlog.saturating_mul(4) >= capacity {
            MailboxLevel::Elevated
        } else {
            MailboxLevel::Normal
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => MailboxLevel::Elevated,
            2 => MailboxLevel::Critical,
            _ => MailboxLevel::Normal,
        }
    }

    const fn to_u8(self) -> u8 {
        match self {
            MailboxLevel::Normal => 0,
            MailboxLevel::Elevated => 1,
            MailboxLevel::Critical => 2,
        }
    }
}

/// Backlog tracker for one actor's mailbox.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    /// Meeting id, connection id or controller id.
    actor_id: String,
    capacity: usize,
    level: AtomicU8,
    peak_backlog: AtomicUsize,
    messages_processed: AtomicU64,
    /// Events refused because the mailbox was full.
    messages_dropped: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            capacity,
            level: AtomicU8::new(MailboxLevel::Normal.to_u8()),
            peak_backlog: AtomicUsize::new(0),
            messages_processed: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Record one message taken off the mailbox with `backlog` still queued.
    pub fn observe(&self, backlog: usize) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        self.peak_backlog.fetch_max(backlog, Ordering::Relaxed);
        prom::set_actor_mailbox_depth(self.actor_type.as_str(), backlog);

        let level = MailboxLevel::grade(backlog, self.capacity);
        let previous = MailboxLevel::from_u8(self.level.swap(level.to_u8(), Ordering::Relaxed));
        if level == previous {
            return;
        }

        match level {
            MailboxLevel::Critical => warn!(
                target: "mc.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                backlog = backlog,
                capacity = self.capacity,
                "Mailbox backlog critical"
            ),
            MailboxLevel::Elevated if previous < level => debug!(
                target: "mc.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                backlog = backlog,
                "Mailbox backlog elevated"
            ),
            MailboxLevel::Elevated | MailboxLevel::Normal => info!(
                target: "mc.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                backlog = backlog,
                "Mailbox backlog recovering"
            ),
        }
    }

    /// Record an event refused because the mailbox was full.
    pub fn record_drop(&self) {
        let dropped = self.messages_dropped.fetch_add(1, Ordering::Relaxed) + 1;
        prom::record_message_dropped(self.actor_type.as_str());
        warn!(
            target: "mc.actor.mailbox",
            actor_type = self.actor_type.as_str(),
            actor_id = %self.actor_id,
            dropped = dropped,
            "Message dropped, mailbox full"
        );
    }

    #[must_use]
    pub fn level(&self) -> MailboxLevel {
        MailboxLevel::from_u8(self.level.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn peak_backlog(&self) -> usize {
        self.peak_backlog.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }
}

/// Process-wide actor counts, shared by every actor.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    active_meetings: AtomicUsize,
    active_connections: AtomicUsize,
    actor_panics: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn meeting_created(&self) {
        let count = self.active_meetings.fetch_add(1, Ordering::Relaxed) + 1;
        prom::set_meetings_active(count as u64);
    }

    pub fn meeting_removed(&self) {
        let count = self
            .active_meetings
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        prom::set_meetings_active(count as u64);
    }

    pub fn connection_created(&self) {
        let count = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        prom::set_connections_active(count as u64);
    }

    pub fn connection_closed(&self) {
        let count = self
            .active_connections
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        prom::set_connections_active(count as u64);
    }

    /// Record an actor task that ended in a panic.
    pub fn record_panic(&self, actor_type: ActorType) {
        let total = self.actor_panics.fetch_add(1, Ordering::Relaxed) + 1;
        prom::record_actor_panic(actor_type.as_str());
        tracing::error!(
            target: "mc.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics = total,
            "Actor panic detected"
        );
    }

    #[must_use]
    pub fn meeting_count(&self) -> usize {
        self.active_meetings.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn panic_count(&self) -> u64 {
        self.actor_panics.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_grade_against_capacity() {
        assert_eq!(MailboxLevel::grade(0, 200), MailboxLevel::Normal);
        assert_eq!(MailboxLevel::grade(49, 200), MailboxLevel::Normal);
        assert_eq!(MailboxLevel::grade(50, 200), MailboxLevel::Elevated);
        assert_eq!(MailboxLevel::grade(150, 200), MailboxLevel::Elevated);
        assert_eq!(MailboxLevel::grade(151, 200), MailboxLevel::Critical);
        assert_eq!(MailboxLevel::grade(200, 200), MailboxLevel::Critical);
    }

    #[test]
    fn test_monitor_tracks_level_and_peak() {
        let monitor = MailboxMonitor::new(ActorType::Meeting, "standup", 100);

        monitor.observe(3);
        assert_eq!(monitor.level(), MailboxLevel::Normal);

        monitor.observe(80);
        assert_eq!(monitor.level(), MailboxLevel::Critical);

        monitor.observe(10);
        assert_eq!(monitor.level(), MailboxLevel::Normal);
        assert_eq!(monitor.peak_backlog(), 80);
        assert_eq!(monitor.messages_processed(), 3);
    }

    #[test]
    fn test_monitor_counts_drops() {
        let monitor = MailboxMonitor::new(ActorType::Connection, "conn-1", 200);

        monitor.record_drop();
        monitor.record_drop();
        assert_eq!(monitor.messages_dropped(), 2);
    }

    #[test]
    fn test_actor_counts() {
        let metrics = ActorMetrics::new();

        metrics.meeting_created();
        metrics.meeting_created();
        metrics.connection_created();
        metrics.connection_created();
        metrics.connection_created();
        metrics.meeting_removed();
        metrics.connection_closed();

        assert_eq!(metrics.meeting_count(), 1);
        assert_eq!(metrics.connection_count(), 2);
    }

    #[test]
    fn test_panics_are_counted() {
        let metrics = ActorMetrics::new();

        metrics.record_panic(ActorType::Meeting);
        metrics.record_panic(ActorType::Connection);
        assert_eq!(metrics.panic_count(), 2);
    }
}
