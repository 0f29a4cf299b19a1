//! Admission rules.
//!
//! Pure decision logic evaluated by a room against the durable meeting
//! record. The room owns the I/O: it persists the updated record when
//! [`Evaluation::record_changed`] is set and delivers the outcome.

use crate::store::{MeetingRecord, ParticipantRecord};
use common::types::{AdmissionStatus, MeetingSettings, Permissions, Person, Role};

/// Result of evaluating one join attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub outcome: AdmissionStatus,
    pub role: Role,
    pub permissions: Permissions,
    /// The durable record was created or modified and must be saved.
    pub record_changed: bool,
}

/// Permissions a guest receives when first entering under `settings`.
#[must_use]
pub fn entry_permissions(settings: &MeetingSettings) -> Permissions {
    Permissions {
        can_unmute: !settings.mute_mic_on_entry,
        can_enable_video: !settings.disable_video_on_entry,
        can_screen_share: settings.allow_screen_share && !settings.require_admission,
    }
}

/// Decide whether `person` enters `meeting` directly, waits, or is refused.
///
/// Mutates `meeting` in place when a participant record is created or
/// reactivated. The returned outcome is never `Pending`.
///
/// A stored denial is final for the meeting: it outranks
/// `require_admission = false`.
pub fn evaluate(meeting: &mut MeetingRecord, person: &Person) -> Evaluation {
    if meeting.is_host(&person.id) {
        let needs_write = meeting.participant(&person.id).map_or(true, |record| {
            record.status != AdmissionStatus::Admitted || record.permissions != Permissions::full()
        });
        if needs_write {
            meeting.upsert(ParticipantRecord {
                person: person.clone(),
                status: AdmissionStatus::Admitted,
                permissions: Permissions::full(),
            });
        }
        return Evaluation {
            outcome: AdmissionStatus::Admitted,
            role: Role::Host,
            permissions: Permissions::full(),
            record_changed: needs_write,
        };
    }

    let settings = meeting.settings;

    match meeting.participant(&person.id).map(|r| (r.status, r.permissions)) {
        Some((AdmissionStatus::Denied, permissions)) => Evaluation {
            outcome: AdmissionStatus::Denied,
            role: Role::Guest,
            permissions,
            record_changed: false,
        },
        Some((AdmissionStatus::Admitted, permissions)) => Evaluation {
            outcome: AdmissionStatus::Admitted,
            role: Role::Guest,
            permissions,
            record_changed: false,
        },
        Some((AdmissionStatus::Waiting, permissions)) if settings.require_admission => Evaluation {
            outcome: AdmissionStatus::Waiting,
            role: Role::Guest,
            permissions,
            record_changed: false,
        },
        existing => {
            // No usable record yet, or gating has been switched off since
            // this person started waiting.
            let outcome = if settings.require_admission {
                AdmissionStatus::Waiting
            } else {
                AdmissionStatus::Admitted
            };
            let permissions = existing.map_or_else(|| entry_permissions(&settings), |(_, p)| p);
            meeting.upsert(ParticipantRecord {
                person: person.clone(),
                status: outcome,
                permissions,
            });
            Evaluation {
                outcome,
                role: Role::Guest,
                permissions,
                record_changed: true,
            }
        }
    }
}
