use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle event written to the analytics event store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub sequence_id: Uuid,
    pub enrollment_id: Option<Uuid>,
    pub contact_id: Option<Uuid>,
    pub step_id: Option<Uuid>,
    pub scheduled_email_id: Option<Uuid>,
    pub detail: Option<String>,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Enrollment lifecycle
    Enrolled,
    EnrollmentPaused,
    EnrollmentResumed,
    EnrollmentCancelled,
    EnrollmentCompleted,
    EnrollmentHalted,
    EnrollmentRepaired,
    // Obligations
    StepScheduled,
    StepRescheduled,
    EmailSent,
    SendRetried,
    SendFailed,
    SendSuppressed,
    ObligationRepaired,
    ClaimExpired,
    // Sequence edits
    SequenceStatusChanged,
    SequenceEdited,
}

impl EventType {
    /// Same spelling as the serialized form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enrolled => "enrolled",
            Self::EnrollmentPaused => "enrollment_paused",
            Self::EnrollmentResumed => "enrollment_resumed",
            Self::EnrollmentCancelled => "enrollment_cancelled",
            Self::EnrollmentCompleted => "enrollment_completed",
            Self::EnrollmentHalted => "enrollment_halted",
            Self::EnrollmentRepaired => "enrollment_repaired",
            Self::StepScheduled => "step_scheduled",
            Self::StepRescheduled => "step_rescheduled",
            Self::EmailSent => "email_sent",
            Self::SendRetried => "send_retried",
            Self::SendFailed => "send_failed",
            Self::SendSuppressed => "send_suppressed",
            Self::ObligationRepaired => "obligation_repaired",
            Self::ClaimExpired => "claim_expired",
            Self::SequenceStatusChanged => "sequence_status_changed",
            Self::SequenceEdited => "sequence_edited",
        }
    }
}
