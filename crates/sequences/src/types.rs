use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A multi-step, time-delayed email sequence owned by one client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: Uuid,
    pub client_id: Uuid,
    pub name: String,
    pub status: SequenceStatus,
    pub trigger: SequenceTrigger,
    /// Always sorted by `order`, which is dense from 1.
    pub steps: Vec<Step>,
    /// Local time-of-day every computed send time is pinned to.
    pub preferred_time: Option<NaiveTime>,
    /// Zone in which day delays and `preferred_time` are interpreted.
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
    pub sender: Option<Sender>,
    /// Monotonic; cancellations never decrement it.
    pub total_enrolled: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn default_timezone() -> Tz {
    Tz::UTC
}

impl Sequence {
    pub fn step_at(&self, order: u32) -> Option<&Step> {
        self.steps.iter().find(|s| s.order == order)
    }

    pub fn step(&self, step_id: &Uuid) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == *step_id)
    }

    pub fn step_count(&self) -> u32 {
        self.steps.len() as u32
    }
}

/// Lifecycle status of a sequence definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceStatus {
    Draft,
    Active,
    Paused,
    Archived,
}

/// What enrolls a contact into a sequence automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum SequenceTrigger {
    Manual,
    TagAdded { tag: String },
    ExternalCampaign { campaign_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub email: String,
    pub name: Option<String>,
}

/// One email within a sequence plus the wait before it fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub order: u32,
    pub subject: String,
    pub content: StepContent,
    /// Relative to the previous step's fire time, or to enrollment for step 1.
    pub delay_days: u32,
    pub delay_hours: u32,
    #[serde(default)]
    pub counters: StepCounters,
}

impl Step {
    pub fn new(
        subject: impl Into<String>,
        content: StepContent,
        delay_days: u32,
        delay_hours: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            order: 0,
            subject: subject.into(),
            content,
            delay_days,
            delay_hours,
            counters: StepCounters::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StepContent {
    Template { template_id: Uuid },
    Inline { html: String },
}

/// Engagement counters maintained by the reporting subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepCounters {
    pub sent: u64,
    pub opened: u64,
    pub clicked: u64,
}

/// One contact's progress through one sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub sequence_id: Uuid,
    pub contact_id: Uuid,
    /// Order of the last step sent; 0 before the first send.
    pub current_step: u32,
    pub status: EnrollmentStatus,
    pub enrolled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Paused,
    /// A step failed permanently; waits for an operator.
    Halted,
    Completed,
    Cancelled,
}

impl EnrollmentStatus {
    /// Statuses that occupy the (sequence, contact) slot.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Active | Self::Paused | Self::Halted)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// A single obligation to send one step to one enrolled contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledEmail {
    pub id: Uuid,
    pub enrollment_id: Uuid,
    pub step_id: Uuid,
    /// Instant the step's delay is measured from.
    pub base_at: DateTime<Utc>,
    pub scheduled_for: DateTime<Utc>,
    /// Earliest instant a worker may pick this up; later than
    /// `scheduled_for` only after a retry backoff.
    pub next_attempt_at: DateTime<Utc>,
    pub status: ScheduledEmailStatus,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledEmail {
    pub fn pending(
        enrollment_id: Uuid,
        step_id: Uuid,
        base_at: DateTime<Utc>,
        scheduled_for: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            enrollment_id,
            step_id,
            base_at,
            scheduled_for,
            next_attempt_at: scheduled_for,
            status: ScheduledEmailStatus::Pending,
            claimed_at: None,
            claimed_by: None,
            lease_expires_at: None,
            attempts: 0,
            last_error: None,
            message_id: None,
            created_at,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    pub(crate) fn clear_claim(&mut self) {
        self.claimed_at = None;
        self.claimed_by = None;
        self.lease_expires_at = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledEmailStatus {
    Pending,
    Claimed,
    Sent,
    Failed,
    Cancelled,
}

impl ScheduledEmailStatus {
    /// Pending and claimed obligations both count against the
    /// one-per-enrollment limit.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Claimed)
    }
}

/// What `advance` did after a send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum NextState {
    Scheduled {
        scheduled_email_id: Uuid,
        step_order: u32,
        scheduled_for: DateTime<Utc>,
    },
    /// The last step was sent; the enrollment is complete.
    Completed,
    /// The enrollment left `active` while the send was in flight.
    Held { status: EnrollmentStatus },
}

/// How an operator unblocks a halted enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureResolution {
    /// Schedule the failed step again.
    Retry,
    /// Treat the failed step as done and move on.
    Skip,
}
