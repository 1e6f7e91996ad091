use std::sync::Arc;

use chrono::{DateTime, Utc};
use drip_core::clock::{system_clock, Clock};
use drip_core::event_bus::{make_event, noop_sink, EventSink};
use drip_core::types::EventType;
use drip_core::{SequencerError, SequencerResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::schedule::fire_time;
use crate::state_machine::{enrollment_machine, obligation_machine};
use crate::store::{SequenceStore, Tx};
use crate::types::{
    Enrollment, EnrollmentStatus, FailureResolution, NextState, ScheduledEmail,
    ScheduledEmailStatus, Sequence, SequenceStatus,
};

/// What happened to a claimed obligation whose send failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum FailureOutcome {
    Retrying {
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Attempts exhausted; the enrollment is halted.
    Failed { attempts: u32 },
}

/// Owns every enrollment state transition. Each public operation is one store
/// transaction, so an enrollment's status and its scheduled email always
/// change together.
#[derive(Clone)]
pub struct EnrollmentManager {
    store: Arc<SequenceStore>,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
    node_id: String,
}

impl std::fmt::Debug for EnrollmentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrollmentManager")
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl EnrollmentManager {
    pub fn new(store: Arc<SequenceStore>) -> Self {
        Self {
            store,
            clock: system_clock(),
            event_sink: noop_sink(),
            node_id: "local".to_string(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Attach an event sink for emitting analytics events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn store(&self) -> &Arc<SequenceStore> {
        &self.store
    }

    pub fn enrollment(&self, id: &Uuid) -> SequencerResult<Enrollment> {
        self.store.enrollment(id)
    }

    /// Enrolls a contact, scheduling step 1 from `at`.
    ///
    /// Returns [`SequencerError::AlreadyEnrolled`] when the pair already has an
    /// active, paused or halted enrollment; trigger-driven callers treat that
    /// as a no-op.
    pub fn enroll(&self, sequence_id: Uuid, contact_id: Uuid, at: DateTime<Utc>) -> SequencerResult<Uuid> {
        let result = self.store.transaction(|tx| {
            let mut sequence = tx.sequence(&sequence_id)?.clone();
            if sequence.status != SequenceStatus::Active {
                return Err(SequencerError::Validation(format!(
                    "sequence {} is {:?}, not active",
                    sequence_id, sequence.status
                )));
            }
            if let Some(existing) = tx.in_flight_enrollment(&sequence_id, &contact_id) {
                return Err(SequencerError::AlreadyEnrolled {
                    enrollment_id: existing.id,
                });
            }
            let first = sequence
                .step_at(1)
                .cloned()
                .ok_or_else(|| SequencerError::Validation(format!("sequence {} has no steps", sequence_id)))?;

            let enrollment = Enrollment {
                id: Uuid::new_v4(),
                sequence_id,
                contact_id,
                current_step: 0,
                status: EnrollmentStatus::Active,
                enrolled_at: at,
                updated_at: at,
            };
            tx.put_enrollment(enrollment.clone())?;

            let row = ScheduledEmail::pending(enrollment.id, first.id, at, fire_time(&sequence, &first, at), at);
            tx.put_scheduled(row.clone())?;

            sequence.total_enrolled += 1;
            sequence.updated_at = at;
            tx.put_sequence(sequence);
            Ok((enrollment, row))
        });

        match result {
            Ok((enrollment, row)) => {
                info!(
                    enrollment_id = %enrollment.id,
                    sequence_id = %sequence_id,
                    contact_id = %contact_id,
                    first_send = %row.scheduled_for,
                    "Contact enrolled"
                );
                metrics::counter!("sequences.enrolled").increment(1);
                self.emit(EventType::Enrolled, &enrollment, None);
                self.emit(EventType::StepScheduled, &enrollment, Some(&row));
                Ok(enrollment.id)
            }
            Err(SequencerError::AlreadyEnrolled { enrollment_id }) => {
                debug!(
                    sequence_id = %sequence_id,
                    contact_id = %contact_id,
                    existing = %enrollment_id,
                    "Enrollment skipped, pair already in flight"
                );
                Err(SequencerError::AlreadyEnrolled { enrollment_id })
            }
            Err(e) => Err(e),
        }
    }

    /// Moves an enrollment past its most recently sent step. Fails when an
    /// obligation is still open or nothing has been sent yet.
    pub fn advance(&self, enrollment_id: &Uuid) -> SequencerResult<NextState> {
        let now = self.clock.now();
        let (enrollment, next) = self.store.transaction(|tx| {
            let enrollment = tx.enrollment(enrollment_id)?.clone();
            if let Some(open) = tx.open_obligation(enrollment_id) {
                return Err(SequencerError::Validation(format!(
                    "enrollment {} still has open scheduled email {}",
                    enrollment_id, open.id
                )));
            }
            let sent = tx.last_sent(enrollment_id).cloned().ok_or_else(|| {
                SequencerError::Validation(format!("enrollment {} has not sent anything", enrollment_id))
            })?;
            advance_in_tx(tx, enrollment, &sent, now)
        })?;
        self.report_advance(&enrollment, &next);
        Ok(next)
    }

    /// Notes the provider's message id on a claimed obligation as soon as the
    /// transport accepts it. A row that is reclaimed with this marker set was
    /// already delivered and only needs [`Self::record_sent`].
    pub fn record_delivered(&self, scheduled_email_id: &Uuid, worker_id: &str, message_id: &str) -> SequencerResult<()> {
        self.store.transaction(|tx| {
            let mut row = claimed_by(tx, scheduled_email_id, worker_id)?;
            row.message_id = Some(message_id.to_string());
            tx.put_scheduled(row)
        })?;
        debug!(scheduled_email_id = %scheduled_email_id, message_id, "Delivery accepted by transport");
        Ok(())
    }

    /// Marks a claimed obligation sent and advances its enrollment in one
    /// transaction.
    pub fn record_sent(
        &self,
        scheduled_email_id: &Uuid,
        worker_id: &str,
        message_id: &str,
        at: DateTime<Utc>,
    ) -> SequencerResult<NextState> {
        let (row, enrollment, next) = self.store.transaction(|tx| {
            let mut row = claimed_by(tx, scheduled_email_id, worker_id)?;
            obligation_machine().check(&row.status, &ScheduledEmailStatus::Sent)?;
            row.status = ScheduledEmailStatus::Sent;
            row.attempts += 1;
            row.message_id = Some(message_id.to_string());
            row.last_error = None;
            row.lease_expires_at = None;
            tx.put_scheduled(row.clone())?;

            let enrollment = tx.enrollment(&row.enrollment_id)?.clone();
            let (enrollment, next) = advance_in_tx(tx, enrollment, &row, at)?;
            Ok((row, enrollment, next))
        })?;

        self.event_sink.emit(
            self.event(EventType::EmailSent, &enrollment, Some(&row))
                .with_detail(message_id),
        );
        self.report_advance(&enrollment, &next);
        Ok(next)
    }

    /// Records a failed send attempt. With `retry_at` the claim is released
    /// for a later cycle; without it the obligation fails and the enrollment
    /// halts until an operator resolves it.
    pub fn record_send_failure(
        &self,
        scheduled_email_id: &Uuid,
        worker_id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> SequencerResult<FailureOutcome> {
        let (row, enrollment, outcome) = self.store.transaction(|tx| {
            let mut row = claimed_by(tx, scheduled_email_id, worker_id)?;
            row.attempts += 1;
            row.last_error = Some(error.to_string());
            let mut enrollment = tx.enrollment(&row.enrollment_id)?.clone();

            let outcome = match retry_at {
                Some(next_attempt_at) => {
                    obligation_machine().check(&row.status, &ScheduledEmailStatus::Pending)?;
                    row.status = ScheduledEmailStatus::Pending;
                    row.clear_claim();
                    row.next_attempt_at = next_attempt_at;
                    FailureOutcome::Retrying {
                        attempts: row.attempts,
                        next_attempt_at,
                    }
                }
                None => {
                    obligation_machine().check(&row.status, &ScheduledEmailStatus::Failed)?;
                    row.status = ScheduledEmailStatus::Failed;
                    row.lease_expires_at = None;
                    if !enrollment.status.is_terminal() {
                        enrollment_machine().check(&enrollment.status, &EnrollmentStatus::Halted)?;
                        enrollment.status = EnrollmentStatus::Halted;
                        enrollment.updated_at = at;
                        tx.put_enrollment(enrollment.clone())?;
                    }
                    FailureOutcome::Failed {
                        attempts: row.attempts,
                    }
                }
            };
            tx.put_scheduled(row.clone())?;
            Ok((row, enrollment, outcome))
        })?;

        match &outcome {
            FailureOutcome::Retrying { attempts, next_attempt_at } => {
                warn!(
                    scheduled_email_id = %row.id,
                    enrollment_id = %enrollment.id,
                    attempts = *attempts,
                    next_attempt_at = %next_attempt_at,
                    error = %error,
                    "Send failed, will retry"
                );
                self.event_sink.emit(
                    self.event(EventType::SendRetried, &enrollment, Some(&row))
                        .with_detail(error),
                );
            }
            FailureOutcome::Failed { attempts } => {
                warn!(
                    scheduled_email_id = %row.id,
                    enrollment_id = %enrollment.id,
                    attempts = *attempts,
                    error = %error,
                    "Send failed permanently, enrollment halted for operator attention"
                );
                self.event_sink.emit(
                    self.event(EventType::SendFailed, &enrollment, Some(&row))
                        .with_detail(error),
                );
                if enrollment.status == EnrollmentStatus::Halted {
                    self.emit(EventType::EnrollmentHalted, &enrollment, None);
                }
            }
        }
        Ok(outcome)
    }

    /// Cancels a claimed obligation and its enrollment because the contact
    /// can no longer be mailed (unsubscribed or deleted).
    pub fn record_suppressed(
        &self,
        scheduled_email_id: &Uuid,
        worker_id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> SequencerResult<()> {
        let (row, enrollment) = self.store.transaction(|tx| {
            let mut row = claimed_by(tx, scheduled_email_id, worker_id)?;
            obligation_machine().check(&row.status, &ScheduledEmailStatus::Cancelled)?;
            row.status = ScheduledEmailStatus::Cancelled;
            row.last_error = Some(reason.to_string());
            row.lease_expires_at = None;
            tx.put_scheduled(row.clone())?;

            let mut enrollment = tx.enrollment(&row.enrollment_id)?.clone();
            if !enrollment.status.is_terminal() {
                enrollment.status = EnrollmentStatus::Cancelled;
                enrollment.updated_at = at;
                tx.put_enrollment(enrollment.clone())?;
            }
            Ok((row, enrollment))
        })?;

        info!(
            scheduled_email_id = %row.id,
            enrollment_id = %enrollment.id,
            contact_id = %enrollment.contact_id,
            outcome = "suppressed",
            reason = %reason,
            "Send suppressed, enrollment cancelled"
        );
        self.event_sink.emit(
            self.event(EventType::SendSuppressed, &enrollment, Some(&row))
                .with_detail(reason),
        );
        self.emit(EventType::EnrollmentCancelled, &enrollment, None);
        Ok(())
    }

    /// Drops a claim whose enrollment left `active` before the send started.
    pub fn abandon_claim(&self, scheduled_email_id: &Uuid, worker_id: &str) -> SequencerResult<()> {
        let row = self.store.transaction(|tx| {
            let mut row = claimed_by(tx, scheduled_email_id, worker_id)?;
            row.status = ScheduledEmailStatus::Cancelled;
            row.lease_expires_at = None;
            row.last_error = Some("enrollment no longer active".to_string());
            tx.put_scheduled(row.clone())?;
            Ok(row)
        })?;
        debug!(
            scheduled_email_id = %row.id,
            enrollment_id = %row.enrollment_id,
            "Claim abandoned, enrollment not active"
        );
        Ok(())
    }

    /// Pauses an enrollment, cancelling its pending obligation. A claimed
    /// send already in a worker's hands is allowed to finish.
    pub fn pause(&self, enrollment_id: &Uuid) -> SequencerResult<()> {
        let now = self.clock.now();
        let changed = self.store.transaction(|tx| {
            let mut enrollment = tx.enrollment(enrollment_id)?.clone();
            if enrollment.status == EnrollmentStatus::Paused {
                return Ok(None);
            }
            enrollment_machine().check(&enrollment.status, &EnrollmentStatus::Paused)?;
            cancel_pending(tx, enrollment_id)?;
            enrollment.status = EnrollmentStatus::Paused;
            enrollment.updated_at = now;
            tx.put_enrollment(enrollment.clone())?;
            Ok(Some(enrollment))
        })?;

        if let Some(enrollment) = changed {
            info!(
                enrollment_id = %enrollment_id,
                current_step = enrollment.current_step,
                "Enrollment paused"
            );
            self.emit(EventType::EnrollmentPaused, &enrollment, None);
        }
        Ok(())
    }

    /// Resumes a paused enrollment, scheduling its next unsent step from
    /// `at`. Returns the new obligation, or `None` when a claimed send is
    /// still in flight or no steps remain.
    pub fn resume(&self, enrollment_id: &Uuid, at: DateTime<Utc>) -> SequencerResult<Option<ScheduledEmail>> {
        let (enrollment, row) = self.store.transaction(|tx| {
            let mut enrollment = tx.enrollment(enrollment_id)?.clone();
            if enrollment.status != EnrollmentStatus::Paused {
                return Err(SequencerError::InvalidTransition {
                    from: format!("{:?}", enrollment.status),
                    to: "Active (resume)".to_string(),
                });
            }
            enrollment.updated_at = at;

            if tx.open_obligation(enrollment_id).is_some() {
                enrollment.status = EnrollmentStatus::Active;
                tx.put_enrollment(enrollment.clone())?;
                return Ok((enrollment, None));
            }

            let sequence = tx.sequence(&enrollment.sequence_id)?.clone();
            let row = schedule_next(tx, &sequence, &mut enrollment, at)?;
            tx.put_enrollment(enrollment.clone())?;
            Ok((enrollment, row))
        })?;

        info!(
            enrollment_id = %enrollment_id,
            current_step = enrollment.current_step,
            next_send = ?row.as_ref().map(|r| r.scheduled_for),
            "Enrollment resumed"
        );
        self.emit(EventType::EnrollmentResumed, &enrollment, None);
        match &row {
            Some(row) => self.emit(EventType::StepScheduled, &enrollment, Some(row)),
            None if enrollment.status == EnrollmentStatus::Completed => {
                self.emit(EventType::EnrollmentCompleted, &enrollment, None)
            }
            None => {}
        }
        Ok(row)
    }

    /// Cancels an enrollment and its pending obligation. Idempotent; a
    /// claimed send in flight completes but schedules nothing further.
    pub fn cancel(&self, enrollment_id: &Uuid) -> SequencerResult<()> {
        let now = self.clock.now();
        let changed = self.store.transaction(|tx| cancel_in_tx(tx, enrollment_id, now))?;
        if let Some(enrollment) = changed {
            info!(enrollment_id = %enrollment_id, "Enrollment cancelled");
            self.emit(EventType::EnrollmentCancelled, &enrollment, None);
        }
        Ok(())
    }

    /// Cancels every in-flight enrollment of a contact, e.g. after the
    /// contact was deleted. Returns the cancelled enrollment ids.
    pub fn cancel_for_contact(&self, contact_id: &Uuid) -> SequencerResult<Vec<Uuid>> {
        let now = self.clock.now();
        let cancelled = self.store.transaction(|tx| {
            let ids: Vec<Uuid> = tx
                .enrollments_for_contact(contact_id)
                .into_iter()
                .filter(|e| e.status.is_in_flight())
                .map(|e| e.id)
                .collect();
            let mut cancelled = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(enrollment) = cancel_in_tx(tx, &id, now)? {
                    cancelled.push(enrollment);
                }
            }
            Ok(cancelled)
        })?;

        info!(contact_id = %contact_id, count = cancelled.len(), "Cancelled contact enrollments");
        for enrollment in &cancelled {
            self.emit(EventType::EnrollmentCancelled, enrollment, None);
        }
        Ok(cancelled.into_iter().map(|e| e.id).collect())
    }

    /// Operator path out of `halted`: either re-send the failed step or skip
    /// it, scheduling from `at`.
    ///
    /// The failed step is always `current_step + 1`; the editor refuses edits
    /// that would move it while the enrollment is halted.
    pub fn resolve_failure(
        &self,
        enrollment_id: &Uuid,
        resolution: FailureResolution,
        at: DateTime<Utc>,
    ) -> SequencerResult<NextState> {
        let (enrollment, next) = self.store.transaction(|tx| {
            let mut enrollment = tx.enrollment(enrollment_id)?.clone();
            if enrollment.status != EnrollmentStatus::Halted {
                return Err(SequencerError::InvalidTransition {
                    from: format!("{:?}", enrollment.status),
                    to: "Active (resolve failure)".to_string(),
                });
            }
            let sequence = tx.sequence(&enrollment.sequence_id)?.clone();
            let pinned = sequence.step_at(enrollment.current_step + 1).map(|s| s.id);
            if let Some(failed) = tx.last_failed(enrollment_id) {
                if pinned != Some(failed.step_id) {
                    return Err(SequencerError::Invariant(format!(
                        "enrollment {} failed on step {} but step {} is {:?}",
                        enrollment_id,
                        failed.step_id,
                        enrollment.current_step + 1,
                        pinned
                    )));
                }
            }

            enrollment.status = EnrollmentStatus::Active;
            enrollment.updated_at = at;
            if resolution == FailureResolution::Skip {
                enrollment.current_step += 1;
            }

            let row = schedule_next(tx, &sequence, &mut enrollment, at)?;
            tx.put_enrollment(enrollment.clone())?;
            let next = match row {
                Some(row) => NextState::Scheduled {
                    scheduled_email_id: row.id,
                    step_order: enrollment.current_step + 1,
                    scheduled_for: row.scheduled_for,
                },
                None => NextState::Completed,
            };
            Ok((enrollment, next))
        })?;

        info!(
            enrollment_id = %enrollment_id,
            resolution = ?resolution,
            next = ?next,
            "Halted enrollment resolved by operator"
        );
        self.report_advance(&enrollment, &next);
        Ok(next)
    }

    fn report_advance(&self, enrollment: &Enrollment, next: &NextState) {
        match next {
            NextState::Scheduled {
                scheduled_email_id,
                step_order,
                scheduled_for,
            } => {
                debug!(
                    enrollment_id = %enrollment.id,
                    step = *step_order,
                    scheduled_for = %scheduled_for,
                    "Next step scheduled"
                );
                self.event_sink.emit(
                    self.event(EventType::StepScheduled, enrollment, None)
                        .with_scheduled_email(*scheduled_email_id),
                );
            }
            NextState::Completed => {
                info!(enrollment_id = %enrollment.id, "Enrollment completed");
                metrics::counter!("sequences.completed").increment(1);
                self.emit(EventType::EnrollmentCompleted, enrollment, None);
            }
            NextState::Held { status } => {
                debug!(
                    enrollment_id = %enrollment.id,
                    status = ?status,
                    "Send recorded, enrollment not active so nothing scheduled"
                );
            }
        }
    }

    fn event(
        &self,
        event_type: EventType,
        enrollment: &Enrollment,
        row: Option<&ScheduledEmail>,
    ) -> drip_core::types::SequenceEvent {
        let mut event = make_event(event_type, enrollment.sequence_id, self.clock.now())
            .with_enrollment(enrollment.id, enrollment.contact_id);
        event.node_id = self.node_id.clone();
        match row {
            Some(row) => event.with_step(row.step_id).with_scheduled_email(row.id),
            None => event,
        }
    }

    fn emit(&self, event_type: EventType, enrollment: &Enrollment, row: Option<&ScheduledEmail>) {
        self.event_sink.emit(self.event(event_type, enrollment, row));
    }
}

/// Fetches an obligation, checking this worker still holds its claim.
fn claimed_by(tx: &Tx<'_>, scheduled_email_id: &Uuid, worker_id: &str) -> SequencerResult<ScheduledEmail> {
    let row = tx.scheduled_email(scheduled_email_id)?;
    if row.status != ScheduledEmailStatus::Claimed || row.claimed_by.as_deref() != Some(worker_id) {
        return Err(SequencerError::ClaimLost(*scheduled_email_id));
    }
    Ok(row.clone())
}

/// Records `sent` as the enrollment's progress and schedules what follows.
///
/// Progress is taken from the sent step's current position, so edits made
/// while the send was in flight are honoured. The next step is measured from
/// the sent obligation's `scheduled_for`, keeping cumulative delays stable
/// when workers run behind.
fn advance_in_tx(
    tx: &mut Tx<'_>,
    mut enrollment: Enrollment,
    sent: &ScheduledEmail,
    at: DateTime<Utc>,
) -> SequencerResult<(Enrollment, NextState)> {
    let sequence = tx.sequence(&enrollment.sequence_id)?.clone();
    enrollment.current_step = sequence
        .step(&sent.step_id)
        .map(|step| step.order)
        .unwrap_or(enrollment.current_step + 1);
    enrollment.updated_at = at;

    if enrollment.status != EnrollmentStatus::Active {
        let status = enrollment.status;
        tx.put_enrollment(enrollment.clone())?;
        return Ok((enrollment, NextState::Held { status }));
    }

    let next = match sequence.step_at(enrollment.current_step + 1) {
        None => {
            enrollment_machine().check(&enrollment.status, &EnrollmentStatus::Completed)?;
            enrollment.status = EnrollmentStatus::Completed;
            NextState::Completed
        }
        Some(step) => {
            let base = sent.scheduled_for;
            let row = ScheduledEmail::pending(enrollment.id, step.id, base, fire_time(&sequence, step, base), at);
            let next = NextState::Scheduled {
                scheduled_email_id: row.id,
                step_order: step.order,
                scheduled_for: row.scheduled_for,
            };
            tx.put_scheduled(row)?;
            next
        }
    };
    tx.put_enrollment(enrollment.clone())?;
    Ok((enrollment, next))
}

/// Schedules step `current_step + 1` from `at`, or completes the enrollment
/// when there is none. The caller persists the enrollment.
fn schedule_next(
    tx: &mut Tx<'_>,
    sequence: &Sequence,
    enrollment: &mut Enrollment,
    at: DateTime<Utc>,
) -> SequencerResult<Option<ScheduledEmail>> {
    match sequence.step_at(enrollment.current_step + 1) {
        None => {
            enrollment.status = EnrollmentStatus::Completed;
            Ok(None)
        }
        Some(step) => {
            enrollment.status = EnrollmentStatus::Active;
            let row = ScheduledEmail::pending(enrollment.id, step.id, at, fire_time(sequence, step, at), at);
            tx.put_scheduled(row.clone())?;
            Ok(Some(row))
        }
    }
}

/// Cancels the enrollment's obligation if it is still pending. Claimed
/// obligations belong to a worker and are left alone.
fn cancel_pending(tx: &mut Tx<'_>, enrollment_id: &Uuid) -> SequencerResult<Option<Uuid>> {
    let Some(open) = tx.open_obligation(enrollment_id).cloned() else {
        return Ok(None);
    };
    if open.status != ScheduledEmailStatus::Pending {
        return Ok(None);
    }
    let mut row = open;
    row.status = ScheduledEmailStatus::Cancelled;
    let id = row.id;
    tx.put_scheduled(row)?;
    Ok(Some(id))
}

pub(crate) fn cancel_in_tx(
    tx: &mut Tx<'_>,
    enrollment_id: &Uuid,
    at: DateTime<Utc>,
) -> SequencerResult<Option<Enrollment>> {
    let mut enrollment = tx.enrollment(enrollment_id)?.clone();
    if enrollment.status.is_terminal() {
        return Ok(None);
    }
    cancel_pending(tx, enrollment_id)?;
    enrollment.status = EnrollmentStatus::Cancelled;
    enrollment.updated_at = at;
    tx.put_enrollment(enrollment.clone())?;
    Ok(Some(enrollment))
}
