//! Sequence authoring: lifecycle transitions and step edits.
//!
//! Structural edits (insert, remove, reorder) are applied to a copy of the
//! step list, checked against every in-flight enrollment, and only then
//! committed. Each enrollment must still find the steps it already received
//! at positions `1..=current_step`. A send already claimed by a worker, or
//! the failed step a halted enrollment is waiting on, must stay the
//! enrollment's next step. After a commit, every pending
//! obligation of the sequence is re-pointed at `current_step + 1` and its
//! fire time recomputed from its original base.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use drip_core::clock::{system_clock, Clock};
use drip_core::event_bus::{make_event, noop_sink, EventSink};
use drip_core::types::EventType;
use drip_core::{SequencerError, SequencerResult};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::enrollment::cancel_in_tx;
use crate::schedule::fire_time;
use crate::store::{SequenceStore, Tx};
use crate::types::{
    default_timezone, EnrollmentStatus, ScheduledEmailStatus, Sender, Sequence, SequenceStatus,
    SequenceTrigger, Step, StepContent,
};

/// Input for [`SequenceEditor::create_sequence`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSequence {
    pub client_id: Uuid,
    pub name: String,
    pub trigger: SequenceTrigger,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub preferred_time: Option<NaiveTime>,
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
    #[serde(default)]
    pub sender: Option<Sender>,
}

/// Effect of an edit on live enrollments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditReport {
    /// Pending scheduled emails whose step or fire time changed.
    pub rescheduled: Vec<Uuid>,
    /// Enrollments completed because no step remains after their position.
    pub completed: Vec<Uuid>,
}

#[derive(Clone)]
pub struct SequenceEditor {
    store: Arc<SequenceStore>,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for SequenceEditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceEditor").finish()
    }
}

impl SequenceEditor {
    pub fn new(store: Arc<SequenceStore>) -> Self {
        Self {
            store,
            clock: system_clock(),
            event_sink: noop_sink(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Creates a draft sequence. Steps either all carry order 0 (numbered in
    /// the given order) or carry exactly the orders `1..=N`.
    pub fn create_sequence(&self, new: NewSequence) -> SequencerResult<Sequence> {
        if new.name.trim().is_empty() {
            return Err(SequencerError::Validation("sequence name is required".into()));
        }
        let steps = normalize_steps(new.steps)?;
        let now = self.clock.now();
        let sequence = Sequence {
            id: Uuid::new_v4(),
            client_id: new.client_id,
            name: new.name,
            status: SequenceStatus::Draft,
            trigger: new.trigger,
            steps,
            preferred_time: new.preferred_time,
            timezone: new.timezone,
            sender: new.sender,
            total_enrolled: 0,
            created_at: now,
            updated_at: now,
        };
        self.store.transaction(|tx| {
            tx.put_sequence(sequence.clone());
            Ok(())
        })?;
        info!(
            sequence_id = %sequence.id,
            name = %sequence.name,
            steps = sequence.steps.len(),
            "Sequence created"
        );
        Ok(sequence)
    }

    /// Draft or paused to active. Requires a sender and at least one step
    /// with a subject and body.
    pub fn activate(&self, sequence_id: &Uuid) -> SequencerResult<()> {
        self.transition(sequence_id, SequenceStatus::Active, |seq| match seq.status {
            SequenceStatus::Draft | SequenceStatus::Paused => validate_for_activation(seq),
            _ => Err(invalid(seq.status, SequenceStatus::Active)),
        })
    }

    /// Stops dispatch for the whole sequence. Pending obligations wait and
    /// fire on re-activation.
    pub fn pause(&self, sequence_id: &Uuid) -> SequencerResult<()> {
        self.transition(sequence_id, SequenceStatus::Paused, |seq| match seq.status {
            SequenceStatus::Active => Ok(()),
            _ => Err(invalid(seq.status, SequenceStatus::Paused)),
        })
    }

    pub fn archive(&self, sequence_id: &Uuid) -> SequencerResult<()> {
        self.transition(sequence_id, SequenceStatus::Archived, |_| Ok(()))
    }

    /// Cancels every in-flight enrollment and archives the sequence.
    /// Returns the cancelled enrollment ids.
    pub fn delete_sequence(&self, sequence_id: &Uuid) -> SequencerResult<Vec<Uuid>> {
        let now = self.clock.now();
        let cancelled = self.store.transaction(|tx| {
            let mut sequence = tx.sequence(sequence_id)?.clone();
            let ids: Vec<Uuid> = tx
                .enrollments_for_sequence(sequence_id)
                .into_iter()
                .filter(|e| e.status.is_in_flight())
                .map(|e| e.id)
                .collect();
            let mut cancelled = Vec::with_capacity(ids.len());
            for id in ids {
                if cancel_in_tx(tx, &id, now)?.is_some() {
                    cancelled.push(id);
                }
            }
            sequence.status = SequenceStatus::Archived;
            sequence.updated_at = now;
            tx.put_sequence(sequence);
            Ok(cancelled)
        })?;

        info!(
            sequence_id = %sequence_id,
            cancelled_enrollments = cancelled.len(),
            "Sequence deleted"
        );
        self.event_sink.emit(
            make_event(EventType::SequenceStatusChanged, *sequence_id, now)
                .with_detail(format!("deleted, {} enrollments cancelled", cancelled.len())),
        );
        Ok(cancelled)
    }

    /// Appends a step after the current last one.
    pub fn add_step(&self, sequence_id: &Uuid, step: Step) -> SequencerResult<(Uuid, EditReport)> {
        let step_id = step.id;
        let report = self.structural_edit(sequence_id, "add_step", |steps| {
            steps.push(step);
            Ok(())
        })?;
        Ok((step_id, report))
    }

    /// Inserts a step so that it ends up at `position` (1-based).
    pub fn insert_step(
        &self,
        sequence_id: &Uuid,
        position: u32,
        step: Step,
    ) -> SequencerResult<(Uuid, EditReport)> {
        let step_id = step.id;
        let report = self.structural_edit(sequence_id, "insert_step", |steps| {
            if position == 0 || position as usize > steps.len() + 1 {
                return Err(SequencerError::Validation(format!(
                    "insert position {} outside 1..={}",
                    position,
                    steps.len() + 1
                )));
            }
            steps.insert(position as usize - 1, step);
            Ok(())
        })?;
        Ok((step_id, report))
    }

    pub fn remove_step(&self, sequence_id: &Uuid, step_id: &Uuid) -> SequencerResult<EditReport> {
        self.structural_edit(sequence_id, "remove_step", |steps| {
            let index = steps
                .iter()
                .position(|s| s.id == *step_id)
                .ok_or_else(|| SequencerError::not_found("Step", *step_id))?;
            steps.remove(index);
            Ok(())
        })
    }

    /// Reorders steps; `step_ids` must name every step exactly once.
    pub fn reorder_steps(&self, sequence_id: &Uuid, step_ids: &[Uuid]) -> SequencerResult<EditReport> {
        self.structural_edit(sequence_id, "reorder_steps", |steps| {
            let current: HashSet<Uuid> = steps.iter().map(|s| s.id).collect();
            let requested: HashSet<Uuid> = step_ids.iter().copied().collect();
            if requested.len() != step_ids.len() || current != requested {
                return Err(SequencerError::Validation(
                    "reorder must list every step of the sequence exactly once".into(),
                ));
            }
            steps.sort_by_key(|s| step_ids.iter().position(|id| *id == s.id));
            Ok(())
        })
    }

    /// Changes a step's delay and reschedules pending sends of that step.
    pub fn update_step_delay(
        &self,
        sequence_id: &Uuid,
        step_id: &Uuid,
        delay_days: u32,
        delay_hours: u32,
    ) -> SequencerResult<EditReport> {
        self.edit(sequence_id, "update_step_delay", |seq| {
            let step = step_mut(seq, step_id)?;
            step.delay_days = delay_days;
            step.delay_hours = delay_hours;
            Ok(())
        })
    }

    /// Replaces a step's subject and/or body. Sends already claimed render
    /// whatever was current at claim time.
    pub fn update_step_content(
        &self,
        sequence_id: &Uuid,
        step_id: &Uuid,
        subject: Option<String>,
        content: Option<StepContent>,
    ) -> SequencerResult<()> {
        self.edit(sequence_id, "update_step_content", |seq| {
            let step = step_mut(seq, step_id)?;
            if let Some(subject) = subject {
                if subject.trim().is_empty() {
                    return Err(SequencerError::Validation("step subject cannot be empty".into()));
                }
                step.subject = subject;
            }
            if let Some(content) = content {
                step.content = content;
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Sets or clears the preferred send time; all pending sends of the
    /// sequence are recomputed.
    pub fn set_preferred_time(
        &self,
        sequence_id: &Uuid,
        preferred_time: Option<NaiveTime>,
    ) -> SequencerResult<EditReport> {
        self.edit(sequence_id, "set_preferred_time", |seq| {
            seq.preferred_time = preferred_time;
            Ok(())
        })
    }

    pub fn set_timezone(&self, sequence_id: &Uuid, timezone: Tz) -> SequencerResult<EditReport> {
        self.edit(sequence_id, "set_timezone", |seq| {
            seq.timezone = timezone;
            Ok(())
        })
    }

    fn transition(
        &self,
        sequence_id: &Uuid,
        to: SequenceStatus,
        guard: impl FnOnce(&Sequence) -> SequencerResult<()>,
    ) -> SequencerResult<()> {
        let now = self.clock.now();
        let from = self.store.transaction(|tx| {
            let mut sequence = tx.sequence(sequence_id)?.clone();
            let from = sequence.status;
            if from == to {
                return Ok(None);
            }
            if from == SequenceStatus::Archived {
                return Err(invalid(from, to));
            }
            guard(&sequence)?;
            sequence.status = to;
            sequence.updated_at = now;
            tx.put_sequence(sequence);
            Ok(Some(from))
        })?;

        if let Some(from) = from {
            info!(sequence_id = %sequence_id, from = ?from, to = ?to, "Sequence status changed");
            self.event_sink.emit(
                make_event(EventType::SequenceStatusChanged, *sequence_id, now)
                    .with_detail(format!("{:?} -> {:?}", from, to)),
            );
        }
        Ok(())
    }

    fn structural_edit(
        &self,
        sequence_id: &Uuid,
        operation: &'static str,
        f: impl FnOnce(&mut Vec<Step>) -> SequencerResult<()>,
    ) -> SequencerResult<EditReport> {
        self.edit(sequence_id, operation, |seq| {
            f(&mut seq.steps)?;
            renumber(&mut seq.steps);
            Ok(())
        })
    }

    /// Applies `f` to a copy of the sequence, checks the result against
    /// in-flight enrollments, commits it and realigns pending sends.
    fn edit(
        &self,
        sequence_id: &Uuid,
        operation: &'static str,
        f: impl FnOnce(&mut Sequence) -> SequencerResult<()>,
    ) -> SequencerResult<EditReport> {
        let now = self.clock.now();
        let result = self.store.transaction(|tx| {
            let before = tx.sequence(sequence_id)?.clone();
            if before.status == SequenceStatus::Archived {
                return Err(SequencerError::Validation(format!(
                    "sequence {} is archived",
                    sequence_id
                )));
            }
            let mut after = before.clone();
            f(&mut after)?;
            check_in_flight(tx, &before, &after)?;
            after.updated_at = now;
            tx.put_sequence(after.clone());
            realign(tx, &after, now)
        });

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                if matches!(e, SequencerError::EditConflict(_)) {
                    warn!(sequence_id = %sequence_id, operation, error = %e, "Sequence edit rejected");
                    metrics::counter!("sequences.edit_conflicts").increment(1);
                }
                return Err(e);
            }
        };

        info!(
            sequence_id = %sequence_id,
            operation,
            rescheduled = report.rescheduled.len(),
            completed = report.completed.len(),
            "Sequence edited"
        );
        self.event_sink
            .emit(make_event(EventType::SequenceEdited, *sequence_id, now).with_detail(operation));
        for id in &report.rescheduled {
            self.event_sink.emit(
                make_event(EventType::StepRescheduled, *sequence_id, now).with_scheduled_email(*id),
            );
        }
        for id in &report.completed {
            self.event_sink.emit(
                make_event(EventType::EnrollmentCompleted, *sequence_id, now).with_detail(id.to_string()),
            );
        }
        Ok(report)
    }
}

fn invalid(from: SequenceStatus, to: SequenceStatus) -> SequencerError {
    SequencerError::InvalidTransition {
        from: format!("{:?}", from),
        to: format!("{:?}", to),
    }
}

fn step_mut<'a>(sequence: &'a mut Sequence, step_id: &Uuid) -> SequencerResult<&'a mut Step> {
    sequence
        .steps
        .iter_mut()
        .find(|s| s.id == *step_id)
        .ok_or_else(|| SequencerError::not_found("Step", *step_id))
}

fn renumber(steps: &mut [Step]) {
    for (index, step) in steps.iter_mut().enumerate() {
        step.order = index as u32 + 1;
    }
}

fn normalize_steps(mut steps: Vec<Step>) -> SequencerResult<Vec<Step>> {
    let ids: HashSet<Uuid> = steps.iter().map(|s| s.id).collect();
    if ids.len() != steps.len() {
        return Err(SequencerError::Validation("duplicate step id".into()));
    }
    if steps.iter().all(|s| s.order == 0) {
        renumber(&mut steps);
        return Ok(steps);
    }
    steps.sort_by_key(|s| s.order);
    for (index, step) in steps.iter().enumerate() {
        if step.order != index as u32 + 1 {
            return Err(SequencerError::Validation(format!(
                "step orders must be exactly 1..={}, found {}",
                steps.len(),
                step.order
            )));
        }
    }
    Ok(steps)
}

fn validate_for_activation(sequence: &Sequence) -> SequencerResult<()> {
    match &sequence.sender {
        Some(sender) if sender.email.contains('@') => {}
        _ => {
            return Err(SequencerError::Validation(
                "a sender address is required to activate".into(),
            ))
        }
    }
    if sequence.steps.is_empty() {
        return Err(SequencerError::Validation(
            "a sequence needs at least one step to activate".into(),
        ));
    }
    for step in &sequence.steps {
        if step.subject.trim().is_empty() {
            return Err(SequencerError::Validation(format!("step {} has no subject", step.order)));
        }
        if let StepContent::Inline { html } = &step.content {
            if html.trim().is_empty() {
                return Err(SequencerError::Validation(format!("step {} has no body", step.order)));
            }
        }
    }
    Ok(())
}

/// Rejects an edited step list that would rewrite history for any in-flight
/// enrollment. A claimed send and the step a halted enrollment failed on must
/// also stay at `current_step + 1`.
fn check_in_flight(tx: &Tx<'_>, before: &Sequence, after: &Sequence) -> SequencerResult<()> {
    for enrollment in tx
        .enrollments_for_sequence(&before.id)
        .into_iter()
        .filter(|e| e.status.is_in_flight())
    {
        for sent in before.steps.iter().filter(|s| s.order <= enrollment.current_step) {
            match after.step(&sent.id) {
                Some(step) if step.order <= enrollment.current_step => {}
                _ => {
                    return Err(SequencerError::EditConflict(format!(
                        "enrollment {} already received step {} ({})",
                        enrollment.id, sent.order, sent.subject
                    )))
                }
            }
        }
        let next = after.step_at(enrollment.current_step + 1).map(|s| s.id);
        if let Some(open) = tx.open_obligation(&enrollment.id) {
            if open.status == ScheduledEmailStatus::Claimed && next != Some(open.step_id) {
                return Err(SequencerError::EditConflict(format!(
                    "enrollment {} has a send of step {} in progress",
                    enrollment.id,
                    enrollment.current_step + 1
                )));
            }
        }
        if enrollment.status == EnrollmentStatus::Halted {
            if let Some(failed) = tx.last_failed(&enrollment.id) {
                if next != Some(failed.step_id) {
                    return Err(SequencerError::EditConflict(format!(
                        "enrollment {} is halted on step {} awaiting operator resolution",
                        enrollment.id,
                        enrollment.current_step + 1
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Points every pending obligation of the sequence at the step following its
/// enrollment's position and recomputes the fire time from its base.
/// Enrollments with nothing left to send complete.
fn realign(tx: &mut Tx<'_>, sequence: &Sequence, at: DateTime<Utc>) -> SequencerResult<EditReport> {
    let pending: Vec<_> = tx
        .enrollments_for_sequence(&sequence.id)
        .into_iter()
        .filter(|e| e.status.is_in_flight())
        .filter_map(|e| {
            tx.open_obligation(&e.id)
                .filter(|row| row.status == ScheduledEmailStatus::Pending)
                .map(|row| (e.clone(), row.clone()))
        })
        .collect();

    let mut report = EditReport::default();
    for (mut enrollment, mut row) in pending {
        match sequence.step_at(enrollment.current_step + 1) {
            None => {
                row.status = ScheduledEmailStatus::Cancelled;
                row.last_error = Some("step removed".to_string());
                tx.put_scheduled(row)?;
                if enrollment.status == EnrollmentStatus::Active {
                    enrollment.status = EnrollmentStatus::Completed;
                    enrollment.updated_at = at;
                    report.completed.push(enrollment.id);
                    tx.put_enrollment(enrollment)?;
                }
            }
            Some(step) => {
                let fires = fire_time(sequence, step, row.base_at);
                if step.id == row.step_id && fires == row.scheduled_for {
                    continue;
                }
                row.step_id = step.id;
                row.scheduled_for = fires;
                row.next_attempt_at = if row.attempts > 0 {
                    fires.max(row.next_attempt_at)
                } else {
                    fires
                };
                report.rescheduled.push(row.id);
                tx.put_scheduled(row)?;
            }
        }
    }
    Ok(report)
}
