//! Transactional store for sequences, enrollments and scheduled emails.
//!
//! Every mutation runs inside [`SequenceStore::transaction`]: the closure sees
//! a [`Tx`] over the whole state, and if it returns an error every row it
//! touched is restored. Two uniqueness constraints are enforced on write:
//!
//! * at most one in-flight enrollment per (sequence, contact)
//! * at most one open (pending or claimed) scheduled email per enrollment
//!
//! The lock is taken with a deadline, so no caller ever blocks indefinitely.
//!
//! Snapshots are imported without those checks. The repair passes find and
//! cancel duplicates that an import let through.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use drip_core::{SequencerError, SequencerResult};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::types::{
    Enrollment, EnrollmentStatus, ScheduledEmail, ScheduledEmailStatus, Sequence, SequenceStatus,
};

/// Serializable image of the whole store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub sequences: Vec<Sequence>,
    pub enrollments: Vec<Enrollment>,
    pub scheduled_emails: Vec<ScheduledEmail>,
}

/// Duplicate open obligations found and cancelled for one enrollment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repair {
    pub sequence_id: Uuid,
    pub enrollment_id: Uuid,
    pub kept: Uuid,
    pub cancelled: Vec<Uuid>,
}

/// Duplicate in-flight enrollments found and cancelled for one
/// (sequence, contact) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentRepair {
    pub sequence_id: Uuid,
    pub contact_id: Uuid,
    pub kept: Uuid,
    pub cancelled: Vec<Uuid>,
}

#[derive(Debug, Default)]
pub struct StoreState {
    sequences: HashMap<Uuid, Sequence>,
    enrollments: HashMap<Uuid, Enrollment>,
    scheduled: HashMap<Uuid, ScheduledEmail>,
    /// (sequence_id, contact_id) -> in-flight enrollment
    in_flight: HashMap<(Uuid, Uuid), Uuid>,
    /// enrollment_id -> open scheduled email
    open: HashMap<Uuid, Uuid>,
}

impl StoreState {
    pub fn sequence(&self, id: &Uuid) -> SequencerResult<&Sequence> {
        self.sequences
            .get(id)
            .ok_or_else(|| SequencerError::not_found("Sequence", *id))
    }

    pub fn enrollment(&self, id: &Uuid) -> SequencerResult<&Enrollment> {
        self.enrollments
            .get(id)
            .ok_or_else(|| SequencerError::not_found("Enrollment", *id))
    }

    pub fn scheduled_email(&self, id: &Uuid) -> SequencerResult<&ScheduledEmail> {
        self.scheduled
            .get(id)
            .ok_or_else(|| SequencerError::not_found("ScheduledEmail", *id))
    }

    pub fn sequences(&self) -> impl Iterator<Item = &Sequence> {
        self.sequences.values()
    }

    pub fn in_flight_enrollment(&self, sequence_id: &Uuid, contact_id: &Uuid) -> Option<&Enrollment> {
        self.in_flight
            .get(&(*sequence_id, *contact_id))
            .and_then(|id| self.enrollments.get(id))
    }

    pub fn open_obligation(&self, enrollment_id: &Uuid) -> Option<&ScheduledEmail> {
        self.open
            .get(enrollment_id)
            .and_then(|id| self.scheduled.get(id))
    }

    pub fn enrollments_for_sequence(&self, sequence_id: &Uuid) -> Vec<&Enrollment> {
        self.enrollments
            .values()
            .filter(|e| e.sequence_id == *sequence_id)
            .collect()
    }

    pub fn enrollments_for_contact(&self, contact_id: &Uuid) -> Vec<&Enrollment> {
        self.enrollments
            .values()
            .filter(|e| e.contact_id == *contact_id)
            .collect()
    }

    /// All obligations of an enrollment, oldest first.
    pub fn obligations_for(&self, enrollment_id: &Uuid) -> Vec<&ScheduledEmail> {
        let mut rows: Vec<&ScheduledEmail> = self
            .scheduled
            .values()
            .filter(|s| s.enrollment_id == *enrollment_id)
            .collect();
        rows.sort_by_key(|s| s.created_at);
        rows
    }

    /// The most recently sent obligation of an enrollment.
    pub fn last_sent(&self, enrollment_id: &Uuid) -> Option<&ScheduledEmail> {
        self.scheduled
            .values()
            .filter(|s| s.enrollment_id == *enrollment_id && s.status == ScheduledEmailStatus::Sent)
            .max_by_key(|s| (s.scheduled_for, s.created_at))
    }

    /// The most recent obligation of an enrollment that failed permanently.
    pub fn last_failed(&self, enrollment_id: &Uuid) -> Option<&ScheduledEmail> {
        self.scheduled
            .values()
            .filter(|s| s.enrollment_id == *enrollment_id && s.status == ScheduledEmailStatus::Failed)
            .max_by_key(|s| s.created_at)
    }

    fn set_sequence(&mut self, id: Uuid, row: Option<Sequence>) {
        match row {
            Some(seq) => {
                self.sequences.insert(id, seq);
            }
            None => {
                self.sequences.remove(&id);
            }
        }
    }

    fn set_enrollment(&mut self, id: Uuid, row: Option<Enrollment>) {
        if let Some(old) = self.enrollments.remove(&id) {
            let key = (old.sequence_id, old.contact_id);
            if self.in_flight.get(&key) == Some(&id) {
                self.in_flight.remove(&key);
            }
        }
        if let Some(new) = row {
            if new.status.is_in_flight() {
                self.in_flight.insert((new.sequence_id, new.contact_id), id);
            }
            self.enrollments.insert(id, new);
        }
    }

    fn set_scheduled(&mut self, id: Uuid, row: Option<ScheduledEmail>) {
        if let Some(old) = self.scheduled.remove(&id) {
            if self.open.get(&old.enrollment_id) == Some(&id) {
                self.open.remove(&old.enrollment_id);
            }
        }
        if let Some(new) = row {
            if new.is_open() {
                self.open.insert(new.enrollment_id, id);
            }
            self.scheduled.insert(id, new);
        }
    }

    fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let mut state = StoreState::default();
        for seq in snapshot.sequences {
            state.set_sequence(seq.id, Some(seq));
        }
        // Imported rows bypass the write-time constraints. Newest first, so
        // the oldest row of a duplicate set ends up indexed; the repair
        // passes cancel the rest.
        let mut enrollments = snapshot.enrollments;
        enrollments.sort_by_key(|e| std::cmp::Reverse((e.enrolled_at, e.id)));
        for enrollment in enrollments {
            state.set_enrollment(enrollment.id, Some(enrollment));
        }
        let mut scheduled = snapshot.scheduled_emails;
        scheduled.sort_by_key(|s| std::cmp::Reverse(s.created_at));
        for row in scheduled {
            state.set_scheduled(row.id, Some(row));
        }
        state
    }

    fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            sequences: self.sequences.values().cloned().collect(),
            enrollments: self.enrollments.values().cloned().collect(),
            scheduled_emails: self.scheduled.values().cloned().collect(),
        }
    }
}

enum Undo {
    Sequence(Uuid, Option<Sequence>),
    Enrollment(Uuid, Option<Enrollment>),
    Scheduled(Uuid, Option<ScheduledEmail>),
}

/// A write transaction. Reads go through `Deref` to [`StoreState`].
pub struct Tx<'a> {
    state: &'a mut StoreState,
    undo: Vec<Undo>,
}

impl std::ops::Deref for Tx<'_> {
    type Target = StoreState;

    fn deref(&self) -> &StoreState {
        self.state
    }
}

impl Tx<'_> {
    pub fn put_sequence(&mut self, sequence: Sequence) {
        let id = sequence.id;
        let old = self.state.sequences.get(&id).cloned();
        self.undo.push(Undo::Sequence(id, old));
        self.state.set_sequence(id, Some(sequence));
    }

    pub fn put_enrollment(&mut self, enrollment: Enrollment) -> SequencerResult<()> {
        let id = enrollment.id;
        if enrollment.status.is_in_flight() {
            if let Some(existing) = self
                .state
                .in_flight
                .get(&(enrollment.sequence_id, enrollment.contact_id))
            {
                if *existing != id {
                    return Err(SequencerError::AlreadyEnrolled {
                        enrollment_id: *existing,
                    });
                }
            }
        }
        let old = self.state.enrollments.get(&id).cloned();
        self.undo.push(Undo::Enrollment(id, old));
        self.state.set_enrollment(id, Some(enrollment));
        Ok(())
    }

    pub fn put_scheduled(&mut self, row: ScheduledEmail) -> SequencerResult<()> {
        let id = row.id;
        if row.is_open() {
            if let Some(existing) = self.state.open.get(&row.enrollment_id) {
                if *existing != id {
                    return Err(SequencerError::Invariant(format!(
                        "enrollment {} already has open scheduled email {}",
                        row.enrollment_id, existing
                    )));
                }
            }
        }
        let old = self.state.scheduled.get(&id).cloned();
        self.undo.push(Undo::Scheduled(id, old));
        self.state.set_scheduled(id, Some(row));
        Ok(())
    }

    fn rollback(mut self) {
        while let Some(entry) = self.undo.pop() {
            match entry {
                Undo::Sequence(id, row) => self.state.set_sequence(id, row),
                Undo::Enrollment(id, row) => self.state.set_enrollment(id, row),
                Undo::Scheduled(id, row) => self.state.set_scheduled(id, row),
            }
        }
    }
}

/// In-memory implementation of the persistence boundary.
pub struct SequenceStore {
    state: Mutex<StoreState>,
    lock_timeout: StdDuration,
}

impl std::fmt::Debug for SequenceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceStore")
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

impl SequenceStore {
    pub fn new(lock_timeout_ms: u64) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            lock_timeout: StdDuration::from_millis(lock_timeout_ms),
        }
    }

    pub fn from_snapshot(snapshot: StoreSnapshot, lock_timeout_ms: u64) -> Self {
        Self {
            state: Mutex::new(StoreState::from_snapshot(snapshot)),
            lock_timeout: StdDuration::from_millis(lock_timeout_ms),
        }
    }

    pub fn snapshot(&self) -> SequencerResult<StoreSnapshot> {
        Ok(self.lock()?.snapshot())
    }

    fn lock(&self) -> SequencerResult<MutexGuard<'_, StoreState>> {
        self.state
            .try_lock_for(self.lock_timeout)
            .ok_or(SequencerError::StoreTimeout {
                timeout_ms: self.lock_timeout.as_millis() as u64,
            })
    }

    /// Runs `f` atomically; on error every write it made is undone.
    pub fn transaction<R>(
        &self,
        f: impl FnOnce(&mut Tx<'_>) -> SequencerResult<R>,
    ) -> SequencerResult<R> {
        let mut guard = self.lock()?;
        let mut tx = Tx {
            state: &mut *guard,
            undo: Vec::new(),
        };
        match f(&mut tx) {
            Ok(value) => Ok(value),
            Err(e) => {
                debug!(error = %e, writes = tx.undo.len(), "Rolling back store transaction");
                tx.rollback();
                Err(e)
            }
        }
    }

    /// Runs a read-only closure under the store lock.
    pub fn read<R>(&self, f: impl FnOnce(&StoreState) -> R) -> SequencerResult<R> {
        let guard = self.lock()?;
        Ok(f(&guard))
    }

    pub fn sequence(&self, id: &Uuid) -> SequencerResult<Sequence> {
        self.read(|s| s.sequence(id).cloned())?
    }

    pub fn enrollment(&self, id: &Uuid) -> SequencerResult<Enrollment> {
        self.read(|s| s.enrollment(id).cloned())?
    }

    pub fn scheduled_email(&self, id: &Uuid) -> SequencerResult<ScheduledEmail> {
        self.read(|s| s.scheduled_email(id).cloned())?
    }

    pub fn open_obligation(&self, enrollment_id: &Uuid) -> SequencerResult<Option<ScheduledEmail>> {
        self.read(|s| s.open_obligation(enrollment_id).cloned())
    }

    pub fn obligations_for(&self, enrollment_id: &Uuid) -> SequencerResult<Vec<ScheduledEmail>> {
        self.read(|s| s.obligations_for(enrollment_id).into_iter().cloned().collect())
    }

    pub fn active_sequences(&self) -> SequencerResult<Vec<Sequence>> {
        self.read(|s| {
            s.sequences()
                .filter(|seq| seq.status == SequenceStatus::Active)
                .cloned()
                .collect()
        })
    }

    /// Pending obligations whose attempt time has come, earliest scheduled
    /// first. Obligations of sequences that are not active wait.
    pub fn select_due(&self, now: DateTime<Utc>, limit: usize) -> SequencerResult<Vec<ScheduledEmail>> {
        self.read(|s| {
            let mut due: Vec<&ScheduledEmail> = s
                .scheduled
                .values()
                .filter(|row| row.status == ScheduledEmailStatus::Pending && row.next_attempt_at <= now)
                .filter(|row| {
                    s.enrollments
                        .get(&row.enrollment_id)
                        .and_then(|e| s.sequences.get(&e.sequence_id))
                        .is_some_and(|seq| seq.status == SequenceStatus::Active)
                })
                .collect();
            due.sort_by_key(|row| (row.scheduled_for, row.created_at));
            due.into_iter().take(limit).cloned().collect()
        })
    }

    /// Compare-and-set `pending -> claimed`. Returns `None` when the row is
    /// no longer pending, i.e. another worker won.
    pub fn claim(
        &self,
        id: &Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> SequencerResult<Option<ScheduledEmail>> {
        self.transaction(|tx| {
            let mut row = tx.scheduled_email(id)?.clone();
            if row.status != ScheduledEmailStatus::Pending {
                return Ok(None);
            }
            row.status = ScheduledEmailStatus::Claimed;
            row.claimed_at = Some(now);
            row.claimed_by = Some(worker_id.to_string());
            row.lease_expires_at = Some(now + lease);
            tx.put_scheduled(row.clone())?;
            Ok(Some(row))
        })
    }

    /// Returns claims whose lease has run out to `pending`.
    pub fn expire_claims(&self, now: DateTime<Utc>) -> SequencerResult<Vec<ScheduledEmail>> {
        self.transaction(|tx| {
            let expired: Vec<ScheduledEmail> = tx
                .scheduled
                .values()
                .filter(|row| {
                    row.status == ScheduledEmailStatus::Claimed
                        && row.lease_expires_at.is_some_and(|at| at <= now)
                })
                .cloned()
                .collect();
            let mut released = Vec::with_capacity(expired.len());
            for mut row in expired {
                warn!(
                    scheduled_email_id = %row.id,
                    claimed_by = ?row.claimed_by,
                    "Claim lease expired, returning to pending"
                );
                row.status = ScheduledEmailStatus::Pending;
                row.clear_claim();
                tx.put_scheduled(row.clone())?;
                released.push(row);
            }
            Ok(released)
        })
    }

    /// Finds (sequence, contact) pairs with more than one in-flight
    /// enrollment, keeps the earliest enrolled and cancels the rest along
    /// with their pending scheduled emails. A claimed send is left to finish.
    pub fn repair_duplicate_enrollments(&self, at: DateTime<Utc>) -> SequencerResult<Vec<EnrollmentRepair>> {
        let mut guard = self.lock()?;
        let state = &mut *guard;

        let mut by_pair: HashMap<(Uuid, Uuid), Vec<(DateTime<Utc>, Uuid)>> = HashMap::new();
        for enrollment in state.enrollments.values().filter(|e| e.status.is_in_flight()) {
            by_pair
                .entry((enrollment.sequence_id, enrollment.contact_id))
                .or_default()
                .push((enrollment.enrolled_at, enrollment.id));
        }

        let mut repairs = Vec::new();
        for ((sequence_id, contact_id), mut rows) in by_pair {
            if rows.len() < 2 {
                continue;
            }
            rows.sort();
            let kept = rows[0].1;
            let cancelled: Vec<Uuid> = rows[1..].iter().map(|(_, id)| *id).collect();
            error!(
                sequence_id = %sequence_id,
                contact_id = %contact_id,
                kept = %kept,
                cancelled = ?cancelled,
                "Multiple in-flight enrollments for one contact; cancelling duplicates"
            );
            for id in &cancelled {
                let pending: Vec<ScheduledEmail> = state
                    .scheduled
                    .values()
                    .filter(|r| r.enrollment_id == *id && r.status == ScheduledEmailStatus::Pending)
                    .cloned()
                    .collect();
                for mut row in pending {
                    row.status = ScheduledEmailStatus::Cancelled;
                    row.last_error = Some("duplicate enrollment".to_string());
                    state.set_scheduled(row.id, Some(row));
                }
                if let Some(mut enrollment) = state.enrollments.get(id).cloned() {
                    enrollment.status = EnrollmentStatus::Cancelled;
                    enrollment.updated_at = at;
                    state.set_enrollment(*id, Some(enrollment));
                }
            }
            state.in_flight.insert((sequence_id, contact_id), kept);
            repairs.push(EnrollmentRepair {
                sequence_id,
                contact_id,
                kept,
                cancelled,
            });
        }
        Ok(repairs)
    }

    /// Finds enrollments with more than one open obligation, keeps the
    /// earliest-created and cancels the rest.
    pub fn repair_duplicate_obligations(&self) -> SequencerResult<Vec<Repair>> {
        let mut guard = self.lock()?;
        let state = &mut *guard;

        let mut by_enrollment: HashMap<Uuid, Vec<(DateTime<Utc>, Uuid)>> = HashMap::new();
        for row in state.scheduled.values().filter(|r| r.is_open()) {
            by_enrollment
                .entry(row.enrollment_id)
                .or_default()
                .push((row.created_at, row.id));
        }

        let mut repairs = Vec::new();
        for (enrollment_id, mut rows) in by_enrollment {
            if rows.len() < 2 {
                continue;
            }
            rows.sort();
            let kept = rows[0].1;
            let cancelled: Vec<Uuid> = rows[1..].iter().map(|(_, id)| *id).collect();
            error!(
                enrollment_id = %enrollment_id,
                kept = %kept,
                cancelled = ?cancelled,
                "Multiple open scheduled emails for one enrollment; cancelling duplicates"
            );
            for id in &cancelled {
                if let Some(mut row) = state.scheduled.get(id).cloned() {
                    row.status = ScheduledEmailStatus::Cancelled;
                    row.clear_claim();
                    row.last_error = Some("duplicate open obligation".to_string());
                    state.set_scheduled(*id, Some(row));
                }
            }
            state.open.insert(enrollment_id, kept);
            let sequence_id = state
                .enrollments
                .get(&enrollment_id)
                .map(|e| e.sequence_id)
                .unwrap_or_default();
            repairs.push(Repair {
                sequence_id,
                enrollment_id,
                kept,
                cancelled,
            });
        }
        Ok(repairs)
    }
}
