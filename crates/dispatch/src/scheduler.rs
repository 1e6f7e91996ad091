//! Dispatch scheduler: the loop that turns due scheduled emails into sent
//! mail.
//!
//! Each cycle repairs duplicate rows, selects due work, claims it with a
//! compare-and-set and drives every claim through contact lookup, rendering
//! and transport. Every external call carries a deadline. Each claim's lease
//! starts when that row is claimed, and the lease is checked again right
//! before the transport call. A claim this worker loses (lease expired and
//! reclaimed elsewhere) is skipped.
//!
//! Once the transport accepts a message its id is written to the row before
//! the send is recorded, and both writes are retried on lock contention. A
//! row reclaimed with a message id already set is recorded sent without a
//! second transport call.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::Duration;
use drip_core::clock::{system_clock, Clock};
use drip_core::config::DispatchConfig;
use drip_core::event_bus::{make_event, noop_sink, EventSink};
use drip_core::types::EventType;
use drip_core::{SequencerError, SequencerResult};
use drip_sequences::enrollment::{EnrollmentManager, FailureOutcome};
use drip_sequences::store::SequenceStore;
use drip_sequences::types::{EnrollmentStatus, ScheduledEmail, ScheduledEmailStatus};
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::contacts::ContactDirectory;
use crate::renderer::TemplateRenderer;
use crate::retry::{RetryPolicy, StoreRetry};
use crate::transport::{MailTransport, OutboundEmail};

/// Counters for one dispatch cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub repaired: usize,
    pub selected: usize,
    pub claimed: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    pub suppressed: usize,
    /// Lost claims and enrollments that left `active` before sending.
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Sent,
    Retried,
    Failed,
    Suppressed,
    Skipped,
}

pub struct DispatchScheduler {
    manager: EnrollmentManager,
    contacts: Arc<dyn ContactDirectory>,
    renderer: Arc<dyn TemplateRenderer>,
    transport: Arc<dyn MailTransport>,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
    config: DispatchConfig,
    retry: RetryPolicy,
    store_retry: StoreRetry,
    worker_id: String,
    wake: Arc<Notify>,
}

impl std::fmt::Debug for DispatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchScheduler")
            .field("worker_id", &self.worker_id)
            .field("config", &self.config)
            .finish()
    }
}

impl DispatchScheduler {
    pub fn new(
        manager: EnrollmentManager,
        contacts: Arc<dyn ContactDirectory>,
        renderer: Arc<dyn TemplateRenderer>,
        transport: Arc<dyn MailTransport>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            manager,
            contacts,
            renderer,
            transport,
            clock: system_clock(),
            event_sink: noop_sink(),
            retry: RetryPolicy::from_config(&config),
            store_retry: StoreRetry::default(),
            config,
            worker_id: format!("dispatch-{}", uuid::Uuid::new_v4()),
            wake: Arc::new(Notify::new()),
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

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_store_retry(mut self, store_retry: StoreRetry) -> Self {
        self.store_retry = store_retry;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Notifying this handle starts a cycle without waiting for the poll
    /// interval.
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    fn store(&self) -> &Arc<SequenceStore> {
        self.manager.store()
    }

    /// Runs one dispatch cycle.
    pub async fn run_cycle(&self) -> SequencerResult<CycleReport> {
        let started = Instant::now();
        let mut report = CycleReport::default();

        report.repaired = self.repair()?;
        if report.repaired > 0 {
            metrics::counter!("dispatch.rows_repaired").increment(report.repaired as u64);
        }

        let due = self.store().select_due(self.clock.now(), self.config.batch_size)?;
        report.selected = due.len();

        let lease = Duration::seconds(self.config.lease_secs);
        for row in due {
            let claimed_at = self.clock.now();
            let Some(claimed) = self.store().claim(&row.id, &self.worker_id, claimed_at, lease)? else {
                debug!(scheduled_email_id = %row.id, "Claim lost to another worker");
                report.skipped += 1;
                continue;
            };
            report.claimed += 1;

            match self.deliver(&claimed).await {
                Ok(Delivery::Sent) => report.sent += 1,
                Ok(Delivery::Retried) => report.retried += 1,
                Ok(Delivery::Failed) => report.failed += 1,
                Ok(Delivery::Suppressed) => report.suppressed += 1,
                Ok(Delivery::Skipped) => report.skipped += 1,
                Err(SequencerError::ClaimLost(id)) => {
                    warn!(
                        scheduled_email_id = %id,
                        worker_id = %self.worker_id,
                        "Claim expired mid-delivery; outcome discarded"
                    );
                    report.skipped += 1;
                }
                Err(e) => {
                    error!(
                        scheduled_email_id = %claimed.id,
                        error = %e,
                        "Dispatch bookkeeping failed; the lease sweeper will release the claim"
                    );
                    metrics::counter!("dispatch.errors").increment(1);
                    report.errors += 1;
                }
            }
        }

        metrics::histogram!("dispatch.cycle_ms").record(started.elapsed().as_secs_f64() * 1000.0);
        Ok(report)
    }

    /// Cancels duplicate in-flight enrollments and duplicate open scheduled
    /// emails. Returns how many rows were cancelled.
    fn repair(&self) -> SequencerResult<usize> {
        let now = self.clock.now();
        let mut repaired = 0;
        for repair in self.store().repair_duplicate_enrollments(now)? {
            repaired += repair.cancelled.len();
            self.event_sink.emit(
                make_event(EventType::EnrollmentRepaired, repair.sequence_id, now)
                    .with_enrollment(repair.kept, repair.contact_id)
                    .with_detail(format!("duplicate enrollments cancelled: {:?}", repair.cancelled)),
            );
        }
        for repair in self.store().repair_duplicate_obligations()? {
            repaired += repair.cancelled.len();
            self.event_sink.emit(
                make_event(EventType::ObligationRepaired, repair.sequence_id, now)
                    .with_scheduled_email(repair.kept)
                    .with_detail(format!(
                        "enrollment {} duplicates cancelled: {:?}",
                        repair.enrollment_id, repair.cancelled
                    )),
            );
        }
        Ok(repaired)
    }

    async fn deliver(&self, claimed: &ScheduledEmail) -> SequencerResult<Delivery> {
        if let Some(message_id) = claimed.message_id.as_deref() {
            info!(
                scheduled_email_id = %claimed.id,
                message_id,
                "Reclaimed email was already delivered, recording it sent"
            );
            return self.finish(claimed, message_id).await;
        }

        let (enrollment, sequence) = self.store().read(|s| {
            let enrollment = s.enrollment(&claimed.enrollment_id)?.clone();
            let sequence = s.sequence(&enrollment.sequence_id)?.clone();
            Ok::<_, SequencerError>((enrollment, sequence))
        })??;

        if enrollment.status != EnrollmentStatus::Active {
            self.manager.abandon_claim(&claimed.id, &self.worker_id)?;
            return Ok(Delivery::Skipped);
        }

        let Some(step) = sequence.step(&claimed.step_id).cloned() else {
            let err = SequencerError::Invariant(format!("step {} no longer exists", claimed.step_id));
            return self.fail(claimed, &err);
        };
        let Some(sender) = sequence.sender.clone() else {
            let err = SequencerError::Validation(format!("sequence {} has no sender", sequence.id));
            return self.fail(claimed, &err);
        };

        let contact = match self.call(self.contacts.get_contact(&enrollment.contact_id)).await {
            Ok(Some(contact)) if !contact.unsubscribed => contact,
            Ok(Some(_)) => return self.suppress(claimed, "contact unsubscribed"),
            Ok(None) => return self.suppress(claimed, "contact deleted"),
            Err(e) => return self.fail(claimed, &e),
        };

        let vars = contact.merge_vars();
        let rendered = match self.call(self.renderer.render(&step.subject, &step.content, &vars)).await {
            Ok(rendered) => rendered,
            Err(e) => return self.fail(claimed, &e),
        };

        let email = OutboundEmail {
            scheduled_email_id: claimed.id,
            to: contact.email.clone(),
            to_name: contact.full_name(),
            from: sender,
            subject: rendered.subject,
            html: rendered.html,
        };
        self.ensure_lease(claimed)?;
        let message_id = match self.call(self.transport.send(&email)).await {
            Ok(id) => id,
            Err(e) => return self.fail(claimed, &e),
        };

        self.store_retry
            .run(
                "record_delivered",
                || self.manager.record_delivered(&claimed.id, &self.worker_id, &message_id),
                || self.lease_valid(claimed),
            )
            .await?;
        self.finish(claimed, &message_id).await
    }

    async fn finish(&self, claimed: &ScheduledEmail, message_id: &str) -> SequencerResult<Delivery> {
        self.store_retry
            .run(
                "record_sent",
                || {
                    self.manager
                        .record_sent(&claimed.id, &self.worker_id, message_id, self.clock.now())
                },
                || self.lease_valid(claimed),
            )
            .await?;
        metrics::counter!("dispatch.emails_sent").increment(1);
        Ok(Delivery::Sent)
    }

    fn lease_valid(&self, claimed: &ScheduledEmail) -> bool {
        claimed
            .lease_expires_at
            .is_some_and(|expires| self.clock.now() < expires)
    }

    /// Fails with `ClaimLost` unless this worker still holds an unexpired
    /// claim on the row.
    fn ensure_lease(&self, claimed: &ScheduledEmail) -> SequencerResult<()> {
        let row = self.store().scheduled_email(&claimed.id)?;
        let held = row.status == ScheduledEmailStatus::Claimed
            && row.claimed_by.as_deref() == Some(self.worker_id.as_str())
            && row.lease_expires_at.is_some_and(|expires| self.clock.now() < expires);
        if held {
            Ok(())
        } else {
            Err(SequencerError::ClaimLost(claimed.id))
        }
    }

    /// Awaits an external call under the send deadline.
    async fn call<T>(&self, fut: impl Future<Output = SequencerResult<T>>) -> SequencerResult<T> {
        let limit = StdDuration::from_millis(self.config.send_timeout_ms);
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(SequencerError::Timeout(self.config.send_timeout_ms)),
        }
    }

    fn fail(&self, claimed: &ScheduledEmail, err: &SequencerError) -> SequencerResult<Delivery> {
        let now = self.clock.now();
        let attempts_made = claimed.attempts + 1;
        let retry_at = if err.is_transient() {
            self.retry.next_attempt(attempts_made, now)
        } else {
            None
        };
        match self
            .manager
            .record_send_failure(&claimed.id, &self.worker_id, &err.to_string(), retry_at, now)?
        {
            FailureOutcome::Retrying { .. } => {
                metrics::counter!("dispatch.send_retries").increment(1);
                Ok(Delivery::Retried)
            }
            FailureOutcome::Failed { .. } => {
                metrics::counter!("dispatch.send_failures").increment(1);
                Ok(Delivery::Failed)
            }
        }
    }

    fn suppress(&self, claimed: &ScheduledEmail, reason: &str) -> SequencerResult<Delivery> {
        self.manager
            .record_suppressed(&claimed.id, &self.worker_id, reason, self.clock.now())?;
        metrics::counter!("dispatch.suppressed").increment(1);
        Ok(Delivery::Suppressed)
    }

    /// Polls on the configured interval, or sooner when woken, until
    /// `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(StdDuration::from_secs(self.config.poll_interval_secs.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            worker_id = %self.worker_id,
            poll_interval_secs = self.config.poll_interval_secs,
            batch_size = self.config.batch_size,
            "Dispatch scheduler started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }

            match self.run_cycle().await {
                Ok(report) if report.selected > 0 || report.repaired > 0 => {
                    info!(
                        worker_id = %self.worker_id,
                        selected = report.selected,
                        sent = report.sent,
                        retried = report.retried,
                        failed = report.failed,
                        suppressed = report.suppressed,
                        skipped = report.skipped,
                        repaired = report.repaired,
                        "Dispatch cycle complete"
                    );
                }
                Ok(_) => debug!(worker_id = %self.worker_id, "Dispatch cycle found no due emails"),
                Err(e) => {
                    error!(worker_id = %self.worker_id, error = %e, "Dispatch cycle failed");
                    metrics::counter!("dispatch.cycle_errors").increment(1);
                }
            }
        }

        info!(worker_id = %self.worker_id, "Dispatch scheduler stopped");
    }

    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}

