//! Trigger intake: consumes contact events and enrolls matching contacts.

use std::sync::Arc;

use drip_core::{SequencerError, SequencerResult};
use drip_sequences::enrollment::EnrollmentManager;
use drip_sequences::trigger::{ContactEvent, TriggerEvaluator};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::retry::StoreRetry;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntakeOutcome {
    pub matched: usize,
    pub enrolled: usize,
    pub already_enrolled: usize,
    pub rejected: usize,
}

pub struct TriggerIntake {
    manager: EnrollmentManager,
    evaluator: TriggerEvaluator,
    store_retry: StoreRetry,
    /// Woken after new enrollments so zero-delay first steps go out promptly.
    dispatch_waker: Option<Arc<Notify>>,
}

impl TriggerIntake {
    pub fn new(manager: EnrollmentManager) -> Self {
        Self {
            manager,
            evaluator: TriggerEvaluator::new(),
            store_retry: StoreRetry::default(),
            dispatch_waker: None,
        }
    }

    pub fn with_dispatch_waker(mut self, waker: Arc<Notify>) -> Self {
        self.dispatch_waker = Some(waker);
        self
    }

    pub fn with_store_retry(mut self, store_retry: StoreRetry) -> Self {
        self.store_retry = store_retry;
        self
    }

    /// Creates the bounded channel producers publish contact events on.
    pub fn channel(buffer: usize) -> (mpsc::Sender<ContactEvent>, mpsc::Receiver<ContactEvent>) {
        mpsc::channel(buffer.max(1))
    }

    /// Evaluates one event and enrolls every match. A pair that is already
    /// enrolled is counted, not treated as an error.
    pub fn handle(&self, event: &ContactEvent) -> SequencerResult<IntakeOutcome> {
        let sequences = self.manager.store().active_sequences()?;
        let requests = self.evaluator.evaluate(event, &sequences);
        let mut outcome = IntakeOutcome {
            matched: requests.len(),
            ..Default::default()
        };

        for request in requests {
            match self
                .manager
                .enroll(request.sequence_id, request.contact_id, request.at)
            {
                Ok(_) => outcome.enrolled += 1,
                Err(SequencerError::AlreadyEnrolled { .. }) => outcome.already_enrolled += 1,
                Err(SequencerError::StoreTimeout { timeout_ms }) => {
                    return Err(SequencerError::StoreTimeout { timeout_ms })
                }
                Err(e) => {
                    warn!(
                        sequence_id = %request.sequence_id,
                        contact_id = %request.contact_id,
                        error = %e,
                        "Triggered enrollment rejected"
                    );
                    outcome.rejected += 1;
                }
            }
        }

        if outcome.enrolled > 0 {
            metrics::counter!("intake.enrollments").increment(outcome.enrolled as u64);
            if let Some(waker) = &self.dispatch_waker {
                waker.notify_one();
            }
        }
        Ok(outcome)
    }

    pub async fn run(&self, mut events: mpsc::Receiver<ContactEvent>, mut shutdown: watch::Receiver<bool>) {
        info!("Trigger intake started");
        loop {
            let event = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            // Re-handling is safe: pairs enrolled by an earlier attempt come
            // back as already enrolled.
            let handled = self
                .store_retry
                .run("intake", || self.handle(&event), || true)
                .await;
            match handled {
                Ok(outcome) => debug!(
                    contact_id = %event.contact_id,
                    matched = outcome.matched,
                    enrolled = outcome.enrolled,
                    already_enrolled = outcome.already_enrolled,
                    "Contact event processed"
                ),
                Err(e) => {
                    error!(contact_id = %event.contact_id, error = %e, "Contact event dropped after retries");
                    metrics::counter!("intake.errors").increment(1);
                }
            }
        }
        info!("Trigger intake stopped");
    }

    pub fn spawn(
        self: Arc<Self>,
        events: mpsc::Receiver<ContactEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(events, shutdown).await })
    }
}
