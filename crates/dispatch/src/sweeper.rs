use std::sync::Arc;
use std::time::Duration as StdDuration;

use drip_core::clock::{system_clock, Clock};
use drip_core::event_bus::{make_event, noop_sink, EventSink};
use drip_core::types::EventType;
use drip_core::SequencerResult;
use drip_sequences::store::SequenceStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Returns claims whose lease ran out (worker crashed or hung) to `pending`
/// so another cycle can pick them up.
pub struct LeaseSweeper {
    store: Arc<SequenceStore>,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
    interval: StdDuration,
}

impl LeaseSweeper {
    pub fn new(store: Arc<SequenceStore>, interval_secs: u64) -> Self {
        Self {
            store,
            clock: system_clock(),
            event_sink: noop_sink(),
            interval: StdDuration::from_secs(interval_secs.max(1)),
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

    /// One sweep; returns how many claims were released.
    pub fn sweep(&self) -> SequencerResult<usize> {
        let now = self.clock.now();
        let released = self.store.expire_claims(now)?;
        for row in &released {
            let sequence_id = self
                .store
                .enrollment(&row.enrollment_id)
                .map(|e| e.sequence_id)
                .unwrap_or_default();
            self.event_sink.emit(
                make_event(EventType::ClaimExpired, sequence_id, now)
                    .with_step(row.step_id)
                    .with_scheduled_email(row.id),
            );
        }
        if !released.is_empty() {
            metrics::counter!("sweeper.claims_released").increment(released.len() as u64);
            info!(released = released.len(), "Expired claims returned to pending");
        }
        Ok(released.len())
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        info!(interval_secs = self.interval.as_secs(), "Lease sweeper started");
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.sweep() {
                error!(error = %e, "Lease sweep failed");
            }
        }
        info!("Lease sweeper stopped");
    }

    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
