//! End-to-end dispatch behaviour against in-memory collaborators.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use drip_core::clock::{Clock, ManualClock};
use drip_core::config::DispatchConfig;
use drip_core::event_bus::capture_sink;
use drip_core::types::EventType;
use drip_core::{SequencerError, SequencerResult};
use drip_dispatch::{
    Contact, CycleReport, DispatchScheduler, InMemoryContacts, LeaseSweeper, MailTransport,
    MergeTagRenderer, OutboundEmail, StoreRetry,
};
use drip_sequences::editor::{NewSequence, SequenceEditor};
use drip_sequences::store::{SequenceStore, StoreSnapshot};
use drip_sequences::types::{
    default_timezone, EnrollmentStatus, FailureResolution, ScheduledEmail, ScheduledEmailStatus,
    Sender, SequenceTrigger, Step, StepContent,
};
use drip_sequences::EnrollmentManager;
use uuid::Uuid;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap()
}

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<OutboundEmail>>,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

impl RecordingTransport {
    fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().unwrap().clone()
    }

    fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send(&self, email: &OutboundEmail) -> SequencerResult<String> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(SequencerError::Transport("421 service not available".into()));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(email.clone());
        Ok(format!("msg-{}", sent.len()))
    }
}

struct SlowTransport;

#[async_trait]
impl MailTransport for SlowTransport {
    async fn send(&self, _email: &OutboundEmail) -> SequencerResult<String> {
        tokio::time::sleep(StdDuration::from_millis(500)).await;
        Ok("late".into())
    }
}

/// Each send takes 200s of clock time and the lease sweeper runs while the
/// send is in flight.
struct SlowBatchTransport {
    clock: Arc<ManualClock>,
    sweeper: LeaseSweeper,
    sent: Mutex<Vec<Uuid>>,
}

#[async_trait]
impl MailTransport for SlowBatchTransport {
    async fn send(&self, email: &OutboundEmail) -> SequencerResult<String> {
        self.clock.advance(Duration::seconds(200));
        self.sweeper.sweep()?;
        let mut sent = self.sent.lock().unwrap();
        sent.push(email.scheduled_email_id);
        Ok(format!("msg-{}", sent.len()))
    }
}

/// Accepts the message, then leaves another thread holding the store lock
/// for longer than one lock timeout.
struct ContendedStoreTransport {
    store: Arc<SequenceStore>,
    hold: StdDuration,
    sends: AtomicUsize,
    holders: Mutex<Vec<JoinHandle<()>>>,
}

#[async_trait]
impl MailTransport for ContendedStoreTransport {
    async fn send(&self, _email: &OutboundEmail) -> SequencerResult<String> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        let (locked_tx, locked_rx) = mpsc::channel();
        let store = self.store.clone();
        let hold = self.hold;
        let holder = std::thread::spawn(move || {
            store
                .read(|_| {
                    locked_tx.send(()).unwrap();
                    std::thread::sleep(hold);
                })
                .unwrap();
        });
        locked_rx.recv().unwrap();
        self.holders.lock().unwrap().push(holder);
        Ok("msg-contended".into())
    }
}

struct Harness {
    store: Arc<SequenceStore>,
    clock: Arc<ManualClock>,
    manager: EnrollmentManager,
    editor: SequenceEditor,
    contacts: Arc<InMemoryContacts>,
    transport: Arc<RecordingTransport>,
    scheduler: DispatchScheduler,
}

fn config() -> DispatchConfig {
    DispatchConfig {
        max_attempts: 3,
        backoff_base_secs: 60,
        backoff_max_secs: 600,
        lease_secs: 300,
        send_timeout_ms: 1_000,
        ..DispatchConfig::default()
    }
}

fn harness_with(
    store: Arc<SequenceStore>,
    config: DispatchConfig,
    transport: Option<Arc<dyn MailTransport>>,
) -> Harness {
    let clock = Arc::new(ManualClock::new(t0()));
    let manager = EnrollmentManager::new(store.clone()).with_clock(clock.clone());
    let editor = SequenceEditor::new(store.clone()).with_clock(clock.clone());
    let contacts = Arc::new(InMemoryContacts::new());
    let recording = Arc::new(RecordingTransport::default());
    let transport: Arc<dyn MailTransport> =
        transport.unwrap_or_else(|| recording.clone() as Arc<dyn MailTransport>);
    let scheduler = DispatchScheduler::new(
        manager.clone(),
        contacts.clone(),
        Arc::new(MergeTagRenderer::new()),
        transport,
        config,
    )
    .with_clock(clock.clone())
    .with_worker_id("worker-a");
    Harness {
        store,
        clock,
        manager,
        editor,
        contacts,
        transport: recording,
        scheduler,
    }
}

fn harness() -> Harness {
    harness_with(Arc::new(SequenceStore::new(500)), config(), None)
}

impl Harness {
    fn two_step_sequence(&self) -> Uuid {
        let seq = self
            .editor
            .create_sequence(NewSequence {
                client_id: Uuid::new_v4(),
                name: "Welcome".into(),
                trigger: SequenceTrigger::Manual,
                steps: vec![
                    Step::new(
                        "Welcome, {{first_name}}",
                        StepContent::Inline {
                            html: "<p>Hi {{first_name}} from {{company}}</p>".into(),
                        },
                        0,
                        0,
                    ),
                    Step::new(
                        "Samples for {{company}}",
                        StepContent::Inline {
                            html: "<p>Free samples</p>".into(),
                        },
                        1,
                        0,
                    ),
                ],
                preferred_time: None,
                timezone: default_timezone(),
                sender: Some(Sender {
                    email: "sales@alconox.com".into(),
                    name: Some("Alconox".into()),
                }),
            })
            .unwrap();
        self.editor.activate(&seq.id).unwrap();
        seq.id
    }

    fn contact(&self) -> Uuid {
        let mut contact = Contact::new(Uuid::new_v4(), "jane@lab.org");
        contact.first_name = Some("Jane".into());
        contact.company = Some("Acme Labs".into());
        let id = contact.id;
        self.contacts.upsert(contact);
        id
    }

    fn open(&self, enrollment_id: &Uuid) -> Option<ScheduledEmail> {
        self.store.open_obligation(enrollment_id).unwrap()
    }

    async fn cycle(&self) -> CycleReport {
        self.scheduler.run_cycle().await.unwrap()
    }
}

#[tokio::test]
async fn test_two_step_sequence_sends_on_schedule() {
    let h = harness();
    let seq = h.two_step_sequence();
    let contact = h.contact();
    let enrollment = h.manager.enroll(seq, contact, t0()).unwrap();

    let report = h.cycle().await;
    assert_eq!(report.sent, 1);
    let sent = h.transport.sent();
    assert_eq!(sent[0].subject, "Welcome, Jane");
    assert_eq!(sent[0].html, "<p>Hi Jane from Acme Labs</p>");
    assert_eq!(sent[0].from.email, "sales@alconox.com");

    let next = h.open(&enrollment).unwrap();
    assert_eq!(next.scheduled_for, Utc.with_ymd_and_hms(2026, 1, 2, 9, 0, 0).unwrap());

    h.clock.set(Utc.with_ymd_and_hms(2026, 1, 2, 8, 59, 0).unwrap());
    assert_eq!(h.cycle().await.selected, 0);

    h.clock.set(Utc.with_ymd_and_hms(2026, 1, 2, 9, 0, 0).unwrap());
    assert_eq!(h.cycle().await.sent, 1);
    assert_eq!(h.transport.sent()[1].subject, "Samples for Acme Labs");

    let done = h.manager.enrollment(&enrollment).unwrap();
    assert_eq!(done.status, EnrollmentStatus::Completed);
    assert_eq!(done.current_step, 2);
    assert!(h.open(&enrollment).is_none());
}

#[tokio::test]
async fn test_crashed_worker_claim_is_reclaimed_and_sent_once() {
    let h = harness();
    let seq = h.two_step_sequence();
    let enrollment = h.manager.enroll(seq, h.contact(), t0()).unwrap();
    let row = h.open(&enrollment).unwrap();

    // Another worker claims, then dies without reporting.
    h.store
        .claim(&row.id, "worker-crashed", t0(), Duration::minutes(5))
        .unwrap()
        .unwrap();
    assert_eq!(h.cycle().await.selected, 0);

    let sweeper = LeaseSweeper::new(h.store.clone(), 30).with_clock(h.clock.clone());
    h.clock.advance(Duration::minutes(4));
    assert_eq!(sweeper.sweep().unwrap(), 0);
    h.clock.advance(Duration::minutes(2));
    assert_eq!(sweeper.sweep().unwrap(), 1);

    assert_eq!(h.cycle().await.sent, 1);
    assert_eq!(h.cycle().await.sent, 0);
    assert_eq!(h.transport.sent().len(), 1);
    assert_eq!(
        h.store.scheduled_email(&row.id).unwrap().claimed_by.as_deref(),
        Some("worker-a")
    );

    // The dead worker waking up cannot record a second outcome.
    let late = h.manager.record_sent(&row.id, "worker-crashed", "dup", h.clock.now());
    assert!(matches!(late, Err(SequencerError::ClaimLost(_))));
}

#[tokio::test]
async fn test_transient_failures_back_off_then_halt() {
    let h = harness();
    let seq = h.two_step_sequence();
    let enrollment = h.manager.enroll(seq, h.contact(), t0()).unwrap();
    h.transport.fail(true);

    let first = h.cycle().await;
    assert_eq!(first.retried, 1);
    let row = h.open(&enrollment).unwrap();
    assert_eq!(row.status, ScheduledEmailStatus::Pending);
    assert_eq!(row.attempts, 1);
    assert!(row.next_attempt_at >= t0() + Duration::seconds(60));
    assert_eq!(row.scheduled_for, t0());

    // Not due again until the backoff elapses.
    assert_eq!(h.cycle().await.selected, 0);

    h.clock.advance(Duration::seconds(600));
    assert_eq!(h.cycle().await.retried, 1);
    h.clock.advance(Duration::seconds(600));
    let last = h.cycle().await;
    assert_eq!(last.failed, 1);

    let halted = h.manager.enrollment(&enrollment).unwrap();
    assert_eq!(halted.status, EnrollmentStatus::Halted);
    assert!(h.open(&enrollment).is_none());
    assert_eq!(h.transport.attempts.load(Ordering::SeqCst), 3);

    // Operator fixes the provider and retries the step.
    h.transport.fail(false);
    h.manager
        .resolve_failure(&enrollment, FailureResolution::Retry, h.clock.now())
        .unwrap();
    assert_eq!(h.cycle().await.sent, 1);
    assert_eq!(h.manager.enrollment(&enrollment).unwrap().current_step, 1);
}

#[tokio::test]
async fn test_slow_transport_counts_as_timeout() {
    let store = Arc::new(SequenceStore::new(500));
    let config = DispatchConfig {
        send_timeout_ms: 20,
        ..config()
    };
    let h = harness_with(store, config, Some(Arc::new(SlowTransport)));
    let seq = h.two_step_sequence();
    let enrollment = h.manager.enroll(seq, h.contact(), t0()).unwrap();

    let report = h.cycle().await;
    assert_eq!(report.retried, 1);
    let row = h.open(&enrollment).unwrap();
    assert!(row.last_error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_unsubscribed_and_deleted_contacts_are_suppressed() {
    let h = harness();
    let seq = h.two_step_sequence();

    let unsubscribed = h.contact();
    h.contacts.set_unsubscribed(&unsubscribed, true);
    let deleted = h.contact();
    h.contacts.remove(&deleted);

    let a = h.manager.enroll(seq, unsubscribed, t0()).unwrap();
    let b = h.manager.enroll(seq, deleted, t0()).unwrap();

    let report = h.cycle().await;
    assert_eq!(report.suppressed, 2);
    assert_eq!(report.failed, 0);
    assert!(h.transport.sent().is_empty());
    for id in [a, b] {
        assert_eq!(h.manager.enrollment(&id).unwrap().status, EnrollmentStatus::Cancelled);
        assert!(h.open(&id).is_none());
    }
}

#[tokio::test]
async fn test_paused_work_is_not_sent() {
    let h = harness();
    let seq = h.two_step_sequence();
    let paused = h.manager.enroll(seq, h.contact(), t0()).unwrap();
    h.manager.pause(&paused).unwrap();
    assert_eq!(h.cycle().await.selected, 0);

    let other = h.manager.enroll(seq, h.contact(), t0()).unwrap();
    h.editor.pause(&seq).unwrap();
    assert_eq!(h.cycle().await.selected, 0);
    h.editor.activate(&seq).unwrap();
    assert_eq!(h.cycle().await.sent, 1);
    assert_eq!(h.manager.enrollment(&other).unwrap().current_step, 1);
    assert_eq!(h.manager.enrollment(&paused).unwrap().current_step, 0);
}

#[tokio::test]
async fn test_duplicate_obligations_from_import_are_repaired() {
    let seeded = harness();
    let seq = seeded.two_step_sequence();
    let contact_id = seeded.contact();
    let enrollment = seeded.manager.enroll(seq, contact_id, t0()).unwrap();

    let mut snapshot: StoreSnapshot = seeded.store.snapshot().unwrap();
    let original = seeded.open(&enrollment).unwrap();
    let mut duplicate = original.clone();
    duplicate.id = Uuid::new_v4();
    duplicate.created_at = original.created_at + Duration::seconds(1);
    snapshot.scheduled_emails.push(duplicate.clone());

    let json = serde_json::to_string(&snapshot).unwrap();
    let restored: StoreSnapshot = serde_json::from_str(&json).unwrap();
    let store = Arc::new(SequenceStore::from_snapshot(restored, 500));
    let h = harness_with(store, config(), None);
    let mut contact = Contact::new(Uuid::new_v4(), "jane@lab.org");
    contact.id = contact_id;
    h.contacts.upsert(contact);

    let sink = capture_sink();
    let scheduler = DispatchScheduler::new(
        h.manager.clone(),
        h.contacts.clone(),
        Arc::new(MergeTagRenderer::new()),
        h.transport.clone(),
        config(),
    )
    .with_clock(h.clock.clone())
    .with_event_sink(sink.clone());

    let report = scheduler.run_cycle().await.unwrap();
    assert_eq!(report.repaired, 1);
    assert_eq!(report.sent, 1);
    assert_eq!(h.transport.sent().len(), 1);
    assert_eq!(
        h.store.scheduled_email(&duplicate.id).unwrap().status,
        ScheduledEmailStatus::Cancelled
    );
    assert_eq!(sink.count_type(EventType::ObligationRepaired), 1);
}

#[tokio::test]
async fn test_slow_batch_leases_start_at_each_claim() {
    let h = harness();
    let seq = h.two_step_sequence();
    let enrollments: Vec<Uuid> = (0..3)
        .map(|_| h.manager.enroll(seq, h.contact(), t0()).unwrap())
        .collect();

    let transport = Arc::new(SlowBatchTransport {
        clock: h.clock.clone(),
        sweeper: LeaseSweeper::new(h.store.clone(), 30).with_clock(h.clock.clone()),
        sent: Mutex::new(Vec::new()),
    });
    let scheduler = DispatchScheduler::new(
        h.manager.clone(),
        h.contacts.clone(),
        Arc::new(MergeTagRenderer::new()),
        transport.clone(),
        config(),
    )
    .with_clock(h.clock.clone());

    let report = scheduler.run_cycle().await.unwrap();
    assert_eq!(report.sent, 3);
    assert_eq!(report.skipped, 0);
    assert_eq!(h.clock.now(), t0() + Duration::seconds(600));

    // Nothing was released mid-send, so a second cycle has nothing to resend.
    let again = scheduler.run_cycle().await.unwrap();
    assert_eq!(again.selected, 0);
    let mut sent = transport.sent.lock().unwrap().clone();
    sent.sort();
    sent.dedup();
    assert_eq!(sent.len(), 3);
    assert_eq!(transport.sent.lock().unwrap().len(), 3);
    for id in &enrollments {
        assert_eq!(h.manager.enrollment(id).unwrap().current_step, 1);
    }
}

#[tokio::test]
async fn test_expired_lease_is_not_sent() {
    let h = harness();
    let seq = h.two_step_sequence();
    let enrollment = h.manager.enroll(seq, h.contact(), t0()).unwrap();
    let config = DispatchConfig {
        lease_secs: 0,
        ..config()
    };
    let scheduler = DispatchScheduler::new(
        h.manager.clone(),
        h.contacts.clone(),
        Arc::new(MergeTagRenderer::new()),
        h.transport.clone(),
        config,
    )
    .with_clock(h.clock.clone());

    let report = scheduler.run_cycle().await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.skipped, 1);
    assert!(h.transport.sent().is_empty());
    let row = h.open(&enrollment).unwrap();
    assert_eq!(row.status, ScheduledEmailStatus::Claimed);
    assert!(row.message_id.is_none());
}

#[tokio::test]
async fn test_store_contention_after_send_is_retried() {
    let store = Arc::new(SequenceStore::new(50));
    let transport = Arc::new(ContendedStoreTransport {
        store: store.clone(),
        hold: StdDuration::from_millis(200),
        sends: AtomicUsize::new(0),
        holders: Mutex::new(Vec::new()),
    });
    let h = harness_with(store, config(), Some(transport.clone()));
    let seq = h.two_step_sequence();
    let enrollment = h.manager.enroll(seq, h.contact(), t0()).unwrap();
    let row = h.open(&enrollment).unwrap();
    let scheduler = h.scheduler.with_store_retry(StoreRetry {
        attempts: 6,
        initial: StdDuration::from_millis(50),
    });

    let report = scheduler.run_cycle().await.unwrap();
    for holder in transport.holders.lock().unwrap().drain(..) {
        holder.join().unwrap();
    }
    assert_eq!(report.sent, 1);
    assert_eq!(report.errors, 0);
    assert_eq!(transport.sends.load(Ordering::SeqCst), 1);

    let stored = h.store.scheduled_email(&row.id).unwrap();
    assert_eq!(stored.status, ScheduledEmailStatus::Sent);
    assert_eq!(stored.message_id.as_deref(), Some("msg-contended"));
    assert_eq!(h.manager.enrollment(&enrollment).unwrap().current_step, 1);
}

#[tokio::test]
async fn test_reclaimed_delivered_row_is_recorded_not_resent() {
    let h = harness();
    let seq = h.two_step_sequence();
    let enrollment = h.manager.enroll(seq, h.contact(), t0()).unwrap();
    let row = h.open(&enrollment).unwrap();

    // A worker got the message out, noted the provider id and died before
    // recording the send.
    h.store
        .claim(&row.id, "worker-crashed", t0(), Duration::minutes(5))
        .unwrap()
        .unwrap();
    h.manager
        .record_delivered(&row.id, "worker-crashed", "msg-earlier")
        .unwrap();
    h.clock.advance(Duration::minutes(6));
    let sweeper = LeaseSweeper::new(h.store.clone(), 30).with_clock(h.clock.clone());
    assert_eq!(sweeper.sweep().unwrap(), 1);

    let report = h.cycle().await;
    assert_eq!(report.sent, 1);
    assert!(h.transport.sent().is_empty());
    let stored = h.store.scheduled_email(&row.id).unwrap();
    assert_eq!(stored.status, ScheduledEmailStatus::Sent);
    assert_eq!(stored.message_id.as_deref(), Some("msg-earlier"));
    assert_eq!(h.manager.enrollment(&enrollment).unwrap().current_step, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_schedulers_send_a_due_row_once() {
    for _ in 0..25 {
        let h = harness();
        let seq = h.two_step_sequence();
        let enrollment = h.manager.enroll(seq, h.contact(), t0()).unwrap();

        let second = DispatchScheduler::new(
            h.manager.clone(),
            h.contacts.clone(),
            Arc::new(MergeTagRenderer::new()),
            h.transport.clone(),
            config(),
        )
        .with_clock(h.clock.clone())
        .with_worker_id("worker-b");
        let schedulers = [Arc::new(h.scheduler), Arc::new(second)];
        let start = Arc::new(tokio::sync::Barrier::new(2));

        let handles: Vec<_> = schedulers
            .iter()
            .map(|scheduler| {
                let scheduler = scheduler.clone();
                let start = start.clone();
                tokio::spawn(async move {
                    start.wait().await;
                    scheduler.run_cycle().await.unwrap()
                })
            })
            .collect();
        let mut sent = 0;
        for handle in handles {
            sent += handle.await.unwrap().sent;
        }

        assert_eq!(sent, 1);
        assert_eq!(h.transport.sent().len(), 1);
        assert_eq!(h.manager.enrollment(&enrollment).unwrap().current_step, 1);
    }
}

#[tokio::test]
async fn test_duplicate_enrollments_from_import_are_repaired() {
    let seeded = harness();
    let seq = seeded.two_step_sequence();
    let contact_id = seeded.contact();
    let enrollment = seeded.manager.enroll(seq, contact_id, t0()).unwrap();

    let mut snapshot: StoreSnapshot = seeded.store.snapshot().unwrap();
    let original = seeded.manager.enrollment(&enrollment).unwrap();
    let mut duplicate = original.clone();
    duplicate.id = Uuid::new_v4();
    duplicate.enrolled_at = original.enrolled_at + Duration::hours(1);
    let mut duplicate_row = seeded.open(&enrollment).unwrap();
    duplicate_row.id = Uuid::new_v4();
    duplicate_row.enrollment_id = duplicate.id;
    snapshot.enrollments.push(duplicate.clone());
    snapshot.scheduled_emails.push(duplicate_row.clone());

    let store = Arc::new(SequenceStore::from_snapshot(snapshot, 500));
    let h = harness_with(store, config(), None);
    let mut contact = Contact::new(Uuid::new_v4(), "jane@lab.org");
    contact.id = contact_id;
    h.contacts.upsert(contact);

    let sink = capture_sink();
    let scheduler = h.scheduler.with_event_sink(sink.clone());
    let report = scheduler.run_cycle().await.unwrap();
    assert_eq!(report.repaired, 1);
    assert_eq!(report.sent, 1);
    assert_eq!(h.transport.sent().len(), 1);
    assert_eq!(
        h.manager.enrollment(&duplicate.id).unwrap().status,
        EnrollmentStatus::Cancelled
    );
    assert_eq!(
        h.store.scheduled_email(&duplicate_row.id).unwrap().status,
        ScheduledEmailStatus::Cancelled
    );
    assert_eq!(h.manager.enrollment(&enrollment).unwrap().current_step, 1);
    assert_eq!(sink.count_type(EventType::EnrollmentRepaired), 1);
}
