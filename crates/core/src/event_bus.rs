//! Event bus: the trait engine components emit sequence lifecycle events
//! through.
//!
//! Components accept an `Arc<dyn EventSink>`; the engine binary wires
//! [`TracingSink`] so events land in the JSON log stream, tests use
//! [`CaptureSink`].

use crate::types::{EventType, SequenceEvent};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Receives sequence lifecycle events. Emission must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SequenceEvent);
}

/// No-op sink for tests and components that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: SequenceEvent) {}
}

/// Writes every event to the `drip::events` tracing target and counts it.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: SequenceEvent) {
        metrics::counter!("events.emitted", "type" => event.event_type.as_str()).increment(1);
        info!(
            target: "drip::events",
            event_id = %event.event_id,
            event_type = event.event_type.as_str(),
            sequence_id = %event.sequence_id,
            enrollment_id = ?event.enrollment_id,
            contact_id = ?event.contact_id,
            step_id = ?event.step_id,
            scheduled_email_id = ?event.scheduled_email_id,
            detail = ?event.detail,
            node_id = %event.node_id,
        );
    }
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<SequenceEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<SequenceEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: SequenceEvent) {
        self.events.lock().push(event);
    }
}

/// Convenience builder for a `SequenceEvent`; optional ids are attached with
/// the `with_*` helpers. `timestamp` comes from the emitting component's
/// clock.
pub fn make_event(event_type: EventType, sequence_id: Uuid, timestamp: DateTime<Utc>) -> SequenceEvent {
    SequenceEvent {
        event_id: Uuid::new_v4(),
        event_type,
        sequence_id,
        enrollment_id: None,
        contact_id: None,
        step_id: None,
        scheduled_email_id: None,
        detail: None,
        node_id: "local".into(),
        timestamp,
    }
}

impl SequenceEvent {
    pub fn with_enrollment(mut self, enrollment_id: Uuid, contact_id: Uuid) -> Self {
        self.enrollment_id = Some(enrollment_id);
        self.contact_id = Some(contact_id);
        self
    }

    pub fn with_step(mut self, step_id: Uuid) -> Self {
        self.step_id = Some(step_id);
        self
    }

    pub fn with_scheduled_email(mut self, scheduled_email_id: Uuid) -> Self {
        self.scheduled_email_id = Some(scheduled_email_id);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Convenience: create a no-op event bus for components that don't need it.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn tracing_sink() -> Arc<dyn EventSink> {
    Arc::new(TracingSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
