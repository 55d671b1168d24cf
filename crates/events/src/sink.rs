//! Emit-only side of the bus.
//!
//! Producers (queue manager, retry coordinator, job handlers) only ever need to
//! *emit*; they get an [`EventSink`] instead of the full bus so they stay
//! decoupled from whichever transport the process wires up.

use std::sync::{Arc, Mutex};

use tracing::warn;

use jobwarden_core::ExecutionId;

use crate::bus::EventBus;
use crate::signal::WorkerEvent;

/// Sink for worker events. Emission is best-effort and never fails the caller.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: WorkerEvent);
}

/// Adapts any [`EventBus`] into a sink, logging publish failures.
#[derive(Debug)]
pub struct BusSink<B> {
    bus: B,
}

impl<B> BusSink<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }
}

impl<B> EventSink for BusSink<B>
where
    B: EventBus<WorkerEvent> + 'static,
{
    fn emit(&self, event: WorkerEvent) {
        let topic = event.topic().to_string();
        if let Err(err) = self.bus.publish(event) {
            warn!(topic = %topic, error = ?err, "failed to publish worker event");
        }
    }
}

/// Discards everything.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: WorkerEvent) {}
}

/// Keeps every emitted event in memory (tests/dev).
#[derive(Debug, Default)]
pub struct RecordingSink {
    inner: Mutex<Vec<WorkerEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<WorkerEvent> {
        self.inner.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: WorkerEvent) {
        if let Ok(mut v) = self.inner.lock() {
            v.push(event);
        }
    }
}

/// Handle given to job handlers for publishing their own events.
#[derive(Clone)]
pub struct EventPublisher {
    sink: Arc<dyn EventSink>,
    job_id: String,
    execution_id: Option<ExecutionId>,
}

impl EventPublisher {
    pub fn new(sink: Arc<dyn EventSink>, job_id: impl Into<String>, execution_id: Option<ExecutionId>) -> Self {
        Self {
            sink,
            job_id: job_id.into(),
            execution_id,
        }
    }

    /// A publisher that drops everything.
    pub fn noop(job_id: impl Into<String>) -> Self {
        Self::new(Arc::new(NoopSink), job_id, None)
    }

    pub fn publish(&self, topic: impl Into<String>, payload: serde_json::Value) {
        self.sink.emit(WorkerEvent::Published {
            job_id: self.job_id.clone(),
            execution_id: self.execution_id,
            topic: topic.into(),
            payload,
        });
    }
}

impl core::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("job_id", &self.job_id)
            .field("execution_id", &self.execution_id)
            .finish()
    }
}
