//! Signals emitted by the worker subsystem.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobwarden_core::{DeadLetterId, ExecutionId, QueuedJobId};

/// A notification about something that already happened (and was stored).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// A queued job finished successfully.
    JobCompleted {
        queued_job_id: QueuedJobId,
        job_id: String,
        execution_id: Option<ExecutionId>,
    },
    /// A queued job failed and was put back with a backoff delay.
    JobRetryScheduled {
        queued_job_id: QueuedJobId,
        job_id: String,
        attempt: u32,
        scheduled_for: DateTime<Utc>,
        error: String,
    },
    /// A queued job exhausted its attempts and was parked in the dead-letter store.
    DeadLettered {
        dead_letter_id: DeadLetterId,
        queued_job_id: QueuedJobId,
        job_id: String,
        attempts: u32,
        error: String,
    },
    /// The queue-wide mode changed (`running`, `paused`, `draining`).
    QueueModeChanged { mode: String },
    /// Summary of one reactive retry sweep.
    RetrySweepCompleted {
        retried: usize,
        skipped: usize,
        total_failed: usize,
    },
    /// Free-form event published by a job handler.
    Published {
        job_id: String,
        execution_id: Option<ExecutionId>,
        topic: String,
        payload: serde_json::Value,
    },
}

impl WorkerEvent {
    /// Dotted topic name, stable for log filtering.
    pub fn topic(&self) -> &str {
        match self {
            WorkerEvent::JobCompleted { .. } => "queue.completed",
            WorkerEvent::JobRetryScheduled { .. } => "queue.retry-scheduled",
            WorkerEvent::DeadLettered { .. } => "queue.dead-letter",
            WorkerEvent::QueueModeChanged { .. } => "queue.mode-changed",
            WorkerEvent::RetrySweepCompleted { .. } => "retry.sweep-completed",
            WorkerEvent::Published { topic, .. } => topic,
        }
    }

    pub fn is_dead_letter(&self) -> bool {
        matches!(self, WorkerEvent::DeadLettered { .. })
    }
}
