//! Job queue with priorities, dependencies, retries and a dead-letter path.
//!
//! ## Components
//!
//! - `registry`: job id → handler lookup
//! - `execution` / `tracker`: one persisted record per run, per-job stats,
//!   the tracked runner
//! - `queue`: queued-job lifecycle, dispatch selection, pause/resume/drain
//! - `dead_letter`: permanently failed jobs awaiting operator action
//! - `dispatcher`: threaded runtime around the queue
//! - `retry`: periodic sweep that re-runs recently failed jobs

pub mod dead_letter;
pub mod dispatcher;
pub mod execution;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod selection;
pub mod tracker;
pub mod types;

pub use dead_letter::{DeadLetterFilter, DeadLetterStore};
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherHandle, DispatcherStats};
pub use execution::{ExecutionStatus, JobExecution, JobExecutionStats};
pub use queue::{QueueConfig, QueueError, QueueFilter, QueueManager};
pub use registry::{JobContext, JobDefinition, JobError, JobHandler, JobInfo, JobOutput, JobRegistry};
pub use retry::{RetryCoordinator, RetryCoordinatorConfig, RetrySweepReport};
pub use tracker::{CompletionHook, ExecutionError, ExecutionFilter, ExecutionHistory, ExecutionTracker, RunRequest};
pub use types::{
    BackoffPolicy, BackoffStrategy, DeadLetterJob, JobSpec, Priority, QueueMode, QueueStats, QueuedJob,
    QueuedJobStatus,
};
