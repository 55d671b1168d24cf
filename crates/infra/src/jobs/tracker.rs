//! Execution tracker: one persisted record per job run.
//!
//! The tracker is the only component that creates, finishes or deletes
//! [`JobExecution`] records. It also owns the "tracked runner" wrapper that
//! turns handler errors (and panics) into failed executions, so they never
//! propagate past it.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, warn};

use jobwarden_core::{ExecutionId, QueuedJobId, SharedClock};
use jobwarden_events::{EventPublisher, EventSink, NoopSink};

use super::execution::{ExecutionStatus, JobExecution, JobExecutionStats, newest_first};
use super::registry::{JobContext, JobDefinition, JobError};
use crate::store::{RecordStore, SharedStore, StoreError};

/// Execution tracker error.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("execution not found: {0}")]
    NotFound(ExecutionId),
    #[error("execution {id} already finished as {status}")]
    AlreadyTerminal { id: ExecutionId, status: ExecutionStatus },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Invoked after every execution reaches a terminal state.
///
/// Errors are logged by the tracker and never affect the execution record.
pub trait CompletionHook: Send + Sync + 'static {
    fn on_execution_complete(&self, execution: &JobExecution) -> anyhow::Result<()>;
}

/// Filter for listing executions.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub job_id: Option<String>,
    pub org_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    /// Only executions started at or after this instant.
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl ExecutionFilter {
    pub fn for_job(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Self::default()
        }
    }

    pub fn org(mut self, org_id: Option<String>) -> Self {
        self.org_id = org_id;
        self
    }

    pub fn status(mut self, status: ExecutionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, e: &JobExecution) -> bool {
        self.job_id.as_ref().is_none_or(|j| &e.job_id == j)
            && self.org_id.as_ref().is_none_or(|o| e.org_id.as_ref() == Some(o))
            && self.status.is_none_or(|s| e.status == s)
            && self.since.is_none_or(|t| e.started_at >= t)
    }
}

/// Optional attributes of a tracked run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub org_id: Option<String>,
    pub input: Option<serde_json::Value>,
    pub queued_job_id: Option<QueuedJobId>,
}

pub struct ExecutionTracker {
    store: SharedStore,
    clock: SharedClock,
    events: Arc<dyn EventSink>,
    hooks: RwLock<Vec<Arc<dyn CompletionHook>>>,
    /// Serializes the load, terminal check and save of `finish`.
    finish_lock: Mutex<()>,
}

impl ExecutionTracker {
    pub fn new(store: SharedStore, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            events: Arc::new(NoopSink),
            hooks: RwLock::new(Vec::new()),
            finish_lock: Mutex::new(()),
        }
    }

    /// Sink handed to job handlers through their context.
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Register a completion hook (e.g. the alert manager).
    pub fn add_hook(&self, hook: Arc<dyn CompletionHook>) {
        match self.hooks.write() {
            Ok(mut hooks) => hooks.push(hook),
            Err(_) => error!("completion hook registry poisoned; hook not registered"),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Persist a new `running` execution.
    pub fn create_execution(
        &self,
        job_id: &str,
        job_name: &str,
        org_id: Option<String>,
        input: Option<serde_json::Value>,
    ) -> Result<JobExecution, ExecutionError> {
        self.start(job_id, job_name, RunRequest {
            org_id,
            input,
            queued_job_id: None,
        })
    }

    /// Persist a new `running` execution carrying every attribute of `request`.
    pub fn start(&self, job_id: &str, job_name: &str, request: RunRequest) -> Result<JobExecution, ExecutionError> {
        let execution = JobExecution {
            id: ExecutionId::new(),
            job_id: job_id.to_string(),
            job_name: job_name.to_string(),
            org_id: request.org_id,
            status: ExecutionStatus::Running,
            started_at: self.clock.now(),
            finished_at: None,
            duration_ms: None,
            input: request.input,
            output: None,
            error: None,
            queued_job_id: request.queued_job_id,
        };
        self.store.save(&execution)?;
        debug!(job_id = %execution.job_id, execution_id = %execution.id, "execution started");
        Ok(execution)
    }

    pub fn mark_success(
        &self,
        id: ExecutionId,
        output: Option<serde_json::Value>,
    ) -> Result<JobExecution, ExecutionError> {
        self.finish(id, ExecutionStatus::Success, None, output)
    }

    pub fn mark_failure(
        &self,
        id: ExecutionId,
        error: impl Into<String>,
        output: Option<serde_json::Value>,
    ) -> Result<JobExecution, ExecutionError> {
        self.finish(id, ExecutionStatus::Failed, Some(error.into()), output)
    }

    /// Recorded by whoever enforces deadlines (a supervisor or the handler itself).
    pub fn mark_timeout(&self, id: ExecutionId, error: impl Into<String>) -> Result<JobExecution, ExecutionError> {
        self.finish(id, ExecutionStatus::Timeout, Some(error.into()), None)
    }

    fn finish(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
        error: Option<String>,
        output: Option<serde_json::Value>,
    ) -> Result<JobExecution, ExecutionError> {
        let execution = {
            let _guard = self.finish_lock.lock().map_err(|_| StoreError::Poisoned)?;
            let mut execution: JobExecution = self
                .store
                .load(&id.to_string())?
                .ok_or(ExecutionError::NotFound(id))?;

            if execution.is_terminal() {
                return Err(ExecutionError::AlreadyTerminal {
                    id,
                    status: execution.status,
                });
            }

            let now = self.clock.now();
            execution.status = status;
            execution.finished_at = Some(now);
            execution.duration_ms = Some((now - execution.started_at).num_milliseconds().max(0));
            execution.error = error;
            execution.output = output;
            self.store.save(&execution)?;
            execution
        };

        debug!(
            job_id = %execution.job_id,
            execution_id = %execution.id,
            status = %execution.status,
            duration_ms = ?execution.duration_ms,
            "execution finished"
        );

        self.notify(&execution);
        Ok(execution)
    }

    fn notify(&self, execution: &JobExecution) {
        let hooks: Vec<Arc<dyn CompletionHook>> = match self.hooks.read() {
            Ok(h) => h.clone(),
            Err(_) => {
                error!("completion hook registry poisoned; skipping hooks");
                return;
            }
        };

        for hook in hooks {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| hook.on_execution_complete(execution)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(execution_id = %execution.id, error = %format!("{err:#}"), "completion hook failed")
                }
                Err(_) => error!(execution_id = %execution.id, "completion hook panicked"),
            }
        }
    }

    /// Run a job handler under tracking.
    ///
    /// Handler errors and panics become a `failed` (or `timeout`) execution;
    /// only store failures surface as `Err`.
    pub fn run(&self, definition: &JobDefinition, request: RunRequest) -> Result<JobExecution, ExecutionError> {
        let execution = self.start(&definition.id, &definition.name, request)?;

        let ctx = JobContext::new(
            definition.id.clone(),
            execution.id,
            execution.org_id.clone(),
            execution.input.clone(),
            execution.started_at,
            EventPublisher::new(self.events.clone(), definition.id.clone(), Some(execution.id)),
        );

        let handler = definition.handler().clone();
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let _entered = ctx.span().enter();
            handler.run(&ctx)
        }));

        match result {
            Ok(Ok(output)) => self.mark_success(execution.id, output),
            Ok(Err(JobError::Timeout(msg))) => {
                warn!(job_id = %definition.id, execution_id = %execution.id, error = %msg, "job timed out");
                self.mark_timeout(execution.id, msg)
            }
            Ok(Err(JobError::Failed(msg))) => {
                warn!(job_id = %definition.id, execution_id = %execution.id, error = %msg, "job failed");
                self.mark_failure(execution.id, msg, None)
            }
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                error!(job_id = %definition.id, execution_id = %execution.id, error = %msg, "job handler panicked");
                self.mark_failure(execution.id, format!("handler panicked: {msg}"), None)
            }
        }
    }

    pub fn get(&self, id: ExecutionId) -> Result<Option<JobExecution>, ExecutionError> {
        Ok(self.store.load(&id.to_string())?)
    }

    /// Read-only view over the same records.
    pub fn history(&self) -> ExecutionHistory {
        ExecutionHistory::new(self.store.clone())
    }

    /// Executions matching `filter`, newest first.
    pub fn list(&self, filter: &ExecutionFilter) -> Result<Vec<JobExecution>, ExecutionError> {
        self.history().list(filter)
    }

    pub fn recent_terminal(
        &self,
        job_id: &str,
        org_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<JobExecution>, ExecutionError> {
        self.history().recent_terminal(job_id, org_id, limit)
    }

    pub fn stats(&self, job_id: &str, org_id: Option<&str>) -> Result<JobExecutionStats, ExecutionError> {
        self.history().stats(job_id, org_id)
    }

    /// Delete executions that started more than `retention_days` ago.
    pub fn cleanup(&self, retention_days: u32) -> Result<usize, ExecutionError> {
        let cutoff = self.clock.now() - Duration::days(i64::from(retention_days));
        let stale: Vec<JobExecution> = self.store.load_where(|e: &JobExecution| e.started_at < cutoff)?;

        let mut removed = 0;
        for execution in stale {
            if self.store.delete::<JobExecution>(&execution.id.to_string())? {
                removed += 1;
            }
        }
        debug!(removed, retention_days, "execution cleanup finished");
        Ok(removed)
    }
}

/// Queries over persisted executions, without the write side.
#[derive(Clone)]
pub struct ExecutionHistory {
    store: SharedStore,
}

impl ExecutionHistory {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Executions matching `filter`, newest first.
    pub fn list(&self, filter: &ExecutionFilter) -> Result<Vec<JobExecution>, ExecutionError> {
        let mut executions: Vec<JobExecution> = self.store.load_where(|e: &JobExecution| filter.matches(e))?;
        executions.sort_by(newest_first);
        if let Some(limit) = filter.limit {
            executions.truncate(limit);
        }
        Ok(executions)
    }

    /// The `limit` most recent terminal executions of a job, newest first.
    pub fn recent_terminal(
        &self,
        job_id: &str,
        org_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<JobExecution>, ExecutionError> {
        let mut executions: Vec<JobExecution> = self.store.load_where(|e: &JobExecution| {
            e.job_id == job_id && e.is_terminal() && org_id.is_none_or(|o| e.org_id.as_deref() == Some(o))
        })?;
        executions.sort_by(newest_first);
        executions.truncate(limit);
        Ok(executions)
    }

    /// Failed or timed-out runs of a job started at or after `since`.
    pub fn failures_since(
        &self,
        job_id: &str,
        org_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<usize, ExecutionError> {
        let failures: Vec<JobExecution> = self.store.load_where(|e: &JobExecution| {
            e.job_id == job_id
                && e.status.is_failure()
                && e.started_at >= since
                && org_id.is_none_or(|o| e.org_id.as_deref() == Some(o))
        })?;
        Ok(failures.len())
    }

    pub fn stats(&self, job_id: &str, org_id: Option<&str>) -> Result<JobExecutionStats, ExecutionError> {
        let executions: Vec<JobExecution> = self.store.load_where(|e: &JobExecution| {
            e.job_id == job_id && org_id.is_none_or(|o| e.org_id.as_deref() == Some(o))
        })?;
        Ok(JobExecutionStats::from_executions(job_id, &executions))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
