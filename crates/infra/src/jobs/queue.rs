//! Queue manager: owns the queued-job collection and every transition in it.
//!
//! ## Lifecycle
//!
//! ```text
//! enqueue ──► delayed ──(due)──► pending ──(deps done)──► ready ──► running
//!               ▲                                                   │
//!               └────────────── failure, attempts left ─────────────┤
//!                                          success ──► completed ◄──┤
//!                         attempts exhausted ──► failed + dead letter
//! ```
//!
//! Read-modify-write sequences run under one internal lock. Handlers run
//! outside of it, so a slow job never blocks enqueue or selection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use jobwarden_core::{DeadLetterId, QueuedJobId, SharedClock};
use jobwarden_events::{EventSink, NoopSink, WorkerEvent};

use super::dead_letter::{DeadLetterError, DeadLetterStore, NewDeadLetter};
use super::execution::{ExecutionStatus, JobExecution};
use super::registry::JobRegistry;
use super::selection::{DependencyState, dependency_state, select_next, waiting_dependents};
use super::tracker::{ExecutionError, ExecutionFilter, ExecutionTracker, RunRequest};
use super::types::{
    BackoffPolicy, JobSpec, Priority, PriorityCounts, QueueControl, QueueMode, QueueStats, QueuedJob,
    QueuedJobStatus, StatusCounts,
};
use crate::store::{RecordStore, SharedStore, StoreError};

/// Queue manager error.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is draining; new jobs are not accepted")]
    Draining,
    #[error("unknown job: {0}")]
    UnknownJob(String),
    #[error("unknown dependency: {0}")]
    UnknownDependency(QueuedJobId),
    #[error("queued job not found: {0}")]
    NotFound(QueuedJobId),
    #[error("queued job {id} is {status} and cannot be cancelled")]
    NotCancellable { id: QueuedJobId, status: QueuedJobStatus },
    #[error("queued job {id} is {status}, expected running")]
    NotRunning { id: QueuedJobId, status: QueuedJobStatus },
    #[error("dead letter not found: {0}")]
    DeadLetterNotFound(DeadLetterId),
    #[error("dead letter {0} cannot be retried")]
    DeadLetterNotRetryable(DeadLetterId),
    #[error("invalid job spec: {0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

/// Queue manager configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Execution slots
    pub max_concurrency: usize,
    /// Used when a spec leaves `max_attempts` unset
    pub default_max_attempts: u32,
    pub default_backoff: BackoffPolicy,
    /// Manual dead-letter retries allowed per lineage before `can_retry` turns false
    pub max_dead_letter_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            default_max_attempts: 3,
            default_backoff: BackoffPolicy::default(),
            max_dead_letter_retries: 5,
        }
    }
}

impl QueueConfig {
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_default_max_attempts(mut self, attempts: u32) -> Self {
        self.default_max_attempts = attempts;
        self
    }

    pub fn with_default_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.default_backoff = policy;
        self
    }
}

/// Listing filter; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct QueueFilter {
    pub status: Option<QueuedJobStatus>,
    pub priority: Option<Priority>,
    pub job_id: Option<String>,
    pub org_id: Option<String>,
    pub limit: Option<usize>,
}

impl QueueFilter {
    fn matches(&self, job: &QueuedJob) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self.priority.is_none_or(|p| job.priority == p)
            && self.job_id.as_ref().is_none_or(|j| &job.job_id == j)
            && self.org_id.as_ref().is_none_or(|o| job.org_id.as_ref() == Some(o))
    }
}

type Snapshot = HashMap<QueuedJobId, QueuedJob>;

pub struct QueueManager {
    store: SharedStore,
    registry: Arc<JobRegistry>,
    tracker: Arc<ExecutionTracker>,
    clock: SharedClock,
    events: Arc<dyn EventSink>,
    config: QueueConfig,
    dead_letters: DeadLetterStore,
    op_lock: Mutex<()>,
}

impl QueueManager {
    pub fn new(
        store: SharedStore,
        registry: Arc<JobRegistry>,
        tracker: Arc<ExecutionTracker>,
        clock: SharedClock,
        config: QueueConfig,
    ) -> Self {
        Self {
            dead_letters: DeadLetterStore::new(store.clone()),
            store,
            registry,
            tracker,
            clock,
            events: Arc::new(NoopSink),
            config,
            op_lock: Mutex::new(()),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<ExecutionTracker> {
        &self.tracker
    }

    pub fn dead_letters(&self) -> &DeadLetterStore {
        &self.dead_letters
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>, QueueError> {
        self.op_lock.lock().map_err(|_| QueueError::Store(StoreError::Poisoned))
    }

    fn snapshot(&self) -> Result<Snapshot, StoreError> {
        Ok(self
            .store
            .load_all::<QueuedJob>()?
            .into_iter()
            .map(|j| (j.id, j))
            .collect())
    }

    // ---- modes ----

    pub fn mode(&self) -> Result<QueueMode, QueueError> {
        Ok(self
            .store
            .load::<QueueControl>(QueueControl::KEY)?
            .map(|c| c.mode)
            .unwrap_or_default())
    }

    fn set_mode(&self, mode: QueueMode) -> Result<(), QueueError> {
        let _guard = self.guard()?;
        self.store.save(&QueueControl {
            mode,
            updated_at: self.clock.now(),
        })?;
        info!(mode = %mode, "queue mode changed");
        self.events.emit(WorkerEvent::QueueModeChanged {
            mode: mode.to_string(),
        });
        Ok(())
    }

    /// Stop dispatching; queued jobs keep their state.
    pub fn pause(&self) -> Result<(), QueueError> {
        self.set_mode(QueueMode::Paused)
    }

    pub fn resume(&self) -> Result<(), QueueError> {
        self.set_mode(QueueMode::Running)
    }

    /// Refuse new jobs; ready and running work still finishes.
    pub fn drain(&self) -> Result<(), QueueError> {
        self.set_mode(QueueMode::Draining)
    }

    /// Draining with nothing ready or running left.
    pub fn is_drained(&self) -> Result<bool, QueueError> {
        if self.mode()? != QueueMode::Draining {
            return Ok(false);
        }
        let busy = self
            .store
            .load_where(|j: &QueuedJob| matches!(j.status, QueuedJobStatus::Ready | QueuedJobStatus::Running))?;
        Ok(busy.is_empty())
    }

    // ---- enqueue / inspect / cancel ----

    pub fn enqueue(&self, spec: JobSpec) -> Result<QueuedJob, QueueError> {
        self.enqueue_with(spec, 0)
    }

    fn enqueue_with(&self, spec: JobSpec, dead_letter_retries: u32) -> Result<QueuedJob, QueueError> {
        let _guard = self.guard()?;

        if self.mode()? == QueueMode::Draining {
            return Err(QueueError::Draining);
        }
        if !self.registry.contains(&spec.job_id) {
            return Err(QueueError::UnknownJob(spec.job_id));
        }
        let max_attempts = spec.max_attempts.unwrap_or(self.config.default_max_attempts);
        if max_attempts == 0 {
            return Err(QueueError::Invalid("max_attempts must be at least 1".into()));
        }

        let jobs = self.snapshot()?;
        if let Some(missing) = spec.depends_on.iter().find(|d| !jobs.contains_key(d)) {
            return Err(QueueError::UnknownDependency(*missing));
        }

        let now = self.clock.now();
        let mut job = QueuedJob {
            id: QueuedJobId::new(),
            job_id: spec.job_id,
            priority: spec.priority,
            status: QueuedJobStatus::Pending,
            attempt: 0,
            max_attempts,
            enqueued_at: now,
            scheduled_for: spec.scheduled_for,
            depends_on: spec.depends_on,
            concurrency_key: spec.concurrency_key,
            org_id: spec.org_id,
            input: spec.input,
            error: None,
            backoff: spec.backoff.unwrap_or_else(|| self.config.default_backoff.clone()),
            started_at: None,
            finished_at: None,
            updated_at: now,
            last_execution_id: None,
            dead_letter_retries,
        };

        let status = match dependency_state(&job, &jobs) {
            DependencyState::Broken(dep) => {
                job.error = Some(dependency_failed(dep));
                QueuedJobStatus::Failed
            }
            _ if !job.is_due(now) => QueuedJobStatus::Delayed,
            DependencyState::Waiting => QueuedJobStatus::Pending,
            DependencyState::Satisfied => QueuedJobStatus::Ready,
        };
        job.transition(status, now);
        self.store.save(&job)?;

        info!(
            queued_job_id = %job.id,
            job_id = %job.job_id,
            priority = %job.priority,
            status = %job.status,
            "job enqueued"
        );
        Ok(job)
    }

    pub fn get(&self, id: QueuedJobId) -> Result<Option<QueuedJob>, QueueError> {
        Ok(self.store.load(&id.to_string())?)
    }

    /// Matching jobs in enqueue order.
    pub fn list(&self, filter: &QueueFilter) -> Result<Vec<QueuedJob>, QueueError> {
        let mut jobs: Vec<QueuedJob> = self.store.load_where(|j: &QueuedJob| filter.matches(j))?;
        jobs.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    /// Cancel a job that has not started. Running jobs are never interrupted.
    pub fn cancel(&self, id: QueuedJobId) -> Result<QueuedJob, QueueError> {
        let _guard = self.guard()?;
        let mut jobs = self.snapshot()?;

        let job = jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if !job.status.is_waiting() {
            return Err(QueueError::NotCancellable { id, status: job.status });
        }

        let now = self.clock.now();
        job.transition(QueuedJobStatus::Cancelled, now);
        let cancelled = job.clone();
        self.store.save(&cancelled)?;
        info!(queued_job_id = %id, job_id = %cancelled.job_id, "job cancelled");

        self.fail_dependents(id, &mut jobs, now)?;
        Ok(cancelled)
    }

    // ---- dispatch ----

    /// Promote due `delayed` jobs and re-check `pending` ones. Returns how many
    /// became `ready`.
    pub fn promote_due(&self) -> Result<usize, QueueError> {
        let _guard = self.guard()?;
        let mut jobs = self.snapshot()?;
        let now = self.clock.now();

        let candidates: Vec<QueuedJobId> = jobs
            .values()
            .filter(|j| match j.status {
                QueuedJobStatus::Delayed => j.is_due(now),
                QueuedJobStatus::Pending => true,
                _ => false,
            })
            .map(|j| j.id)
            .collect();

        let mut promoted = 0;
        for id in candidates {
            let Some(job) = jobs.get(&id) else { continue };
            if !job.status.is_waiting() {
                // Failed by an earlier propagation in this pass.
                continue;
            }
            let state = dependency_state(job, &jobs);
            let before = job.status;

            match state {
                DependencyState::Broken(dep) => {
                    self.fail_one(id, dependency_failed(dep), &mut jobs, now)?;
                    self.fail_dependents(id, &mut jobs, now)?;
                }
                DependencyState::Waiting if before == QueuedJobStatus::Delayed => {
                    self.update(id, &mut jobs, |j| j.transition(QueuedJobStatus::Pending, now))?;
                }
                DependencyState::Satisfied => {
                    self.update(id, &mut jobs, |j| j.transition(QueuedJobStatus::Ready, now))?;
                    promoted += 1;
                }
                DependencyState::Waiting => {}
            }
        }

        if promoted > 0 {
            debug!(promoted, "promoted jobs to ready");
        }
        Ok(promoted)
    }

    /// Select and mark the next job `running`. `None` while paused, when the
    /// pool is full, or when nothing is eligible.
    pub fn claim_next(&self) -> Result<Option<QueuedJob>, QueueError> {
        let _guard = self.guard()?;
        if self.mode()? == QueueMode::Paused {
            return Ok(None);
        }

        let mut jobs = self.snapshot()?;
        let Some(id) = select_next(&jobs, self.config.max_concurrency) else {
            return Ok(None);
        };

        let now = self.clock.now();
        let claimed = self.update(id, &mut jobs, |j| {
            j.transition(QueuedJobStatus::Running, now);
            j.attempt += 1;
            j.started_at.get_or_insert(now);
        })?;

        debug!(
            queued_job_id = %claimed.id,
            job_id = %claimed.job_id,
            attempt = claimed.attempt,
            "job claimed"
        );
        Ok(Some(claimed))
    }

    /// Run a claimed job through the tracked runner and apply the outcome.
    pub fn execute_claimed(&self, job: &QueuedJob) -> Result<QueuedJob, QueueError> {
        let request = RunRequest {
            org_id: job.org_id.clone(),
            input: job.input.clone(),
            queued_job_id: Some(job.id),
        };

        let execution = match self.registry.get(&job.job_id) {
            Some(definition) => self.tracker.run(definition, request)?,
            None => {
                // Persisted by an older build whose registry had this job.
                let execution = self.tracker.start(&job.job_id, &job.job_id, request)?;
                self.tracker
                    .mark_failure(execution.id, format!("no handler registered for job: {}", job.job_id), None)?
            }
        };

        self.complete(job.id, &execution)
    }

    /// Apply a terminal execution to a running job.
    pub fn complete(&self, id: QueuedJobId, execution: &JobExecution) -> Result<QueuedJob, QueueError> {
        let _guard = self.guard()?;
        let mut jobs = self.snapshot()?;
        let now = self.clock.now();

        let job = jobs.get(&id).ok_or(QueueError::NotFound(id))?;
        if job.status != QueuedJobStatus::Running {
            return Err(QueueError::NotRunning { id, status: job.status });
        }

        match execution.status {
            ExecutionStatus::Success => self.complete_success(id, execution, &mut jobs, now),
            ExecutionStatus::Failed | ExecutionStatus::Timeout => {
                let error = execution
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("execution {}", execution.status));
                self.complete_failure(id, execution, error, &mut jobs, now)
            }
            ExecutionStatus::Running => Err(QueueError::Invalid(format!(
                "execution {} has not finished",
                execution.id
            ))),
        }
    }

    fn complete_success(
        &self,
        id: QueuedJobId,
        execution: &JobExecution,
        jobs: &mut Snapshot,
        now: DateTime<Utc>,
    ) -> Result<QueuedJob, QueueError> {
        let done = self.update(id, jobs, |j| {
            j.transition(QueuedJobStatus::Completed, now);
            j.error = None;
            j.last_execution_id = Some(execution.id);
        })?;
        info!(queued_job_id = %id, job_id = %done.job_id, attempt = done.attempt, "job completed");

        let dependents: Vec<QueuedJobId> = jobs
            .values()
            .filter(|j| j.status == QueuedJobStatus::Pending && j.depends_on.contains(&id))
            .map(|j| j.id)
            .collect();
        for dep_id in dependents {
            let Some(dependent) = jobs.get(&dep_id) else { continue };
            if dependency_state(dependent, jobs) == DependencyState::Satisfied {
                let next = if dependent.is_due(now) {
                    QueuedJobStatus::Ready
                } else {
                    QueuedJobStatus::Delayed
                };
                self.update(dep_id, jobs, |j| j.transition(next, now))?;
                debug!(queued_job_id = %dep_id, status = %next, "dependent released");
            }
        }

        self.events.emit(WorkerEvent::JobCompleted {
            queued_job_id: id,
            job_id: done.job_id.clone(),
            execution_id: Some(execution.id),
        });
        Ok(done)
    }

    fn complete_failure(
        &self,
        id: QueuedJobId,
        execution: &JobExecution,
        error: String,
        jobs: &mut Snapshot,
        now: DateTime<Utc>,
    ) -> Result<QueuedJob, QueueError> {
        let retry = jobs.get(&id).is_some_and(QueuedJob::attempts_remaining);

        if retry {
            let delayed = self.update(id, jobs, |j| {
                let delay = j.backoff.delay_for_attempt(j.attempt);
                j.transition(QueuedJobStatus::Delayed, now);
                j.scheduled_for = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
                j.error = Some(error.clone());
                j.last_execution_id = Some(execution.id);
            })?;
            let scheduled_for = delayed.scheduled_for.unwrap_or(now);
            warn!(
                queued_job_id = %id,
                job_id = %delayed.job_id,
                attempt = delayed.attempt,
                max_attempts = delayed.max_attempts,
                scheduled_for = %scheduled_for,
                error = %error,
                "job failed; retry scheduled"
            );
            self.events.emit(WorkerEvent::JobRetryScheduled {
                queued_job_id: id,
                job_id: delayed.job_id.clone(),
                attempt: delayed.attempt,
                scheduled_for,
                error,
            });
            return Ok(delayed);
        }

        let failed = self.update(id, jobs, |j| {
            j.transition(QueuedJobStatus::Failed, now);
            j.error = Some(error.clone());
            j.last_execution_id = Some(execution.id);
        })?;

        if !self.dead_letters.exists_for(id)? {
            let can_retry = self.registry.contains(&failed.job_id)
                && failed.dead_letter_retries < self.config.max_dead_letter_retries;
            let record = self.dead_letters.record(NewDeadLetter {
                job: &failed,
                job_name: self.registry.name_of(&failed.job_id),
                failure_reason: format!("max attempts ({}) exceeded: {error}", failed.max_attempts),
                can_retry,
                at: now,
            })?;
            warn!(
                queued_job_id = %id,
                job_id = %failed.job_id,
                dead_letter_id = %record.id,
                attempts = failed.attempt,
                error = %error,
                "job dead-lettered"
            );
            self.events.emit(WorkerEvent::DeadLettered {
                dead_letter_id: record.id,
                queued_job_id: id,
                job_id: failed.job_id.clone(),
                attempts: failed.attempt,
                error,
            });
        }

        self.fail_dependents(id, jobs, now)?;
        Ok(failed)
    }

    /// Claim and run jobs one at a time until nothing is eligible. Returns the
    /// number of attempts executed.
    pub fn run_until_idle(&self) -> Result<usize, QueueError> {
        let mut executed = 0;
        while self.run_next()?.is_some() {
            executed += 1;
        }
        Ok(executed)
    }

    /// One synchronous dispatch step.
    pub fn run_next(&self) -> Result<Option<QueuedJob>, QueueError> {
        self.promote_due()?;
        match self.claim_next()? {
            Some(job) => self.execute_claimed(&job).map(Some),
            None => Ok(None),
        }
    }

    /// Put jobs left `running` by a crashed process back to `ready` and close
    /// their dangling executions.
    pub fn recover_interrupted(&self) -> Result<usize, QueueError> {
        let _guard = self.guard()?;
        let mut jobs = self.snapshot()?;
        let now = self.clock.now();

        let running: Vec<QueuedJobId> = jobs
            .values()
            .filter(|j| j.status == QueuedJobStatus::Running)
            .map(|j| j.id)
            .collect();

        let dangling = self
            .tracker
            .list(&ExecutionFilter::default().status(ExecutionStatus::Running))?;

        for id in &running {
            self.update(*id, &mut jobs, |j| {
                j.transition(QueuedJobStatus::Ready, now);
                j.attempt = j.attempt.saturating_sub(1);
            })?;
            for execution in dangling.iter().filter(|e| e.queued_job_id == Some(*id)) {
                self.tracker
                    .mark_failure(execution.id, "interrupted: worker process stopped", None)?;
            }
            warn!(queued_job_id = %id, "recovered interrupted job");
        }
        Ok(running.len())
    }

    /// Re-enqueue a dead letter with a reset attempt counter.
    pub fn retry_dead_letter(&self, id: DeadLetterId) -> Result<QueuedJob, QueueError> {
        self.dead_letters
            .retry(id, |spec, retries| self.enqueue_with(spec, retries))
            .map_err(|err| match err {
                DeadLetterError::NotFound(id) => QueueError::DeadLetterNotFound(id),
                DeadLetterError::NotRetryable(id) => QueueError::DeadLetterNotRetryable(id),
                DeadLetterError::Store(e) => QueueError::Store(e),
                DeadLetterError::Enqueue(e) => e,
            })
    }

    // ---- stats ----

    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        let jobs = self.store.load_all::<QueuedJob>()?;

        let mut by_status = StatusCounts::default();
        let mut by_priority = PriorityCounts::default();
        let mut wait_total = 0i64;
        let mut waited = 0usize;
        for job in &jobs {
            by_status.add(job.status);
            if !job.status.is_terminal() {
                by_priority.add(job.priority);
            }
            if let Some(started) = job.started_at {
                wait_total += (started - job.enqueued_at).num_milliseconds().max(0);
                waited += 1;
            }
        }

        let durations: Vec<i64> = self
            .tracker
            .list(&ExecutionFilter::default())?
            .into_iter()
            .filter(|e| e.queued_job_id.is_some())
            .filter_map(|e| e.duration_ms)
            .collect();

        let finished = by_status.completed + by_status.failed;
        let running = by_status.running;
        let max_concurrency = self.config.max_concurrency;

        Ok(QueueStats {
            mode: self.mode()?,
            running,
            max_concurrency,
            utilization: running as f64 / max_concurrency.max(1) as f64,
            dead_letters: self.dead_letters.count()?,
            avg_wait_ms: (waited > 0).then(|| wait_total as f64 / waited as f64),
            avg_execution_ms: (!durations.is_empty())
                .then(|| durations.iter().sum::<i64>() as f64 / durations.len() as f64),
            success_rate: (finished > 0).then(|| by_status.completed as f64 / finished as f64),
            by_status,
            by_priority,
        })
    }

    // ---- helpers ----

    fn update(
        &self,
        id: QueuedJobId,
        jobs: &mut Snapshot,
        f: impl FnOnce(&mut QueuedJob),
    ) -> Result<QueuedJob, QueueError> {
        let job = jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        f(job);
        self.store.save(&*job)?;
        Ok(job.clone())
    }

    fn fail_one(
        &self,
        id: QueuedJobId,
        error: String,
        jobs: &mut Snapshot,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let job = self.update(id, jobs, |j| {
            j.transition(QueuedJobStatus::Failed, now);
            j.error = Some(error);
        })?;
        warn!(queued_job_id = %id, job_id = %job.job_id, error = ?job.error, "dependent job failed");
        Ok(())
    }

    /// Fail every waiting job that transitively depends on `root`.
    fn fail_dependents(&self, root: QueuedJobId, jobs: &mut Snapshot, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let dependents = waiting_dependents(root, jobs);
        for id in &dependents {
            self.fail_one(*id, dependency_failed(root), jobs, now)?;
        }
        Ok(dependents.len())
    }
}

fn dependency_failed(dep: QueuedJobId) -> String {
    format!("dependency failed: {dep}")
}
