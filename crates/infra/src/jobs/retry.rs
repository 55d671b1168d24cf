//! Reactive retry sweep over recently failed executions.
//!
//! Independent of the queue's per-attempt backoff: this looks at executions
//! that never went through the queue (ad hoc or externally scheduled runs)
//! and re-runs jobs whose recent failure count is still under an hourly cap.
//! Queue-owned executions are left to the queue's own retry and dead-letter
//! handling.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use jobwarden_core::SharedClock;
use jobwarden_events::{EventSink, NoopSink, WorkerEvent};

use super::execution::{ExecutionStatus, JobExecution};
use super::registry::JobRegistry;
use super::tracker::{ExecutionError, ExecutionFilter, ExecutionTracker, RunRequest};
use crate::workers::{PeriodicWorker, WorkerHandle};

/// Failures are counted over this fixed window when applying the cap.
const FAILURE_WINDOW_HOURS: i64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryCoordinatorConfig {
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    /// How far back to look for failed executions.
    pub lookback_hours: i64,
    /// Skip a job once it failed this many times within the last hour.
    pub max_retries: usize,
    pub excluded_jobs: Vec<String>,
    /// Sleep between two retries of one sweep.
    #[serde(with = "duration_secs")]
    pub pacing: Duration,
}

impl Default for RetryCoordinatorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15 * 60),
            lookback_hours: 24,
            max_retries: 3,
            excluded_jobs: Vec::new(),
            pacing: Duration::from_secs(1),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetrySweepReport {
    pub retried: usize,
    pub skipped: usize,
    /// Failed executions inside the lookback window.
    pub total_failed: usize,
    /// Retries that could not be recorded (store errors).
    pub errors: usize,
}

pub struct RetryCoordinator {
    tracker: Arc<ExecutionTracker>,
    registry: Arc<JobRegistry>,
    clock: SharedClock,
    events: Arc<dyn EventSink>,
    config: RetryCoordinatorConfig,
}

impl RetryCoordinator {
    pub fn new(
        tracker: Arc<ExecutionTracker>,
        registry: Arc<JobRegistry>,
        clock: SharedClock,
        config: RetryCoordinatorConfig,
    ) -> Self {
        Self {
            tracker,
            registry,
            clock,
            events: Arc::new(NoopSink),
            config,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &RetryCoordinatorConfig {
        &self.config
    }

    /// Run one sweep. Individual retry failures never abort it.
    pub fn sweep(&self) -> Result<RetrySweepReport, ExecutionError> {
        let now = self.clock.now();
        let cutoff = now - ChronoDuration::hours(self.config.lookback_hours);

        let failed: Vec<JobExecution> = self
            .tracker
            .list(&ExecutionFilter::default().status(ExecutionStatus::Failed).since(cutoff))?
            .into_iter()
            .filter(|e| e.queued_job_id.is_none())
            .collect();

        let candidates = distinct_candidates(&failed);
        let mut report = RetrySweepReport {
            total_failed: failed.len(),
            ..RetrySweepReport::default()
        };

        info!(
            total_failed = report.total_failed,
            candidates = candidates.len(),
            lookback_hours = self.config.lookback_hours,
            "retry sweep started"
        );

        let mut first = true;
        for candidate in candidates {
            if self.config.excluded_jobs.iter().any(|j| j == &candidate.job_id) {
                debug!(job_id = %candidate.job_id, "job excluded from retry sweep");
                report.skipped += 1;
                continue;
            }

            let Some(definition) = self.registry.get(&candidate.job_id) else {
                warn!(job_id = %candidate.job_id, "failed job is no longer registered; skipping");
                report.skipped += 1;
                continue;
            };

            let window = ExecutionFilter::for_job(candidate.job_id.clone())
                .status(ExecutionStatus::Failed)
                .since(now - ChronoDuration::hours(FAILURE_WINDOW_HOURS));
            let recent_failures = match self.tracker.list(&window) {
                Ok(recent) => recent.len(),
                Err(e) => {
                    report.errors += 1;
                    error!(job_id = %candidate.job_id, error = %e, "failed to count recent failures");
                    continue;
                }
            };
            if recent_failures >= self.config.max_retries {
                warn!(
                    job_id = %candidate.job_id,
                    recent_failures,
                    max_retries = self.config.max_retries,
                    "hourly failure cap reached; not retrying"
                );
                report.skipped += 1;
                continue;
            }

            if !first && !self.config.pacing.is_zero() {
                std::thread::sleep(self.config.pacing);
            }
            first = false;

            let request = RunRequest {
                org_id: candidate.org_id.clone(),
                input: candidate.input.clone(),
                queued_job_id: None,
            };
            match self.tracker.run(definition, request) {
                Ok(execution) => {
                    report.retried += 1;
                    info!(
                        job_id = %candidate.job_id,
                        execution_id = %execution.id,
                        status = %execution.status,
                        "job retried"
                    );
                }
                Err(e) => {
                    report.errors += 1;
                    error!(job_id = %candidate.job_id, error = %e, "retry could not be recorded");
                }
            }
        }

        info!(
            retried = report.retried,
            skipped = report.skipped,
            total_failed = report.total_failed,
            "retry sweep finished"
        );
        self.events.emit(WorkerEvent::RetrySweepCompleted {
            retried: report.retried,
            skipped: report.skipped,
            total_failed: report.total_failed,
        });
        Ok(report)
    }

    /// Sweep every `interval` on a background thread.
    pub fn spawn(self: Arc<Self>) -> std::io::Result<WorkerHandle> {
        let interval = self.config.interval;
        PeriodicWorker::spawn("retry-coordinator", interval, move || self.sweep().map(|_| ()))
    }
}

/// One candidate per distinct job id + org + input, newest first.
fn distinct_candidates(failed: &[JobExecution]) -> Vec<&JobExecution> {
    let mut seen = HashSet::new();
    failed
        .iter()
        .filter(|e| {
            let input = e.input.as_ref().map(|v| v.to_string());
            seen.insert((e.job_id.clone(), e.org_id.clone(), input))
        })
        .collect()
}
