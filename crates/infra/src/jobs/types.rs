//! Queue data model: queued jobs, priorities, backoff, dead letters, stats.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobwarden_core::{DeadLetterId, DomainError, ExecutionId, QueuedJobId};

use crate::store::{Record, kinds};

/// Dispatch priority. Lower rank wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 4] = [Priority::Critical, Priority::High, Priority::Normal, Priority::Low];

    pub fn rank(self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(DomainError::validation(format!("unknown priority: {other}"))),
        }
    }
}

/// Lifecycle of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuedJobStatus {
    /// Waiting on dependencies
    Pending,
    /// Eligible for dispatch
    Ready,
    /// Handed to a worker slot
    Running,
    /// Waiting for `scheduled_for` (initial delay or retry backoff)
    Delayed,
    Completed,
    /// Terminal failure (attempts exhausted or a dependency failed)
    Failed,
    Cancelled,
}

impl QueuedJobStatus {
    pub const ALL: [QueuedJobStatus; 7] = [
        QueuedJobStatus::Pending,
        QueuedJobStatus::Ready,
        QueuedJobStatus::Running,
        QueuedJobStatus::Delayed,
        QueuedJobStatus::Completed,
        QueuedJobStatus::Failed,
        QueuedJobStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            QueuedJobStatus::Completed | QueuedJobStatus::Failed | QueuedJobStatus::Cancelled
        )
    }

    /// Not started yet; may still be cancelled.
    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            QueuedJobStatus::Pending | QueuedJobStatus::Ready | QueuedJobStatus::Delayed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueuedJobStatus::Pending => "pending",
            QueuedJobStatus::Ready => "ready",
            QueuedJobStatus::Running => "running",
            QueuedJobStatus::Delayed => "delayed",
            QueuedJobStatus::Completed => "completed",
            QueuedJobStatus::Failed => "failed",
            QueuedJobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for QueuedJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueuedJobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueuedJobStatus::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DomainError::validation(format!("unknown job status: {s}")))
    }
}

/// Queue-wide dispatch mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    #[default]
    Running,
    /// Nothing new is dispatched
    Paused,
    /// Nothing new is accepted; ready and in-flight work finishes
    Draining,
}

impl QueueMode {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueMode::Running => "running",
            QueueMode::Paused => "paused",
            QueueMode::Draining => "draining",
        }
    }
}

impl std::fmt::Display for QueueMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueMode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "running" => Ok(QueueMode::Running),
            "paused" => Ok(QueueMode::Paused),
            "draining" => Ok(QueueMode::Draining),
            other => Err(DomainError::validation(format!("unknown queue mode: {other}"))),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Delay inserted before a failed job's next attempt becomes eligible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 60_000,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Retry immediately.
    pub fn none() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn fixed(delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            base_delay_ms: ms,
            max_delay_ms: ms,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay after the given (1-indexed) failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay_ms as f64;
        let max_ms = self.max_delay_ms as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic jitter derived from the attempt number.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }
}

/// Enqueue request. Also kept verbatim on dead-letter records so a manual
/// retry reproduces the original submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: String,
    #[serde(default)]
    pub priority: Priority,
    /// `None` falls back to the queue default.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub depends_on: Vec<QueuedJobId>,
    #[serde(default)]
    pub concurrency_key: Option<String>,
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default)]
    pub input: Option<serde_json::Value>,
    #[serde(default)]
    pub backoff: Option<BackoffPolicy>,
}

impl JobSpec {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            priority: Priority::Normal,
            max_attempts: None,
            scheduled_for: None,
            depends_on: Vec::new(),
            concurrency_key: None,
            org_id: None,
            input: None,
            backoff: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn depends_on(mut self, ids: impl IntoIterator<Item = QueuedJobId>) -> Self {
        self.depends_on.extend(ids);
        self
    }

    pub fn concurrency_key(mut self, key: impl Into<String>) -> Self {
        self.concurrency_key = Some(key.into());
        self
    }

    pub fn org(mut self, org_id: impl Into<String>) -> Self {
        self.org_id = Some(org_id.into());
        self
    }

    pub fn input(mut self, input: serde_json::Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn backoff(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = Some(policy);
        self
    }
}

/// A unit of work in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: QueuedJobId,
    pub job_id: String,
    pub priority: Priority,
    pub status: QueuedJobStatus,
    /// Attempts started so far
    pub attempt: u32,
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub depends_on: Vec<QueuedJobId>,
    pub concurrency_key: Option<String>,
    pub org_id: Option<String>,
    pub input: Option<serde_json::Value>,
    /// Last failure message
    pub error: Option<String>,
    pub backoff: BackoffPolicy,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub last_execution_id: Option<ExecutionId>,
    /// How many times this lineage was manually retried out of the dead-letter store.
    #[serde(default)]
    pub dead_letter_retries: u32,
}

impl QueuedJob {
    pub fn attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// `true` once `scheduled_for` (if any) has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for.is_none_or(|at| at <= now)
    }

    /// Rebuild the request that produced this job.
    pub fn to_spec(&self) -> JobSpec {
        JobSpec {
            job_id: self.job_id.clone(),
            priority: self.priority,
            max_attempts: Some(self.max_attempts),
            scheduled_for: None,
            depends_on: Vec::new(),
            concurrency_key: self.concurrency_key.clone(),
            org_id: self.org_id.clone(),
            input: self.input.clone(),
            backoff: Some(self.backoff.clone()),
        }
    }

    pub(crate) fn transition(&mut self, status: QueuedJobStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
        if status.is_terminal() {
            self.finished_at = Some(now);
        }
    }
}

impl Record for QueuedJob {
    const KIND: &'static str = kinds::QUEUED_JOBS;

    fn key(&self) -> String {
        self.id.to_string()
    }
}

/// A queued job that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterJob {
    pub id: DeadLetterId,
    /// The queued job that was dead-lettered.
    pub original_job_id: QueuedJobId,
    pub job_id: String,
    pub job_name: String,
    pub failure_reason: String,
    pub attempts: u32,
    pub moved_to_dlq_at: DateTime<Utc>,
    /// Manual retries already spent on this lineage.
    pub retry_count: u32,
    pub error: Option<String>,
    pub can_retry: bool,
    pub spec: JobSpec,
}

impl Record for DeadLetterJob {
    const KIND: &'static str = kinds::DEAD_LETTER_JOBS;

    fn key(&self) -> String {
        self.id.to_string()
    }
}

/// Persisted queue-wide controls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueControl {
    pub mode: QueueMode,
    pub updated_at: DateTime<Utc>,
}

impl QueueControl {
    pub const KEY: &'static str = "queue";
}

impl Record for QueueControl {
    const KIND: &'static str = kinds::QUEUE_CONTROL;

    fn key(&self) -> String {
        Self::KEY.to_string()
    }
}

/// Per-status counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub delayed: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    pub fn add(&mut self, status: QueuedJobStatus) {
        match status {
            QueuedJobStatus::Pending => self.pending += 1,
            QueuedJobStatus::Ready => self.ready += 1,
            QueuedJobStatus::Running => self.running += 1,
            QueuedJobStatus::Delayed => self.delayed += 1,
            QueuedJobStatus::Completed => self.completed += 1,
            QueuedJobStatus::Failed => self.failed += 1,
            QueuedJobStatus::Cancelled => self.cancelled += 1,
        }
    }
}

/// Per-priority counts of non-terminal jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PriorityCounts {
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl PriorityCounts {
    pub fn add(&mut self, priority: Priority) {
        match priority {
            Priority::Critical => self.critical += 1,
            Priority::High => self.high += 1,
            Priority::Normal => self.normal += 1,
            Priority::Low => self.low += 1,
        }
    }
}

/// Point-in-time queue statistics.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub mode: QueueMode,
    pub by_status: StatusCounts,
    pub by_priority: PriorityCounts,
    pub running: usize,
    pub max_concurrency: usize,
    /// running / max_concurrency
    pub utilization: f64,
    pub dead_letters: usize,
    /// Average enqueue → first start, over jobs that started.
    pub avg_wait_ms: Option<f64>,
    /// Average start → finish, over finished jobs.
    pub avg_execution_ms: Option<f64>,
    /// completed / (completed + failed)
    pub success_rate: Option<f64>,
}
