//! Job run records and per-job aggregates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobwarden_core::{ExecutionId, QueuedJobId};

use crate::store::{Record, kinds};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    /// Failed or timed out.
    pub fn is_failure(self) -> bool {
        matches!(self, ExecutionStatus::Failed | ExecutionStatus::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One run of a job. Written `running`, then exactly once to a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: ExecutionId,
    pub job_id: String,
    pub job_name: String,
    pub org_id: Option<String>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Milliseconds, `finished_at - started_at`.
    pub duration_ms: Option<i64>,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Queue entry that caused this run, if it came through the queue.
    #[serde(default)]
    pub queued_job_id: Option<QueuedJobId>,
}

impl JobExecution {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl Record for JobExecution {
    const KIND: &'static str = kinds::JOB_EXECUTIONS;

    fn key(&self) -> String {
        self.id.to_string()
    }
}

/// Newest first: by `started_at`, then by id (v7 ids are time ordered).
pub fn newest_first(a: &JobExecution, b: &JobExecution) -> std::cmp::Ordering {
    b.started_at.cmp(&a.started_at).then_with(|| b.id.cmp(&a.id))
}

/// Derived aggregate over one job's executions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobExecutionStats {
    pub job_id: String,
    pub total_runs: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub timeout_count: usize,
    pub running_count: usize,
    /// Average over executions that recorded a duration.
    pub avg_duration_ms: Option<f64>,
    pub runs_with_duration: usize,
    pub total_duration_ms: i64,
    pub last_run: Option<JobExecution>,
    pub last_success: Option<JobExecution>,
    pub last_failure: Option<JobExecution>,
}

impl JobExecutionStats {
    pub fn from_executions(job_id: impl Into<String>, executions: &[JobExecution]) -> Self {
        let mut sorted: Vec<&JobExecution> = executions.iter().collect();
        sorted.sort_by(|a, b| newest_first(a, b));

        let mut stats = Self {
            job_id: job_id.into(),
            total_runs: sorted.len(),
            success_count: 0,
            failure_count: 0,
            timeout_count: 0,
            running_count: 0,
            avg_duration_ms: None,
            runs_with_duration: 0,
            total_duration_ms: 0,
            last_run: sorted.first().map(|e| (*e).clone()),
            last_success: None,
            last_failure: None,
        };

        for exec in &sorted {
            match exec.status {
                ExecutionStatus::Success => {
                    stats.success_count += 1;
                    if stats.last_success.is_none() {
                        stats.last_success = Some((*exec).clone());
                    }
                }
                ExecutionStatus::Failed | ExecutionStatus::Timeout => {
                    if exec.status == ExecutionStatus::Failed {
                        stats.failure_count += 1;
                    } else {
                        stats.timeout_count += 1;
                    }
                    if stats.last_failure.is_none() {
                        stats.last_failure = Some((*exec).clone());
                    }
                }
                ExecutionStatus::Running => stats.running_count += 1,
            }
            if let Some(d) = exec.duration_ms {
                stats.runs_with_duration += 1;
                stats.total_duration_ms += d;
            }
        }

        if stats.runs_with_duration > 0 {
            stats.avg_duration_ms = Some(stats.total_duration_ms as f64 / stats.runs_with_duration as f64);
        }

        stats
    }

    /// Runs that reached a terminal state.
    pub fn finished_runs(&self) -> usize {
        self.success_count + self.failure_count + self.timeout_count
    }

    /// success / finished runs. Executions still running are left out.
    pub fn success_rate(&self) -> Option<f64> {
        match self.finished_runs() {
            0 => None,
            finished => Some(self.success_count as f64 / finished as f64),
        }
    }

    /// Average duration excluding one run's contribution.
    pub fn avg_duration_without(&self, duration_ms: i64) -> Option<f64> {
        if self.runs_with_duration < 2 {
            return None;
        }
        Some((self.total_duration_ms - duration_ms) as f64 / (self.runs_with_duration - 1) as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn exec(status: ExecutionStatus, started_at: DateTime<Utc>, duration_ms: Option<i64>) -> JobExecution {
        JobExecution {
            id: ExecutionId::new(),
            job_id: "report".to_string(),
            job_name: "Report".to_string(),
            org_id: None,
            status,
            started_at,
            finished_at: duration_ms.map(|d| started_at + Duration::milliseconds(d)),
            duration_ms,
            input: None,
            output: None,
            error: None,
            queued_job_id: None,
        }
    }

    #[test]
    fn aggregates_counts_and_last_references() {
        let t0 = Utc::now();
        let runs = vec![
            exec(ExecutionStatus::Success, t0, Some(100)),
            exec(ExecutionStatus::Failed, t0 + Duration::seconds(1), Some(300)),
            exec(ExecutionStatus::Timeout, t0 + Duration::seconds(2), None),
            exec(ExecutionStatus::Running, t0 + Duration::seconds(3), None),
        ];

        let stats = JobExecutionStats::from_executions("report", &runs);

        assert_eq!(stats.total_runs, 4);
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.timeout_count, 1);
        assert_eq!(stats.running_count, 1);
        // Only runs with a duration count towards the average.
        assert_eq!(stats.avg_duration_ms, Some(200.0));
        assert_eq!(stats.last_run.as_ref().unwrap().id, runs[3].id);
        assert_eq!(stats.last_success.as_ref().unwrap().id, runs[0].id);
        assert_eq!(stats.last_failure.as_ref().unwrap().id, runs[2].id);
    }

    #[test]
    fn success_rate_ignores_runs_in_flight() {
        let t0 = Utc::now();
        let runs = vec![
            exec(ExecutionStatus::Success, t0, Some(10)),
            exec(ExecutionStatus::Success, t0, Some(10)),
            exec(ExecutionStatus::Success, t0, Some(10)),
            exec(ExecutionStatus::Timeout, t0, Some(10)),
            exec(ExecutionStatus::Running, t0, None),
            exec(ExecutionStatus::Running, t0, None),
        ];
        let stats = JobExecutionStats::from_executions("report", &runs);

        assert_eq!(stats.finished_runs(), 4);
        assert_eq!(stats.success_rate(), Some(0.75));

        let only_running = JobExecutionStats::from_executions("report", &runs[4..]);
        assert_eq!(only_running.success_rate(), None);
    }

    #[test]
    fn empty_history_has_no_rates() {
        let stats = JobExecutionStats::from_executions("none", &[]);
        assert_eq!(stats.success_rate(), None);
        assert_eq!(stats.avg_duration_ms, None);
    }

    #[test]
    fn historical_average_excludes_current_run() {
        let t0 = Utc::now();
        let runs = vec![
            exec(ExecutionStatus::Success, t0, Some(100)),
            exec(ExecutionStatus::Success, t0, Some(100)),
            exec(ExecutionStatus::Success, t0, Some(400)),
        ];
        let stats = JobExecutionStats::from_executions("report", &runs);

        assert_eq!(stats.avg_duration_without(400), Some(100.0));
    }
}
