//! Dispatch selection over a snapshot of the queue.
//!
//! Pure functions; the queue manager calls them while holding its operation
//! lock so the snapshot cannot change between selection and the transition
//! to `running`.

use std::collections::{HashMap, HashSet};

use jobwarden_core::QueuedJobId;

use super::types::{QueuedJob, QueuedJobStatus};

/// Dependency readiness of a waiting job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyState {
    /// Every dependency completed.
    Satisfied,
    /// At least one dependency has not finished yet.
    Waiting,
    /// A dependency ended failed/cancelled (or disappeared).
    Broken(QueuedJobId),
}

pub fn dependency_state(job: &QueuedJob, jobs: &HashMap<QueuedJobId, QueuedJob>) -> DependencyState {
    let mut waiting = false;
    for dep in &job.depends_on {
        match jobs.get(dep).map(|d| d.status) {
            Some(QueuedJobStatus::Completed) => {}
            Some(QueuedJobStatus::Failed | QueuedJobStatus::Cancelled) | None => {
                return DependencyState::Broken(*dep);
            }
            Some(_) => waiting = true,
        }
    }
    if waiting {
        DependencyState::Waiting
    } else {
        DependencyState::Satisfied
    }
}

/// Pick the next job to dispatch, or `None` when nothing is eligible or all
/// slots are busy.
///
/// Eligible: `ready`, all dependencies completed, and no `running` job shares
/// its concurrency key. Ordered by priority rank, then `enqueued_at`, then id.
pub fn select_next(jobs: &HashMap<QueuedJobId, QueuedJob>, max_concurrency: usize) -> Option<QueuedJobId> {
    let running: Vec<&QueuedJob> = jobs
        .values()
        .filter(|j| j.status == QueuedJobStatus::Running)
        .collect();
    if running.len() >= max_concurrency {
        return None;
    }

    let busy_keys: HashSet<&str> = running.iter().filter_map(|j| j.concurrency_key.as_deref()).collect();

    jobs.values()
        .filter(|j| j.status == QueuedJobStatus::Ready)
        .filter(|j| j.concurrency_key.as_deref().is_none_or(|k| !busy_keys.contains(k)))
        .filter(|j| dependency_state(j, jobs) == DependencyState::Satisfied)
        .min_by(|a, b| {
            a.priority
                .rank()
                .cmp(&b.priority.rank())
                .then_with(|| a.enqueued_at.cmp(&b.enqueued_at))
                .then_with(|| a.id.cmp(&b.id))
        })
        .map(|j| j.id)
}

/// All waiting jobs that (transitively) depend on `root`.
pub fn waiting_dependents(root: QueuedJobId, jobs: &HashMap<QueuedJobId, QueuedJob>) -> Vec<QueuedJobId> {
    let mut found = Vec::new();
    let mut seen = HashSet::new();
    let mut frontier = vec![root];

    while let Some(current) = frontier.pop() {
        for job in jobs.values() {
            if job.status.is_waiting() && job.depends_on.contains(&current) && seen.insert(job.id) {
                found.push(job.id);
                frontier.push(job.id);
            }
        }
    }
    found
}
