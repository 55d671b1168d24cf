//! Dead-letter store: queued jobs that exhausted their attempts.
//!
//! Records are written once by the queue manager and only removed by an
//! operator retry or archival.

use chrono::{DateTime, Utc};
use tracing::info;

use jobwarden_core::{DeadLetterId, QueuedJobId};

use super::types::{DeadLetterJob, JobSpec, QueuedJob};
use crate::store::{RecordStore, SharedStore, StoreError};

#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub job_id: Option<String>,
    pub can_retry: Option<bool>,
    pub limit: Option<usize>,
}

impl DeadLetterFilter {
    fn matches(&self, record: &DeadLetterJob) -> bool {
        self.job_id.as_ref().is_none_or(|j| &record.job_id == j)
            && self.can_retry.is_none_or(|c| record.can_retry == c)
    }
}

/// Everything the queue knows when it parks a job.
#[derive(Debug, Clone)]
pub struct NewDeadLetter<'a> {
    pub job: &'a QueuedJob,
    pub job_name: String,
    pub failure_reason: String,
    pub can_retry: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError<E> {
    #[error("dead letter not found: {0}")]
    NotFound(DeadLetterId),
    #[error("dead letter {0} cannot be retried")]
    NotRetryable(DeadLetterId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("re-enqueue failed: {0}")]
    Enqueue(E),
}

#[derive(Clone)]
pub struct DeadLetterStore {
    store: SharedStore,
}

impl DeadLetterStore {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub(crate) fn record(&self, new: NewDeadLetter<'_>) -> Result<DeadLetterJob, StoreError> {
        let job = new.job;
        let record = DeadLetterJob {
            id: DeadLetterId::new(),
            original_job_id: job.id,
            job_id: job.job_id.clone(),
            job_name: new.job_name,
            failure_reason: new.failure_reason,
            attempts: job.attempt,
            moved_to_dlq_at: new.at,
            retry_count: job.dead_letter_retries,
            error: job.error.clone(),
            can_retry: new.can_retry,
            spec: job.to_spec(),
        };
        self.store.save(&record)?;
        Ok(record)
    }

    pub fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetterJob>, StoreError> {
        self.store.load(&id.to_string())
    }

    /// Newest first.
    pub fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterJob>, StoreError> {
        let mut records: Vec<DeadLetterJob> = self.store.load_where(|r: &DeadLetterJob| filter.matches(r))?;
        records.sort_by(|a, b| b.moved_to_dlq_at.cmp(&a.moved_to_dlq_at).then_with(|| b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        Ok(self.store.load_all::<DeadLetterJob>()?.len())
    }

    /// The most recently dead-lettered job.
    pub fn latest(&self) -> Result<Option<DeadLetterJob>, StoreError> {
        Ok(self
            .list(&DeadLetterFilter {
                limit: Some(1),
                ..DeadLetterFilter::default()
            })?
            .into_iter()
            .next())
    }

    /// Whether a dead letter already exists for this queue entry.
    pub fn exists_for(&self, queued_job_id: QueuedJobId) -> Result<bool, StoreError> {
        Ok(!self
            .store
            .load_where(|r: &DeadLetterJob| r.original_job_id == queued_job_id)?
            .is_empty())
    }

    /// Remove a record without re-enqueueing it.
    pub fn archive(&self, id: DeadLetterId) -> Result<bool, StoreError> {
        let removed = self.store.delete::<DeadLetterJob>(&id.to_string())?;
        if removed {
            info!(dead_letter_id = %id, "dead letter archived");
        }
        Ok(removed)
    }

    /// Re-enqueue through `enqueue`, then drop the record.
    ///
    /// `enqueue` receives the original spec and the lineage retry count. The
    /// record is only removed if it succeeds.
    pub fn retry<E>(
        &self,
        id: DeadLetterId,
        enqueue: impl FnOnce(JobSpec, u32) -> Result<QueuedJob, E>,
    ) -> Result<QueuedJob, DeadLetterError<E>> {
        let record = self.get(id)?.ok_or(DeadLetterError::NotFound(id))?;
        if !record.can_retry {
            return Err(DeadLetterError::NotRetryable(id));
        }

        let job = enqueue(record.spec.clone(), record.retry_count + 1).map_err(DeadLetterError::Enqueue)?;
        self.store.delete::<DeadLetterJob>(&id.to_string())?;

        info!(
            dead_letter_id = %id,
            job_id = %record.job_id,
            queued_job_id = %job.id,
            retry_count = record.retry_count + 1,
            "dead letter re-enqueued"
        );
        Ok(job)
    }
}
