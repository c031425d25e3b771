//! Operator entry points: inspection and manual repair.
//!
//! Nothing here runs automatically; there is no reconciliation sweep.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use tracing::info;

use reportflow_core::{Batch, Job, JobId, JobStatus, MessageId};

use crate::jobs::{JobStatusStore, JobStoreError, StatusCounts};
use crate::queue::{DeadLetter, DeadLetterQueue, MessageQueue, QueueError, QueueMessage, QueueStats};

#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("no batch scheduled for {0}")]
    BatchNotFound(NaiveDate),
    #[error("job {job_id} is {status}, only pending jobs can be requeued")]
    NotPending { job_id: JobId, status: JobStatus },
    #[error("job {job_id} is still within its grace period ({remaining_secs}s left)")]
    WithinGrace { job_id: JobId, remaining_secs: i64 },
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone, Serialize)]
pub struct RequeueReceipt {
    pub job_id: JobId,
    pub message_id: MessageId,
    pub enqueued_at: DateTime<Utc>,
}

/// Pending jobs past the grace period, split by likely cause.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StuckPending {
    /// The scheduler never managed to enqueue a message.
    pub never_enqueued: Vec<Job>,
    /// A message was enqueued but no worker has picked it up.
    pub awaiting_delivery: Vec<Job>,
}

impl StuckPending {
    pub fn len(&self) -> usize {
        self.never_enqueued.len() + self.awaiting_delivery.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchStatus {
    pub batch: Batch,
    pub counts: StatusCounts,
    pub dead_lettered: usize,
    pub stuck_pending: usize,
    /// Whole-queue depth, not just this batch.
    pub queue: QueueStats,
}

pub struct Operator {
    store: Arc<dyn JobStatusStore>,
    queue: Arc<dyn MessageQueue>,
    dead_letters: Arc<dyn DeadLetterQueue>,
    pending_grace: Duration,
}

impl Operator {
    pub fn new(
        store: Arc<dyn JobStatusStore>,
        queue: Arc<dyn MessageQueue>,
        dead_letters: Arc<dyn DeadLetterQueue>,
        pending_grace: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            dead_letters,
            pending_grace,
        }
    }

    pub fn job(&self, job_id: JobId) -> Result<Job, OperatorError> {
        self.store
            .get(job_id)?
            .ok_or(OperatorError::JobNotFound(job_id))
    }

    /// Re-create the queue message for a job stuck `pending`.
    ///
    /// The grace period runs from the later of creation and the last enqueue,
    /// so a requeue cannot be repeated until another full period has passed.
    pub fn requeue(&self, job_id: JobId) -> Result<RequeueReceipt, OperatorError> {
        let job = self.job(job_id)?;
        if job.status != JobStatus::Pending {
            return Err(OperatorError::NotPending {
                job_id,
                status: job.status,
            });
        }

        let now = Utc::now();
        let since = job.enqueued_at.unwrap_or(job.created_at).max(job.created_at);
        let eligible_at = since + self.pending_grace;
        if now < eligible_at {
            return Err(OperatorError::WithinGrace {
                job_id,
                remaining_secs: (eligible_at - now).num_seconds().max(1),
            });
        }

        let message = QueueMessage::for_job(&job, now);
        let message_id = message.message_id;
        self.queue.send(message)?;
        self.store.mark_enqueued(job_id, now)?;

        info!(
            job_id = %job_id,
            ticker = %job.ticker,
            batch_date = %job.date,
            never_enqueued = job.enqueued_at.is_none(),
            "job requeued by operator"
        );
        Ok(RequeueReceipt {
            job_id,
            message_id,
            enqueued_at: now,
        })
    }

    /// Jobs with a dead-lettered message for the date.
    pub fn inspect_dlq(&self, batch_date: NaiveDate) -> Result<Vec<JobId>, OperatorError> {
        let mut ids: Vec<JobId> = self
            .dead_letters
            .list(Some(batch_date))?
            .into_iter()
            .map(|d| d.message.job_id)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    pub fn dead_letters(&self, batch_date: NaiveDate) -> Result<Vec<DeadLetter>, OperatorError> {
        Ok(self.dead_letters.list(Some(batch_date))?)
    }

    pub fn stuck_pending(&self, batch_date: NaiveDate) -> Result<StuckPending, OperatorError> {
        let cutoff = Utc::now() - self.pending_grace;
        let (never_enqueued, awaiting_delivery) = self
            .store
            .stuck_pending(batch_date, cutoff)?
            .into_iter()
            .filter(|j| j.enqueued_at.is_none_or(|at| at < cutoff))
            .partition(|j| j.enqueued_at.is_none());
        Ok(StuckPending {
            never_enqueued,
            awaiting_delivery,
        })
    }

    pub fn batch_status(&self, batch_date: NaiveDate) -> Result<BatchStatus, OperatorError> {
        let batch = self
            .store
            .batch(batch_date)?
            .ok_or(OperatorError::BatchNotFound(batch_date))?;
        Ok(BatchStatus {
            batch,
            counts: self.store.counts(batch_date)?,
            dead_lettered: self.dead_letters.list(Some(batch_date))?.len(),
            stuck_pending: self.stuck_pending(batch_date)?.len(),
            queue: self.queue.stats()?,
        })
    }

    pub fn purge_expired(&self) -> Result<usize, OperatorError> {
        let removed = self.store.purge_expired(Utc::now())?;
        if removed > 0 {
            info!(removed, "expired jobs purged");
        }
        Ok(removed)
    }
}
