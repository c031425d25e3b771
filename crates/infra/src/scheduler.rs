//! Batch fan-out: one job and one queue message per ticker.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use serde::Serialize;
use tracing::{info, warn};

use reportflow_core::{Batch, BatchId, BatchPhase, Job, JobId, Ticker};

use crate::jobs::{JobStatusStore, JobStoreError};
use crate::queue::{JobAction, MessageQueue, QueueMessage};

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("no tickers to schedule")]
    EmptyBatch,
    #[error("ticker {0} listed more than once")]
    DuplicateTicker(Ticker),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// A job whose queue message could not be sent. The job stays `pending` with
/// no `enqueued_at`; `Operator::requeue` repairs it.
#[derive(Debug, Clone, Serialize)]
pub struct EnqueueFailure {
    pub job_id: JobId,
    pub ticker: Ticker,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReceipt {
    pub batch_id: BatchId,
    pub batch_date: NaiveDate,
    pub total_jobs: u32,
    pub jobs: Vec<ScheduledJob>,
    pub enqueue_failures: Vec<EnqueueFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledJob {
    pub job_id: JobId,
    pub ticker: Ticker,
}

pub struct Scheduler {
    store: Arc<dyn JobStatusStore>,
    queue: Arc<dyn MessageQueue>,
    job_ttl: Duration,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStatusStore>, queue: Arc<dyn MessageQueue>, job_ttl: Duration) -> Self {
        Self {
            store,
            queue,
            job_ttl,
        }
    }

    /// Fan out a daily batch. Returns as soon as every message was handed to
    /// the queue; it does not wait for any job to finish.
    pub fn schedule(&self, tickers: &[Ticker], date: NaiveDate) -> Result<BatchReceipt, ScheduleError> {
        self.fan_out(tickers, date, JobAction::Analyze)
    }

    /// Same fan-out, but workers recompute even when a cached result exists.
    pub fn schedule_refresh(
        &self,
        tickers: &[Ticker],
        date: NaiveDate,
    ) -> Result<BatchReceipt, ScheduleError> {
        self.fan_out(tickers, date, JobAction::Refresh)
    }

    fn fan_out(
        &self,
        tickers: &[Ticker],
        date: NaiveDate,
        action: JobAction,
    ) -> Result<BatchReceipt, ScheduleError> {
        if tickers.is_empty() {
            return Err(ScheduleError::EmptyBatch);
        }
        let mut seen = HashSet::with_capacity(tickers.len());
        if let Some(dup) = tickers.iter().find(|t| !seen.insert(*t)) {
            return Err(ScheduleError::DuplicateTicker(dup.clone()));
        }

        let now = Utc::now();
        let jobs: Vec<Job> = tickers
            .iter()
            .map(|t| Job::new(t.clone(), date, now, self.job_ttl).with_action(action))
            .collect();
        let batch = Batch::new(date, jobs.len() as u32, now);
        let batch_id = batch.batch_id;

        self.store.create_batch(batch, jobs.clone())?;

        let mut enqueue_failures = Vec::new();
        for job in &jobs {
            let message = QueueMessage::for_job(job, Utc::now());
            match self.queue.send(message) {
                Ok(()) => {
                    if let Err(e) = self.store.mark_enqueued(job.job_id, Utc::now()) {
                        warn!(job_id = %job.job_id, ticker = %job.ticker, error = %e, "failed to stamp enqueued_at");
                    }
                }
                Err(e) => {
                    warn!(
                        job_id = %job.job_id,
                        ticker = %job.ticker,
                        batch_date = %date,
                        error = %e,
                        "enqueue failed; job left pending for requeue"
                    );
                    enqueue_failures.push(EnqueueFailure {
                        job_id: job.job_id,
                        ticker: job.ticker.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if let Err(e) = self.store.set_phase(date, BatchPhase::FannedOut) {
            warn!(batch_date = %date, error = %e, "failed to record fan-out phase");
        }

        info!(
            batch_date = %date,
            batch_id = %batch_id,
            total_jobs = jobs.len(),
            action = ?action,
            enqueue_failures = enqueue_failures.len(),
            "batch fanned out"
        );

        Ok(BatchReceipt {
            batch_id,
            batch_date: date,
            total_jobs: jobs.len() as u32,
            jobs: jobs
                .into_iter()
                .map(|j| ScheduledJob {
                    job_id: j.job_id,
                    ticker: j.ticker,
                })
                .collect(),
            enqueue_failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::InMemoryJobStatusStore;
    use crate::queue::{
        Delivery, InMemoryQueue, QueueError, QueueStats, ReceiptHandle,
    };
    use reportflow_core::JobStatus;

    /// Refuses messages for one ticker, delegates everything else.
    struct FlakySend {
        inner: InMemoryQueue,
        refuse: Ticker,
    }

    impl MessageQueue for FlakySend {
        fn send(&self, message: QueueMessage) -> Result<(), QueueError> {
            if message.ticker == self.refuse {
                return Err(QueueError::Backend("broker unavailable".into()));
            }
            self.inner.send(message)
        }
        fn receive(&self) -> Result<Option<Delivery>, QueueError> {
            self.inner.receive()
        }
        fn ack(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
            self.inner.ack(receipt)
        }
        fn nack(&self, receipt: &ReceiptHandle, delay: std::time::Duration) -> Result<(), QueueError> {
            self.inner.nack(receipt, delay)
        }
        fn stats(&self) -> Result<QueueStats, QueueError> {
            self.inner.stats()
        }
    }

    fn tickers(symbols: &[&str]) -> Vec<Ticker> {
        symbols.iter().map(|s| Ticker::parse(s).unwrap()).collect()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 8, 5).unwrap()
    }

    #[test]
    fn fans_out_one_pending_job_and_message_per_ticker() {
        let store = InMemoryJobStatusStore::arc();
        let queue = Arc::new(InMemoryQueue::default());
        let scheduler = Scheduler::new(store.clone(), queue.clone(), Duration::days(7));

        let receipt = scheduler.schedule(&tickers(&["A", "B", "C"]), date()).unwrap();

        assert_eq!(receipt.total_jobs, 3);
        assert!(receipt.enqueue_failures.is_empty());
        assert_eq!(queue.stats().unwrap().visible, 3);

        let jobs = store.list_by_date(date()).unwrap();
        assert_eq!(jobs.len(), 3);
        assert!(jobs.iter().all(|j| j.status == JobStatus::Pending && j.attempts == 0));
        assert!(jobs.iter().all(|j| j.enqueued_at.is_some()));
        assert_eq!(store.batch(date()).unwrap().unwrap().phase, BatchPhase::FannedOut);
    }

    #[test]
    fn empty_and_duplicate_inputs_create_nothing() {
        let store = InMemoryJobStatusStore::arc();
        let queue = Arc::new(InMemoryQueue::default());
        let scheduler = Scheduler::new(store.clone(), queue.clone(), Duration::days(7));

        assert!(matches!(scheduler.schedule(&[], date()), Err(ScheduleError::EmptyBatch)));
        assert!(matches!(
            scheduler.schedule(&tickers(&["A", "B", "A"]), date()),
            Err(ScheduleError::DuplicateTicker(t)) if t.as_str() == "A"
        ));

        assert!(store.list_by_date(date()).unwrap().is_empty());
        assert!(store.batch(date()).unwrap().is_none());
        assert_eq!(queue.stats().unwrap().outstanding(), 0);
    }

    #[test]
    fn rescheduling_a_date_conflicts() {
        let store = InMemoryJobStatusStore::arc();
        let queue = Arc::new(InMemoryQueue::default());
        let scheduler = Scheduler::new(store.clone(), queue.clone(), Duration::days(7));

        scheduler.schedule(&tickers(&["A"]), date()).unwrap();
        let err = scheduler.schedule(&tickers(&["B"]), date()).unwrap_err();

        assert!(matches!(err, ScheduleError::Store(JobStoreError::Conflict(_))));
        assert_eq!(store.list_by_date(date()).unwrap().len(), 1);
        assert_eq!(queue.stats().unwrap().visible, 1);
    }

    #[test]
    fn enqueue_failure_leaves_job_pending_without_enqueued_at() {
        let store = InMemoryJobStatusStore::arc();
        let queue = Arc::new(FlakySend {
            inner: InMemoryQueue::default(),
            refuse: Ticker::parse("B").unwrap(),
        });
        let scheduler = Scheduler::new(store.clone(), queue.clone(), Duration::days(7));

        let receipt = scheduler.schedule(&tickers(&["A", "B"]), date()).unwrap();

        assert_eq!(receipt.enqueue_failures.len(), 1);
        let failed = store.get(receipt.enqueue_failures[0].job_id).unwrap().unwrap();
        assert_eq!(failed.ticker.as_str(), "B");
        assert_eq!(failed.status, JobStatus::Pending);
        assert!(failed.enqueued_at.is_none());
        assert_eq!(queue.stats().unwrap().visible, 1);
    }

    #[test]
    fn refresh_messages_carry_the_refresh_action() {
        let store = InMemoryJobStatusStore::arc();
        let queue = Arc::new(InMemoryQueue::default());
        let scheduler = Scheduler::new(store, queue.clone(), Duration::days(7));

        scheduler.schedule_refresh(&tickers(&["A"]), date()).unwrap();
        let delivery = queue.receive().unwrap().unwrap();
        assert_eq!(delivery.message.action, JobAction::Refresh);
    }
}
