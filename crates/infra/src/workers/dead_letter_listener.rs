//! Records dead-lettered messages as failed jobs.

use std::io;
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use reportflow_core::FailOutcome;

use super::{WorkerError, WorkerHandle, wait_or_shutdown};
use crate::jobs::{JobStatusStore, JobStoreError};
use crate::queue::{DeadLetter, DeadLetterQueue};

/// Tally of one listener pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ListenerReport {
    /// Jobs moved to `failed`.
    pub failed: usize,
    /// Already `failed`; notice was a duplicate.
    pub already_failed: usize,
    /// The job completed first; the DLQ entry was removed.
    pub cleared: usize,
    /// No live job for the entry.
    pub orphaned: usize,
}

impl ListenerReport {
    pub fn seen(&self) -> usize {
        self.failed + self.already_failed + self.cleared + self.orphaned
    }
}

/// Consumes unobserved DLQ entries and fails the matching jobs with
/// compare-and-set, so a completion that wins the race is never undone.
pub struct DeadLetterListener {
    store: Arc<dyn JobStatusStore>,
    dead_letters: Arc<dyn DeadLetterQueue>,
    batch_size: usize,
}

impl DeadLetterListener {
    pub fn new(store: Arc<dyn JobStatusStore>, dead_letters: Arc<dyn DeadLetterQueue>) -> Self {
        Self {
            store,
            dead_letters,
            batch_size: 100,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Handle every currently unobserved entry (up to the batch size).
    pub fn poll_once(&self) -> Result<ListenerReport, WorkerError> {
        let mut report = ListenerReport::default();
        for entry in self.dead_letters.poll_unobserved(self.batch_size)? {
            self.handle(&entry, &mut report)?;
        }
        if report.seen() > 0 {
            debug!(?report, "dead-letter pass finished");
        }
        Ok(report)
    }

    fn handle(&self, entry: &DeadLetter, report: &mut ListenerReport) -> Result<(), WorkerError> {
        let msg = &entry.message;
        let last_error = self
            .store
            .get(msg.job_id)?
            .and_then(|job| job.last_error)
            .unwrap_or_else(|| "no error recorded".to_string());
        let reason = format!(
            "dead-lettered after {} receives: {last_error}",
            entry.receive_count
        );

        match self.store.fail(msg.job_id, &reason, Utc::now()) {
            Ok(FailOutcome::Failed) => {
                warn!(
                    job_id = %msg.job_id,
                    ticker = %msg.ticker,
                    batch_date = %msg.date,
                    receive_count = entry.receive_count,
                    "job failed: message dead-lettered"
                );
                report.failed += 1;
            }
            Ok(FailOutcome::AlreadyFailed) => report.already_failed += 1,
            Ok(FailOutcome::AlreadyCompleted) => {
                self.dead_letters.remove_for_job(msg.job_id)?;
                info!(job_id = %msg.job_id, "dead letter for completed job removed");
                report.cleared += 1;
                return Ok(());
            }
            Err(JobStoreError::NotFound(_)) => {
                debug!(job_id = %msg.job_id, "dead letter for expired job");
                report.orphaned += 1;
            }
            Err(e) => return Err(e.into()),
        }

        self.dead_letters.mark_observed(msg.message_id)?;
        Ok(())
    }

    /// Poll on a background thread every `interval` until shutdown.
    pub fn spawn(self, interval: Duration) -> io::Result<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name("dead-letter-listener".to_string())
            .spawn(move || listener_loop(&self, interval, shutdown_rx))?;
        Ok(WorkerHandle::new(shutdown_tx, join))
    }
}

fn listener_loop(listener: &DeadLetterListener, interval: Duration, shutdown_rx: mpsc::Receiver<()>) {
    info!("dead-letter listener started");
    loop {
        if let Err(e) = listener.poll_once() {
            error!(error = %e, "dead-letter listener pass failed");
        }
        if wait_or_shutdown(&shutdown_rx, interval) {
            break;
        }
    }
    info!("dead-letter listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::InMemoryJobStatusStore;
    use crate::queue::{InMemoryQueue, MessageQueue, QueueConfig, QueueMessage};
    use chrono::{Duration as ChronoDuration, NaiveDate};
    use reportflow_core::{Batch, Job, JobStatus, Ticker};

    fn setup() -> (Arc<InMemoryJobStatusStore>, Arc<InMemoryQueue>, Job) {
        let store = InMemoryJobStatusStore::arc();
        let queue = InMemoryQueue::arc(QueueConfig {
            visibility_timeout: Duration::from_secs(60),
            max_receive_count: 1,
        });
        let date = NaiveDate::from_ymd_opt(2024, 10, 1).unwrap();
        let job = Job::new(Ticker::parse("BAD").unwrap(), date, Utc::now(), ChronoDuration::days(1));
        store
            .create_batch(Batch::new(date, 1, Utc::now()), vec![job.clone()])
            .unwrap();
        queue
            .send(QueueMessage::for_job(&job, Utc::now()))
            .unwrap();

        // One failed attempt, then the next receive dead-letters it.
        let d = queue.receive().unwrap().unwrap();
        store.begin_attempt(job.job_id, Utc::now()).unwrap();
        store.record_error(job.job_id, "boom", Utc::now()).unwrap();
        queue.nack(&d.receipt, Duration::ZERO).unwrap();
        assert!(queue.receive().unwrap().is_none());

        (store, queue, job)
    }

    #[test]
    fn dead_letter_fails_the_job_once() {
        let (store, queue, job) = setup();
        let listener = DeadLetterListener::new(store.clone(), queue.clone());

        let first = listener.poll_once().unwrap();
        assert_eq!(first.failed, 1);
        let failed = store.get(job.job_id).unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("dead-lettered after 1 receives: boom"));

        // Observed entries are not handled again but stay visible to operators.
        assert_eq!(listener.poll_once().unwrap().seen(), 0);
        assert_eq!(queue.list(None).unwrap().len(), 1);
    }

    #[test]
    fn completed_job_wins_and_dead_letter_is_removed() {
        let (store, queue, job) = setup();
        store.complete(job.job_id, Utc::now()).unwrap();

        let report = DeadLetterListener::new(store.clone(), queue.clone())
            .poll_once()
            .unwrap();

        assert_eq!(report.cleared, 1);
        assert_eq!(store.get(job.job_id).unwrap().unwrap().status, JobStatus::Completed);
        assert!(queue.list(None).unwrap().is_empty());
    }

    #[test]
    fn background_listener_stops_on_shutdown() {
        let (store, queue, job) = setup();
        let handle = DeadLetterListener::new(store.clone(), queue)
            .spawn(Duration::from_millis(10))
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while store.get(job.job_id).unwrap().unwrap().status != JobStatus::Failed
            && std::time::Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(10));
        }
        handle.shutdown();

        assert_eq!(store.get(job.job_id).unwrap().unwrap().status, JobStatus::Failed);
    }
}
