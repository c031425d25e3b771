//! Report worker: receive a job message, compute (or reuse) the report, and
//! record the outcome.

use std::io;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use reportflow_core::{CompleteOutcome, JobId, JobStatus, ResultCacheEntry, ResultKey};

use super::{WorkerHandle, wait_or_shutdown};
use crate::cache::{CacheError, ResultCache};
use crate::collaborators::ReportComputer;
use crate::jobs::{AttemptOutcome, JobStatusStore, JobStoreError};
use crate::queue::{
    DeadLetterQueue, Delivery, JobAction, MessageQueue, QueueError, RetryPolicy,
};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Sleep between receives when the queue is empty.
    pub poll_interval: Duration,
    /// Thread name prefix for logging.
    pub name: String,
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_millis(100),
            name: "report-worker".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// A cached result existed; the job was completed without recomputing.
    CacheHit,
    /// The report was computed and cached; the job is completed.
    Computed,
    /// Computation failed; the message was released for redelivery.
    Retrying { receive_count: u32, delay: Duration },
    /// The job was already terminal; the duplicate delivery was dropped.
    AlreadyTerminal(JobStatus),
    /// No live job for the message (expired or never created).
    Orphaned,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Processes one message at a time. Cheap to share across threads.
pub struct Worker {
    store: Arc<dyn JobStatusStore>,
    queue: Arc<dyn MessageQueue>,
    dead_letters: Arc<dyn DeadLetterQueue>,
    cache: Arc<dyn ResultCache>,
    computer: Arc<dyn ReportComputer>,
    retry: RetryPolicy,
}

impl Worker {
    pub fn new(
        store: Arc<dyn JobStatusStore>,
        queue: Arc<dyn MessageQueue>,
        dead_letters: Arc<dyn DeadLetterQueue>,
        cache: Arc<dyn ResultCache>,
        computer: Arc<dyn ReportComputer>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            dead_letters,
            cache,
            computer,
            retry,
        }
    }

    /// Receive and process one message. `Ok(None)` when the queue is empty.
    pub fn process_next(&self) -> Result<Option<ProcessOutcome>, WorkerError> {
        match self.queue.receive()? {
            Some(delivery) => self.process(&delivery).map(Some),
            None => Ok(None),
        }
    }

    /// Process until the queue has nothing visible. Used by tests and
    /// one-shot runs.
    pub fn drain(&self) -> Result<Vec<ProcessOutcome>, WorkerError> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.process_next()? {
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    pub fn process(&self, delivery: &Delivery) -> Result<ProcessOutcome, WorkerError> {
        let msg = &delivery.message;
        let key = ResultKey::new(msg.ticker.clone(), msg.date);

        match msg.action {
            JobAction::Analyze => {
                if self.cache.get(&key)?.is_some() {
                    debug!(job_id = %msg.job_id, ticker = %msg.ticker, "cache hit; skipping computation");
                    let outcome = match self.finish(msg.job_id)? {
                        Some(_) => ProcessOutcome::CacheHit,
                        None => ProcessOutcome::Orphaned,
                    };
                    self.ack(delivery)?;
                    return Ok(outcome);
                }
            }
            JobAction::Refresh => {}
        }

        match self.store.begin_attempt(msg.job_id, Utc::now())? {
            AttemptOutcome::Started(job) => {
                debug!(
                    job_id = %msg.job_id,
                    ticker = %msg.ticker,
                    attempts = job.attempts,
                    receive_count = delivery.receive_count,
                    "processing job"
                );
            }
            AttemptOutcome::AlreadyTerminal(status) => {
                debug!(job_id = %msg.job_id, status = %status, "duplicate delivery for terminal job");
                self.ack(delivery)?;
                return Ok(ProcessOutcome::AlreadyTerminal(status));
            }
            AttemptOutcome::Missing => {
                warn!(job_id = %msg.job_id, ticker = %msg.ticker, "no live job for message; dropping");
                self.ack(delivery)?;
                return Ok(ProcessOutcome::Orphaned);
            }
        }

        match self.computer.compute_report(&msg.ticker, msg.date) {
            Ok(payload) => {
                let entry = ResultCacheEntry::new(msg.ticker.clone(), msg.date, payload, Utc::now());
                self.cache.upsert(entry)?;
                let outcome = match self.finish(msg.job_id)? {
                    Some(_) => ProcessOutcome::Computed,
                    None => ProcessOutcome::Orphaned,
                };
                self.ack(delivery)?;
                Ok(outcome)
            }
            Err(err) => {
                if let Err(e) = self.store.record_error(msg.job_id, &err.to_string(), Utc::now()) {
                    warn!(job_id = %msg.job_id, error = %e, "failed to record processing error");
                }

                // No ack: redelivery is the retry, the queue dead-letters at the threshold.
                let delay = self.retry.delay_for_attempt(delivery.receive_count);
                warn!(
                    job_id = %msg.job_id,
                    ticker = %msg.ticker,
                    receive_count = delivery.receive_count,
                    max_receive_count = self.retry.max_receive_count,
                    transient = err.is_transient(),
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "report computation failed"
                );
                self.release(delivery, delay)?;
                Ok(ProcessOutcome::Retrying {
                    receive_count: delivery.receive_count,
                    delay,
                })
            }
        }
    }

    /// Mark the job completed. A late success that overrides a dead-letter
    /// failure also removes the job's DLQ entry. `None` if the job is gone.
    fn finish(&self, job_id: JobId) -> Result<Option<CompleteOutcome>, WorkerError> {
        let outcome = match self.store.complete(job_id, Utc::now()) {
            Ok(outcome) => outcome,
            Err(JobStoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if outcome == CompleteOutcome::OverrodeFailure {
            let removed = self.dead_letters.remove_for_job(job_id)?;
            info!(job_id = %job_id, removed, "late success overrode dead-letter failure");
        }
        Ok(Some(outcome))
    }

    fn release(&self, delivery: &Delivery, delay: Duration) -> Result<(), WorkerError> {
        match self.queue.nack(&delivery.receipt, delay) {
            Ok(()) => Ok(()),
            // The visibility window ran out mid-computation; the message is
            // already back in circulation under a newer receipt.
            Err(QueueError::StaleReceipt(_)) => {
                debug!(job_id = %delivery.message.job_id, "receipt superseded before release");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), WorkerError> {
        match self.queue.ack(&delivery.receipt) {
            Ok(()) => Ok(()),
            // Another worker owns the message now; it will see the terminal job.
            Err(QueueError::StaleReceipt(_)) => {
                debug!(job_id = %delivery.message.job_id, "receipt superseded before ack");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Worker pool runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub messages_processed: u64,
    pub computed: u64,
    pub cache_hits: u64,
    pub retries: u64,
    pub duplicates: u64,
    pub orphaned: u64,
    pub errors: u64,
    pub uptime_secs: u64,
}

impl PoolStats {
    fn record(&mut self, outcome: &ProcessOutcome) {
        self.messages_processed += 1;
        match outcome {
            ProcessOutcome::CacheHit => self.cache_hits += 1,
            ProcessOutcome::Computed => self.computed += 1,
            ProcessOutcome::Retrying { .. } => self.retries += 1,
            ProcessOutcome::AlreadyTerminal(_) => self.duplicates += 1,
            ProcessOutcome::Orphaned => self.orphaned += 1,
        }
    }
}

/// Handle to a running worker pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    workers: Vec<WorkerHandle>,
    stats: Arc<Mutex<PoolStats>>,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Request graceful shutdown of every worker and wait for them.
    pub fn shutdown(self) {
        for worker in self.workers {
            worker.shutdown();
        }
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = self.stats.lock().map(|s| s.clone()).unwrap_or_default();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

/// N threads looping `receive → process` until shutdown.
pub struct WorkerPool;

impl WorkerPool {
    pub fn spawn(worker: Arc<Worker>, config: WorkerConfig) -> io::Result<WorkerPoolHandle> {
        let stats = Arc::new(Mutex::new(PoolStats::default()));
        let mut workers = Vec::with_capacity(config.workers);

        for i in 0..config.workers.max(1) {
            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
            let name = format!("{}-{i}", config.name);
            let worker = worker.clone();
            let stats = stats.clone();
            let poll_interval = config.poll_interval;

            let join = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(&name, &worker, poll_interval, shutdown_rx, &stats))?;
            workers.push(WorkerHandle::new(shutdown_tx, join));
        }

        info!(pool = %config.name, workers = workers.len(), "worker pool started");
        Ok(WorkerPoolHandle {
            workers,
            stats,
            started: Instant::now(),
        })
    }
}

fn worker_loop(
    name: &str,
    worker: &Worker,
    poll_interval: Duration,
    shutdown_rx: mpsc::Receiver<()>,
    stats: &Mutex<PoolStats>,
) {
    debug!(worker = name, "worker started");

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match worker.process_next() {
            Ok(Some(outcome)) => {
                if let Ok(mut s) = stats.lock() {
                    s.record(&outcome);
                }
            }
            Ok(None) => {
                if wait_or_shutdown(&shutdown_rx, poll_interval) {
                    break;
                }
            }
            Err(e) => {
                error!(worker = name, error = %e, "worker failed to process message");
                if let Ok(mut s) = stats.lock() {
                    s.errors += 1;
                }
                if wait_or_shutdown(&shutdown_rx, poll_interval) {
                    break;
                }
            }
        }
    }

    debug!(worker = name, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryResultCache;
    use crate::collaborators::CollaboratorError;
    use crate::jobs::InMemoryJobStatusStore;
    use crate::queue::{InMemoryQueue, QueueConfig, QueueMessage};
    use chrono::{Duration as ChronoDuration, NaiveDate};
    use reportflow_core::{Batch, Job, ReportPayload, Ticker};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Fixture {
        store: Arc<InMemoryJobStatusStore>,
        queue: Arc<InMemoryQueue>,
        cache: Arc<InMemoryResultCache>,
    }

    impl Fixture {
        fn new(max_receive_count: u32) -> Self {
            Self {
                store: InMemoryJobStatusStore::arc(),
                queue: InMemoryQueue::arc(QueueConfig {
                    visibility_timeout: Duration::from_secs(60),
                    max_receive_count,
                }),
                cache: InMemoryResultCache::arc(),
            }
        }

        fn worker(&self, computer: Arc<dyn ReportComputer>) -> Worker {
            Worker::new(
                self.store.clone(),
                self.queue.clone(),
                self.queue.clone(),
                self.cache.clone(),
                computer,
                RetryPolicy::immediate(self.queue.config().max_receive_count),
            )
        }

        fn enqueue(&self, ticker: &str, action: JobAction) -> Job {
            let date = date();
            let job = Job::new(Ticker::parse(ticker).unwrap(), date, Utc::now(), ChronoDuration::days(1))
                .with_action(action);
            self.store
                .create_batch(Batch::new(date, 1, Utc::now()), vec![job.clone()])
                .unwrap();
            self.queue
                .send(QueueMessage::for_job(&job, Utc::now()))
                .unwrap();
            job
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 9, 2).unwrap()
    }

    fn ok_computer() -> Arc<dyn ReportComputer> {
        Arc::new(|t: &Ticker, _d: NaiveDate| -> Result<ReportPayload, CollaboratorError> {
            Ok(ReportPayload(json!({ "ticker": t.as_str() })))
        })
    }

    fn failing_computer(calls: Arc<AtomicU32>) -> Arc<dyn ReportComputer> {
        Arc::new(move |_t: &Ticker, _d: NaiveDate| -> Result<ReportPayload, CollaboratorError> {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CollaboratorError::Transient("upstream timeout".into()))
        })
    }

    #[test]
    fn success_caches_result_completes_job_and_acks() {
        let fx = Fixture::new(3);
        let job = fx.enqueue("AAPL", JobAction::Analyze);

        let outcome = fx.worker(ok_computer()).process_next().unwrap();

        assert_eq!(outcome, Some(ProcessOutcome::Computed));
        let stored = fx.store.get(job.job_id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.attempts, 1);
        assert!(fx.cache.get(&ResultKey::new(job.ticker, date())).unwrap().is_some());
        assert_eq!(fx.queue.stats().unwrap().outstanding(), 0);
    }

    fn counting_computer(calls: Arc<AtomicU32>) -> Arc<dyn ReportComputer> {
        Arc::new(move |_t: &Ticker, _d: NaiveDate| -> Result<ReportPayload, CollaboratorError> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(ReportPayload(json!({ "fresh": true })))
        })
    }

    fn seed_cache(fx: &Fixture, ticker: &str) {
        fx.cache
            .upsert(ResultCacheEntry::new(
                Ticker::parse(ticker).unwrap(),
                date(),
                ReportPayload(json!({ "cached": true })),
                Utc::now() - ChronoDuration::minutes(5),
            ))
            .unwrap();
    }

    #[test]
    fn cache_hit_completes_analyze_without_computing() {
        let fx = Fixture::new(3);
        let calls = Arc::new(AtomicU32::new(0));
        seed_cache(&fx, "AAPL");
        let job = fx.enqueue("AAPL", JobAction::Analyze);

        let outcome = fx.worker(counting_computer(calls.clone())).process_next().unwrap();

        assert_eq!(outcome, Some(ProcessOutcome::CacheHit));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let stored = fx.store.get(job.job_id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.attempts, 0);
        assert_eq!(fx.queue.stats().unwrap().outstanding(), 0);
    }

    #[test]
    fn refresh_recomputes_despite_cached_result() {
        let fx = Fixture::new(3);
        let calls = Arc::new(AtomicU32::new(0));
        seed_cache(&fx, "AAPL");
        let job = fx.enqueue("AAPL", JobAction::Refresh);

        let outcome = fx.worker(counting_computer(calls.clone())).process_next().unwrap();

        assert_eq!(outcome, Some(ProcessOutcome::Computed));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let cached = fx.cache.get(&ResultKey::new(job.ticker, date())).unwrap().unwrap();
        assert_eq!(cached.report_payload, ReportPayload(json!({ "fresh": true })));
    }

    #[test]
    fn failure_releases_without_ack_and_keeps_job_processing() {
        let fx = Fixture::new(3);
        let calls = Arc::new(AtomicU32::new(0));
        let job = fx.enqueue("BAD", JobAction::Analyze);

        let outcome = fx.worker(failing_computer(calls)).process_next().unwrap();

        assert!(matches!(outcome, Some(ProcessOutcome::Retrying { receive_count: 1, .. })));
        let stored = fx.store.get(job.job_id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
        assert_eq!(stored.last_error.as_deref(), Some("transient failure: upstream timeout"));
        assert_eq!(fx.queue.stats().unwrap().visible, 1);
    }

    #[test]
    fn failure_after_visibility_expiry_is_still_recorded() {
        let fx = Fixture::new(3);
        let job = fx.enqueue("SLOW", JobAction::Analyze);
        let delivery = fx.queue.receive().unwrap().unwrap();

        // The message times out and another consumer receives it while this
        // computation is still running, so the first receipt goes stale.
        let queue = fx.queue.clone();
        let receipt = delivery.receipt.clone();
        let computer: Arc<dyn ReportComputer> = Arc::new(
            move |_t: &Ticker, _d: NaiveDate| -> Result<ReportPayload, CollaboratorError> {
                queue.nack(&receipt, Duration::ZERO).unwrap();
                queue.receive().unwrap().unwrap();
                Err(CollaboratorError::Transient("upstream timeout".into()))
            },
        );

        let outcome = fx.worker(computer).process(&delivery).unwrap();

        assert!(matches!(outcome, ProcessOutcome::Retrying { receive_count: 1, .. }));
        let stored = fx.store.get(job.job_id).unwrap().unwrap();
        assert_eq!(stored.last_error.as_deref(), Some("transient failure: upstream timeout"));
        assert_eq!(fx.queue.stats().unwrap().in_flight, 1);
    }

    #[test]
    fn poison_message_is_attempted_exactly_threshold_times() {
        let fx = Fixture::new(3);
        let calls = Arc::new(AtomicU32::new(0));
        let job = fx.enqueue("BAD", JobAction::Analyze);

        let outcomes = fx.worker(failing_computer(calls.clone())).drain().unwrap();

        assert_eq!(outcomes.len(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(fx.store.get(job.job_id).unwrap().unwrap().attempts, 3);
        let dead = fx.queue.list(Some(date())).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message.job_id, job.job_id);
    }

    #[test]
    fn duplicate_delivery_of_terminal_job_is_dropped() {
        let fx = Fixture::new(3);
        let job = fx.enqueue("AAPL", JobAction::Refresh);
        fx.store.complete(job.job_id, Utc::now()).unwrap();

        let outcome = fx.worker(ok_computer()).process_next().unwrap();

        assert_eq!(outcome, Some(ProcessOutcome::AlreadyTerminal(JobStatus::Completed)));
        assert_eq!(fx.queue.stats().unwrap().outstanding(), 0);
    }

    #[test]
    fn message_without_live_job_is_orphaned() {
        let fx = Fixture::new(3);
        let job = Job::new(Ticker::parse("GONE").unwrap(), date(), Utc::now(), ChronoDuration::days(1))
            .with_action(JobAction::Refresh);
        fx.queue
            .send(QueueMessage::for_job(&job, Utc::now()))
            .unwrap();

        assert_eq!(
            fx.worker(ok_computer()).process_next().unwrap(),
            Some(ProcessOutcome::Orphaned)
        );
        assert_eq!(fx.queue.stats().unwrap().outstanding(), 0);
    }

    #[test]
    fn late_success_overrides_failure_and_clears_dead_letter() {
        let fx = Fixture::new(1);
        let job = fx.enqueue("SLOW", JobAction::Analyze);

        // First receive hands the message out; a slow worker holds it.
        let slow = fx.queue.receive().unwrap().unwrap();
        // Simulate the visibility window elapsing and the message dead-lettering.
        fx.queue.nack(&slow.receipt, Duration::ZERO).unwrap();
        assert!(fx.queue.receive().unwrap().is_none());
        fx.store.begin_attempt(job.job_id, Utc::now()).unwrap();
        fx.store.fail(job.job_id, "dead-lettered", Utc::now()).unwrap();

        // The slow attempt finishes anyway.
        let worker = fx.worker(ok_computer());
        let outcome = worker.finish(job.job_id).unwrap();

        assert_eq!(outcome, Some(CompleteOutcome::OverrodeFailure));
        assert_eq!(fx.store.get(job.job_id).unwrap().unwrap().status, JobStatus::Completed);
        assert!(fx.queue.list(None).unwrap().is_empty());
    }

    #[test]
    fn pool_processes_in_background_and_shuts_down() {
        let fx = Fixture::new(3);
        let jobs: Vec<Job> = ["A", "B", "C", "D"]
            .iter()
            .map(|t| {
                let job = Job::new(Ticker::parse(t).unwrap(), date(), Utc::now(), ChronoDuration::days(1));
                fx.queue
                    .send(QueueMessage::for_job(&job, Utc::now()))
                    .unwrap();
                job
            })
            .collect();
        fx.store
            .create_batch(Batch::new(date(), jobs.len() as u32, Utc::now()), jobs)
            .unwrap();

        let worker = Arc::new(fx.worker(ok_computer()));
        let config = WorkerConfig::default()
            .with_workers(2)
            .with_poll_interval(Duration::from_millis(10));
        let handle = WorkerPool::spawn(worker, config).unwrap();
        assert_eq!(handle.size(), 2);

        let deadline = Instant::now() + Duration::from_secs(5);
        while fx.store.counts(date()).unwrap().completed < 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let stats = handle.stats();
        handle.shutdown();

        assert_eq!(fx.store.counts(date()).unwrap().completed, 4);
        assert_eq!(stats.computed, 4);
    }
}
