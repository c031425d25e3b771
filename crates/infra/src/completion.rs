//! Batch completion detection.
//!
//! Level-triggered: any number of pollers may check the same date at the same
//! time. The batch's `completion_emitted_at` flag is claimed with
//! compare-and-set, so exactly one of them publishes the [`CompletionEvent`].

use std::io;
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tracing::{debug, error, info, warn};

use reportflow_core::BatchPhase;
use reportflow_events::{CompletionEvent, EventBus};

use crate::jobs::{JobStatusStore, JobStoreError};
use crate::workers::{WorkerHandle, wait_or_shutdown};

/// Polling abstraction over "is this batch settled?", independent of how the
/// completion notification is transported.
pub trait CompletionWatcher: Send + Sync {
    /// `true` once every job of the batch is terminal. The first call that
    /// observes this also emits the completion event; later calls are no-ops.
    fn poll(&self, batch_date: NaiveDate) -> Result<bool, CompletionError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    /// The event could not be published; the emitted flag was released.
    #[error("failed to publish completion event: {0}")]
    Publish(String),
}

/// Result of one detection pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// No batch was scheduled for the date.
    NotScheduled,
    InProgress { terminal: u32, total: u32 },
    /// This call emitted the event.
    Emitted(CompletionEvent),
    /// The event was emitted before (by this or another detector).
    AlreadyEmitted,
}

pub struct CompletionDetector<B> {
    store: Arc<dyn JobStatusStore>,
    bus: B,
}

impl<B> CompletionDetector<B>
where
    B: EventBus<CompletionEvent>,
{
    pub fn new(store: Arc<dyn JobStatusStore>, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn detect(&self, batch_date: NaiveDate) -> Result<Detection, CompletionError> {
        let Some(batch) = self.store.batch(batch_date)? else {
            return Ok(Detection::NotScheduled);
        };
        if batch.completion_emitted_at.is_some() {
            return Ok(Detection::AlreadyEmitted);
        }

        let counts = self.store.counts(batch_date)?;
        if counts.terminal() < batch.total_jobs {
            return Ok(Detection::InProgress {
                terminal: counts.terminal(),
                total: batch.total_jobs,
            });
        }

        let now = Utc::now();
        if !self.store.claim_completion(batch_date, now)? {
            return Ok(Detection::AlreadyEmitted);
        }

        let event = CompletionEvent {
            batch_date,
            batch_id: batch.batch_id,
            emitted_at: now,
            total: batch.total_jobs,
            completed: counts.completed,
            failed: counts.failed,
        };

        if let Err(e) = self.bus.publish(event.clone()) {
            self.store.release_completion(batch_date)?;
            warn!(batch_date = %batch_date, error = ?e, "completion publish failed; will retry on next poll");
            return Err(CompletionError::Publish(format!("{e:?}")));
        }

        if let Err(e) = self.store.set_phase(batch_date, BatchPhase::BatchComplete) {
            warn!(batch_date = %batch_date, error = %e, "failed to record batch-complete phase");
        }

        info!(
            batch_date = %batch_date,
            total = event.total,
            completed = event.completed,
            failed = event.failed,
            "batch complete"
        );
        Ok(Detection::Emitted(event))
    }
}

impl<B> CompletionDetector<B>
where
    B: EventBus<CompletionEvent> + 'static,
{
    /// Poll `batch_date` every `interval` on a background thread until the
    /// batch settles or shutdown is requested.
    pub fn spawn_watch(
        self: Arc<Self>,
        batch_date: NaiveDate,
        interval: Duration,
    ) -> io::Result<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name(format!("completion-watch-{batch_date}"))
            .spawn(move || {
                loop {
                    match self.detect(batch_date) {
                        Ok(Detection::Emitted(_) | Detection::AlreadyEmitted) => break,
                        Ok(Detection::NotScheduled) => {
                            debug!(batch_date = %batch_date, "no batch yet");
                        }
                        Ok(Detection::InProgress { terminal, total }) => {
                            debug!(batch_date = %batch_date, terminal, total, "batch in progress");
                        }
                        Err(e) => error!(batch_date = %batch_date, error = %e, "completion poll failed"),
                    }
                    if wait_or_shutdown(&shutdown_rx, interval) {
                        break;
                    }
                }
            })?;
        Ok(WorkerHandle::new(shutdown_tx, join))
    }
}

impl<B> CompletionWatcher for CompletionDetector<B>
where
    B: EventBus<CompletionEvent>,
{
    fn poll(&self, batch_date: NaiveDate) -> Result<bool, CompletionError> {
        Ok(matches!(
            self.detect(batch_date)?,
            Detection::Emitted(_) | Detection::AlreadyEmitted
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::InMemoryJobStatusStore;
    use chrono::Duration as ChronoDuration;
    use reportflow_core::{Batch, Job, Ticker};
    use reportflow_events::{InMemoryEventBus, Subscription};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 11, 4).unwrap()
    }

    fn seed(store: &InMemoryJobStatusStore, n: usize) -> Vec<Job> {
        let jobs: Vec<Job> = (0..n)
            .map(|i| {
                Job::new(
                    Ticker::parse(&format!("T{i}")).unwrap(),
                    date(),
                    Utc::now(),
                    ChronoDuration::days(1),
                )
            })
            .collect();
        store
            .create_batch(Batch::new(date(), n as u32, Utc::now()), jobs.clone())
            .unwrap();
        jobs
    }

    fn drain(sub: &Subscription<CompletionEvent>) -> Vec<CompletionEvent> {
        std::iter::from_fn(|| sub.try_recv().ok()).collect()
    }

    #[test]
    fn emits_once_when_all_jobs_are_terminal() {
        let store = InMemoryJobStatusStore::arc();
        let bus = Arc::new(InMemoryEventBus::new());
        let sub = bus.subscribe();
        let jobs = seed(&store, 3);
        let detector = CompletionDetector::new(store.clone(), bus);

        store.complete(jobs[0].job_id, Utc::now()).unwrap();
        store.fail(jobs[1].job_id, "dlq", Utc::now()).unwrap();
        assert_eq!(
            detector.detect(date()).unwrap(),
            Detection::InProgress { terminal: 2, total: 3 }
        );
        assert!(!detector.poll(date()).unwrap());

        store.complete(jobs[2].job_id, Utc::now()).unwrap();
        assert!(detector.poll(date()).unwrap());
        assert!(detector.poll(date()).unwrap());

        let events = drain(&sub);
        assert_eq!(events.len(), 1);
        assert_eq!((events[0].completed, events[0].failed), (2, 1));
        assert_eq!(store.batch(date()).unwrap().unwrap().phase, BatchPhase::BatchComplete);
    }

    #[test]
    fn concurrent_polls_never_double_fire() {
        let store = InMemoryJobStatusStore::arc();
        let bus = Arc::new(InMemoryEventBus::new());
        let sub = bus.subscribe();
        for job in seed(&store, 2) {
            store.complete(job.job_id, Utc::now()).unwrap();
        }
        let detector = Arc::new(CompletionDetector::new(store.clone(), bus));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let detector = detector.clone();
                thread::spawn(move || detector.poll(date()).unwrap())
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }

        assert_eq!(drain(&sub).len(), 1);
    }

    #[test]
    fn unscheduled_date_is_not_complete() {
        let detector = CompletionDetector::new(
            InMemoryJobStatusStore::arc(),
            Arc::new(InMemoryEventBus::<CompletionEvent>::new()),
        );
        assert_eq!(detector.detect(date()).unwrap(), Detection::NotScheduled);
        assert!(!detector.poll(date()).unwrap());
    }

    /// Rejects the first publish, accepts the rest.
    struct FlakyBus {
        inner: InMemoryEventBus<CompletionEvent>,
        failures_left: std::sync::Mutex<u32>,
    }

    impl EventBus<CompletionEvent> for FlakyBus {
        type Error = String;

        fn publish(&self, message: CompletionEvent) -> Result<(), Self::Error> {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err("broker down".into());
            }
            self.inner.publish(message).map_err(|e| e.to_string())
        }

        fn subscribe(&self) -> Subscription<CompletionEvent> {
            self.inner.subscribe()
        }
    }

    #[test]
    fn failed_publish_releases_the_flag_for_retry() {
        let store = InMemoryJobStatusStore::arc();
        let bus = Arc::new(FlakyBus {
            inner: InMemoryEventBus::new(),
            failures_left: std::sync::Mutex::new(1),
        });
        let sub = bus.subscribe();
        for job in seed(&store, 1) {
            store.complete(job.job_id, Utc::now()).unwrap();
        }
        let detector = CompletionDetector::new(store.clone(), bus);

        assert!(matches!(detector.poll(date()), Err(CompletionError::Publish(_))));
        assert!(store.batch(date()).unwrap().unwrap().completion_emitted_at.is_none());

        assert!(detector.poll(date()).unwrap());
        assert_eq!(drain(&sub).len(), 1);
    }

    #[test]
    fn watch_thread_stops_after_emitting() {
        let store = InMemoryJobStatusStore::arc();
        let bus = Arc::new(InMemoryEventBus::new());
        let sub = bus.subscribe();
        let jobs = seed(&store, 1);
        let detector = Arc::new(CompletionDetector::new(store.clone(), bus));

        let handle = detector.spawn_watch(date(), Duration::from_millis(10)).unwrap();
        store.complete(jobs[0].job_id, Utc::now()).unwrap();

        let event = sub.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.batch_date, date());
        handle.shutdown();
    }
}
