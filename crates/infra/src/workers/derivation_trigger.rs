//! Starts the derived-artifact pipeline when a batch completes.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::sync::{Arc, mpsc};
use std::thread;

use chrono::NaiveDate;
use tracing::{error, info, warn};

use reportflow_events::{CompletionEvent, EventBus, Subscription};

use super::{SHUTDOWN_TICK, WorkerHandle};
use crate::derive::DerivedArtifactPipeline;

/// How many recently derived dates the trigger remembers for deduplication.
const REMEMBERED_DATES: usize = 64;

/// Subscribes to completion events and runs the pipeline once per batch date.
///
/// The bus is at-least-once; duplicate events for a recently handled date are
/// ignored (the pipeline itself is idempotent as well). A date whose run
/// failed is forgotten, so a redelivered event retries it.
#[derive(Debug)]
pub struct DerivationTrigger;

impl DerivationTrigger {
    pub fn spawn<B>(bus: &B, pipeline: Arc<DerivedArtifactPipeline>) -> io::Result<WorkerHandle>
    where
        B: EventBus<CompletionEvent>,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sub = bus.subscribe();

        let join = thread::Builder::new()
            .name("derivation-trigger".to_string())
            .spawn(move || trigger_loop(sub, &pipeline, shutdown_rx))?;
        Ok(WorkerHandle::new(shutdown_tx, join))
    }
}

/// Bounded set of handled dates; the oldest is evicted first.
#[derive(Debug)]
struct HandledDates {
    order: VecDeque<NaiveDate>,
    seen: HashSet<NaiveDate>,
    capacity: usize,
}

impl HandledDates {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// `false` if the date was already handled.
    fn insert(&mut self, date: NaiveDate) -> bool {
        if !self.seen.insert(date) {
            return false;
        }
        self.order.push_back(date);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    fn forget(&mut self, date: NaiveDate) {
        if self.seen.remove(&date) {
            self.order.retain(|d| *d != date);
        }
    }
}

fn trigger_loop(
    sub: Subscription<CompletionEvent>,
    pipeline: &DerivedArtifactPipeline,
    shutdown_rx: mpsc::Receiver<()>,
) {
    let mut handled = HandledDates::new(REMEMBERED_DATES);

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match sub.recv_timeout(SHUTDOWN_TICK) {
            Ok(event) => {
                if !handled.insert(event.batch_date) {
                    warn!(batch_date = %event.batch_date, "duplicate completion event ignored");
                    continue;
                }
                info!(
                    batch_date = %event.batch_date,
                    completed = event.completed,
                    failed = event.failed,
                    partial = event.is_partial(),
                    "completion received; starting derivation"
                );
                if let Err(e) = pipeline.run(event.batch_date) {
                    error!(batch_date = %event.batch_date, error = %e, "derivation run failed");
                    handled.forget(event.batch_date);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{AttachOutcome, CacheError, InMemoryResultCache, ResultCache, UpsertOutcome};
    use crate::collaborators::{ArtifactRequest, CollaboratorError};
    use crate::derive::DeriveConfig;
    use crate::jobs::InMemoryJobStatusStore;
    use chrono::Utc;
    use reportflow_core::{ArtifactRef, BatchId, ReportPayload, ResultCacheEntry, ResultKey, Ticker};
    use reportflow_events::InMemoryEventBus;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[test]
    fn runs_pipeline_once_per_completed_date() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 6).unwrap();
        let cache = InMemoryResultCache::arc();
        cache
            .upsert(ResultCacheEntry::new(
                Ticker::parse("AAPL").unwrap(),
                date,
                ReportPayload(json!({})),
                Utc::now(),
            ))
            .unwrap();
        let renders = Arc::new(AtomicUsize::new(0));
        let renderer = {
            let renders = renders.clone();
            Arc::new(move |req: &ArtifactRequest| -> Result<ArtifactRef, CollaboratorError> {
                renders.fetch_add(1, Ordering::SeqCst);
                Ok(ArtifactRef(req.ticker.to_string()))
            })
        };
        let pipeline = Arc::new(DerivedArtifactPipeline::new(
            cache.clone(),
            InMemoryJobStatusStore::arc(),
            renderer,
            DeriveConfig::default(),
        ));
        let bus = InMemoryEventBus::new();
        let handle = DerivationTrigger::spawn(&bus, pipeline).unwrap();

        let event = CompletionEvent {
            batch_date: date,
            batch_id: BatchId::new(),
            emitted_at: Utc::now(),
            total: 1,
            completed: 1,
            failed: 0,
        };
        bus.publish(event.clone()).unwrap();
        bus.publish(event).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while cache.list_by_date(date).unwrap()[0].derived_artifact_ref.is_none()
            && Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(10));
        }
        // Let the duplicate be consumed.
        thread::sleep(Duration::from_millis(50));
        handle.shutdown();

        assert_eq!(renders.load(Ordering::SeqCst), 1);
        assert!(cache.list_by_date(date).unwrap()[0].derived_artifact_ref.is_some());
    }

    /// Fails the first listing, then delegates.
    struct FlakyListing {
        inner: Arc<InMemoryResultCache>,
        failed: AtomicBool,
    }

    impl ResultCache for FlakyListing {
        fn get(&self, key: &ResultKey) -> Result<Option<ResultCacheEntry>, CacheError> {
            self.inner.get(key)
        }
        fn upsert(&self, entry: ResultCacheEntry) -> Result<UpsertOutcome, CacheError> {
            self.inner.upsert(entry)
        }
        fn list_by_date(&self, date: NaiveDate) -> Result<Vec<ResultCacheEntry>, CacheError> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(CacheError::Storage("connection reset".into()));
            }
            self.inner.list_by_date(date)
        }
        fn attach_artifact(
            &self,
            key: &ResultKey,
            computed_at: chrono::DateTime<Utc>,
            artifact: ArtifactRef,
        ) -> Result<AttachOutcome, CacheError> {
            self.inner.attach_artifact(key, computed_at, artifact)
        }
    }

    #[test]
    fn failed_run_is_retried_on_redelivered_event() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 7).unwrap();
        let inner = InMemoryResultCache::arc();
        inner
            .upsert(ResultCacheEntry::new(
                Ticker::parse("MSFT").unwrap(),
                date,
                ReportPayload(json!({})),
                Utc::now(),
            ))
            .unwrap();
        let cache = Arc::new(FlakyListing {
            inner: inner.clone(),
            failed: AtomicBool::new(false),
        });
        let pipeline = Arc::new(DerivedArtifactPipeline::new(
            cache,
            InMemoryJobStatusStore::arc(),
            Arc::new(|req: &ArtifactRequest| -> Result<ArtifactRef, CollaboratorError> {
                Ok(ArtifactRef(req.ticker.to_string()))
            }),
            DeriveConfig::default(),
        ));
        let bus = InMemoryEventBus::new();
        let handle = DerivationTrigger::spawn(&bus, pipeline).unwrap();

        let event = CompletionEvent {
            batch_date: date,
            batch_id: BatchId::new(),
            emitted_at: Utc::now(),
            total: 1,
            completed: 1,
            failed: 0,
        };
        bus.publish(event.clone()).unwrap();
        bus.publish(event).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while inner.list_by_date(date).unwrap()[0].derived_artifact_ref.is_none()
            && Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(10));
        }
        handle.shutdown();

        assert!(inner.list_by_date(date).unwrap()[0].derived_artifact_ref.is_some());
    }

    #[test]
    fn handled_dates_evict_the_oldest() {
        let day = |d| NaiveDate::from_ymd_opt(2025, 1, d).unwrap();
        let mut handled = HandledDates::new(2);

        assert!(handled.insert(day(1)));
        assert!(!handled.insert(day(1)));
        assert!(handled.insert(day(2)));
        assert!(handled.insert(day(3)));
        // Day 1 fell out of the window.
        assert!(handled.insert(day(1)));
        assert!(!handled.insert(day(3)));

        handled.forget(day(3));
        assert!(handled.insert(day(3)));
        assert!(handled.order.len() <= 2);
    }
}
