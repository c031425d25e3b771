//! Derived-artifact pipeline: render every cached result of a settled batch.
//!
//! Rendering is invoked directly (not through the job queue) on a bounded set
//! of threads, under one wall-clock deadline for the whole run. Entries that
//! already carry an artifact ref are skipped, so reruns are idempotent and a
//! run cut short by the deadline is finished by the next one.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info, warn};

use reportflow_core::{BatchPhase, ResultCacheEntry, Ticker};

use crate::cache::{AttachOutcome, CacheError, ResultCache};
use crate::collaborators::{ArtifactRenderer, ArtifactRequest};
use crate::jobs::{JobStatusStore, JobStoreError};

#[derive(Debug, Clone)]
pub struct DeriveConfig {
    /// Render slots.
    pub max_concurrent: usize,
    /// Deadline for the whole run.
    pub timeout: Duration,
}

impl Default for DeriveConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeriveError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error("failed to start render thread: {0}")]
    Spawn(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeriveFailure {
    pub ticker: Ticker,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DerivationReport {
    pub batch_date: Option<NaiveDate>,
    /// Refs attached in this run.
    pub rendered: usize,
    /// Already had a ref.
    pub skipped: usize,
    /// Recomputed (or removed) while rendering; the stale ref was dropped.
    pub superseded: usize,
    pub failed: Vec<DeriveFailure>,
    /// Not finished before the deadline; left without a ref.
    pub timed_out: Vec<Ticker>,
    pub elapsed_ms: u64,
}

impl DerivationReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.timed_out.is_empty()
    }
}

enum RenderResult {
    Attached,
    Superseded,
    Failed(String),
}

/// Closed when the run's deadline passes. Slots attach and report while
/// holding the lock, so every entry ends up either counted or timed out,
/// never both.
#[derive(Debug, Default)]
struct DeadlineGate {
    closed: Mutex<bool>,
}

impl DeadlineGate {
    fn is_closed(&self) -> bool {
        self.closed.lock().map(|c| *c).unwrap_or(true)
    }

    /// Waits for an in-progress attach to finish.
    fn close(&self) {
        *self.closed.lock().unwrap_or_else(|p| p.into_inner()) = true;
    }
}

pub struct DerivedArtifactPipeline {
    cache: Arc<dyn ResultCache>,
    store: Arc<dyn JobStatusStore>,
    renderer: Arc<dyn ArtifactRenderer>,
    config: DeriveConfig,
}

impl DerivedArtifactPipeline {
    pub fn new(
        cache: Arc<dyn ResultCache>,
        store: Arc<dyn JobStatusStore>,
        renderer: Arc<dyn ArtifactRenderer>,
        config: DeriveConfig,
    ) -> Self {
        Self {
            cache,
            store,
            renderer,
            config,
        }
    }

    pub fn run(&self, batch_date: NaiveDate) -> Result<DerivationReport, DeriveError> {
        let started = Instant::now();
        let deadline = started + self.config.timeout;
        self.advance_phase(batch_date, BatchPhase::Deriving)?;

        let mut report = DerivationReport {
            batch_date: Some(batch_date),
            ..Default::default()
        };
        let (done, todo): (Vec<ResultCacheEntry>, Vec<ResultCacheEntry>) = self
            .cache
            .list_by_date(batch_date)?
            .into_iter()
            .partition(|e| e.derived_artifact_ref.is_some());
        report.skipped = done.len();

        let mut outstanding: BTreeSet<Ticker> = todo.iter().map(|e| e.ticker.clone()).collect();
        let slots = self.config.max_concurrent.max(1).min(todo.len());
        let work = Arc::new(Mutex::new(VecDeque::from(todo)));
        let gate = Arc::new(DeadlineGate::default());
        let (tx, rx) = mpsc::channel::<(Ticker, RenderResult)>();

        for slot in 0..slots {
            let ctx = RenderSlot {
                work: work.clone(),
                gate: gate.clone(),
                cache: self.cache.clone(),
                renderer: self.renderer.clone(),
                results: tx.clone(),
            };
            thread::Builder::new()
                .name(format!("derive-{batch_date}-{slot}"))
                .spawn(move || ctx.run())
                .map_err(|e| DeriveError::Spawn(e.to_string()))?;
        }
        drop(tx);

        while !outstanding.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let Ok((ticker, result)) = rx.recv_timeout(remaining) else {
                break;
            };
            record(&mut report, &mut outstanding, batch_date, ticker, result);
        }

        if !outstanding.is_empty() {
            gate.close();
            // Attaches that won the race against the deadline still count.
            while let Ok((ticker, result)) = rx.try_recv() {
                record(&mut report, &mut outstanding, batch_date, ticker, result);
            }
        }

        if !outstanding.is_empty() {
            warn!(
                batch_date = %batch_date,
                timed_out = outstanding.len(),
                timeout_secs = self.config.timeout.as_secs_f64(),
                "derivation deadline reached; remaining entries left for the next run"
            );
            report.timed_out = outstanding.into_iter().collect();
        }

        if report.is_complete() {
            self.advance_phase(batch_date, BatchPhase::Derived)?;
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            batch_date = %batch_date,
            rendered = report.rendered,
            skipped = report.skipped,
            superseded = report.superseded,
            failed = report.failed.len(),
            timed_out = report.timed_out.len(),
            elapsed_ms = report.elapsed_ms,
            "derivation run finished"
        );
        Ok(report)
    }

    /// Cache entries can outlive their batch row (TTL purge), so a missing
    /// batch is not an error here.
    fn advance_phase(&self, batch_date: NaiveDate, phase: BatchPhase) -> Result<(), DeriveError> {
        match self.store.set_phase(batch_date, phase) {
            Ok(_) => Ok(()),
            Err(JobStoreError::BatchNotFound(_)) => {
                debug!(batch_date = %batch_date, "no batch row; phase not tracked");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn record(
    report: &mut DerivationReport,
    outstanding: &mut BTreeSet<Ticker>,
    batch_date: NaiveDate,
    ticker: Ticker,
    result: RenderResult,
) {
    outstanding.remove(&ticker);
    match result {
        RenderResult::Attached => report.rendered += 1,
        RenderResult::Superseded => report.superseded += 1,
        RenderResult::Failed(error) => {
            warn!(batch_date = %batch_date, ticker = %ticker, error = %error, "artifact render failed");
            report.failed.push(DeriveFailure { ticker, error });
        }
    }
}

struct RenderSlot {
    work: Arc<Mutex<VecDeque<ResultCacheEntry>>>,
    gate: Arc<DeadlineGate>,
    cache: Arc<dyn ResultCache>,
    renderer: Arc<dyn ArtifactRenderer>,
    results: mpsc::Sender<(Ticker, RenderResult)>,
}

impl RenderSlot {
    fn run(self) {
        loop {
            if self.gate.is_closed() {
                break;
            }
            let next = match self.work.lock() {
                Ok(mut queue) => queue.pop_front(),
                Err(_) => None,
            };
            let Some(entry) = next else {
                break;
            };

            let rendered = self.renderer.render(&ArtifactRequest::from(&entry));

            // Past the deadline the entry is already reported as timed out.
            let Ok(closed) = self.gate.closed.lock() else {
                break;
            };
            if *closed {
                break;
            }
            let result = match rendered {
                Ok(artifact) => {
                    match self
                        .cache
                        .attach_artifact(&entry.key(), entry.computed_at, artifact)
                    {
                        Ok(AttachOutcome::Attached) => RenderResult::Attached,
                        Ok(AttachOutcome::Superseded | AttachOutcome::Missing) => {
                            RenderResult::Superseded
                        }
                        Err(e) => RenderResult::Failed(e.to_string()),
                    }
                }
                Err(e) => RenderResult::Failed(e.to_string()),
            };

            if self.results.send((entry.ticker, result)).is_err() {
                break;
            }
        }
    }
}
