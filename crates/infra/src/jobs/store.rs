//! Job status store: the source of truth for job and batch lifecycle.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use reportflow_core::{
    Batch, BatchPhase, CompleteOutcome, Entity, FailOutcome, Job, JobId, JobStatus,
};

/// Job status store abstraction.
///
/// Every transition is a single atomic operation so concurrent workers, the
/// dead-letter listener and the completion detector can race safely. Expired
/// jobs (past `ttl`) are reported as absent.
pub trait JobStatusStore: Send + Sync {
    /// Persist a batch and all of its jobs, all-or-nothing.
    ///
    /// Fails with [`JobStoreError::Conflict`] if a batch already exists for the
    /// date; nothing is written in that case.
    fn create_batch(&self, batch: Batch, jobs: Vec<Job>) -> Result<(), JobStoreError>;

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    fn batch(&self, date: NaiveDate) -> Result<Option<Batch>, JobStoreError>;

    /// Move the batch phase forward. Returns whether it changed.
    fn set_phase(&self, date: NaiveDate, phase: BatchPhase) -> Result<bool, JobStoreError>;

    fn mark_enqueued(&self, job_id: JobId, at: DateTime<Utc>) -> Result<(), JobStoreError>;

    /// `pending|processing → processing`, `attempts += 1`.
    fn begin_attempt(&self, job_id: JobId, now: DateTime<Utc>)
    -> Result<AttemptOutcome, JobStoreError>;

    /// Mark completed. A failed job is overridden (late success wins).
    fn complete(&self, job_id: JobId, now: DateTime<Utc>) -> Result<CompleteOutcome, JobStoreError>;

    /// Compare-and-set from `pending|processing` to `failed`.
    fn fail(
        &self,
        job_id: JobId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, JobStoreError>;

    fn record_error(&self, job_id: JobId, error: &str, now: DateTime<Utc>)
    -> Result<(), JobStoreError>;

    fn list_by_date(&self, date: NaiveDate) -> Result<Vec<Job>, JobStoreError>;

    fn counts(&self, date: NaiveDate) -> Result<StatusCounts, JobStoreError>;

    /// Jobs still `pending` that were created before `created_before`.
    fn stuck_pending(
        &self,
        date: NaiveDate,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Compare-and-set the batch's `completion_emitted_at` from unset to `now`.
    /// Exactly one caller wins.
    fn claim_completion(&self, date: NaiveDate, now: DateTime<Utc>) -> Result<bool, JobStoreError>;

    /// Undo a claim whose event could not be published.
    fn release_completion(&self, date: NaiveDate) -> Result<(), JobStoreError>;

    /// Dates of batches whose completion event has not been emitted yet,
    /// oldest first.
    fn open_batches(&self) -> Result<Vec<NaiveDate>, JobStoreError>;

    /// Delete expired jobs (and batches left with no jobs). Returns the number
    /// of jobs removed.
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, JobStoreError>;
}

/// Result of [`JobStatusStore::begin_attempt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The job is now `processing`; carries the updated record.
    Started(Job),
    /// The job already reached a terminal status; nothing changed.
    AlreadyTerminal(JobStatus),
    /// No live job with that id (never existed or expired).
    Missing,
}

/// Job status store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("batch not found for {0}")]
    BatchNotFound(NaiveDate),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Per-status job counts for one batch date.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u32,
    pub processing: u32,
    pub completed: u32,
    pub failed: u32,
}

impl StatusCounts {
    pub fn total(&self) -> u32 {
        self.pending + self.processing + self.completed + self.failed
    }

    pub fn terminal(&self) -> u32 {
        self.completed + self.failed
    }

    pub fn add(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    batches: HashMap<NaiveDate, Batch>,
}

/// In-memory job status store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStatusStore {
    tables: RwLock<Tables>,
}

impl InMemoryJobStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, JobStoreError> {
        self.tables
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, JobStoreError> {
        self.tables
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".into()))
    }

    /// Apply `f` to a live (non-expired) job under the write lock.
    fn with_live_job<T>(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut Job) -> T,
    ) -> Result<Option<T>, JobStoreError> {
        let mut tables = self.write()?;
        Ok(tables
            .jobs
            .get_mut(&job_id)
            .filter(|job| !job.is_expired(now))
            .map(f))
    }
}

impl JobStatusStore for InMemoryJobStatusStore {
    fn create_batch(&self, batch: Batch, jobs: Vec<Job>) -> Result<(), JobStoreError> {
        let mut tables = self.write()?;
        if tables.batches.contains_key(batch.id()) {
            return Err(JobStoreError::Conflict(format!(
                "batch already scheduled for {}",
                batch.batch_date
            )));
        }
        if let Some(dup) = jobs.iter().find(|j| tables.jobs.contains_key(j.id())) {
            return Err(JobStoreError::Conflict(format!("job {} already exists", dup.job_id)));
        }

        for job in jobs {
            tables.jobs.insert(*job.id(), job);
        }
        tables.batches.insert(*batch.id(), batch);
        Ok(())
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let now = Utc::now();
        let tables = self.read()?;
        Ok(tables
            .jobs
            .get(&job_id)
            .filter(|job| !job.is_expired(now))
            .cloned())
    }

    fn batch(&self, date: NaiveDate) -> Result<Option<Batch>, JobStoreError> {
        Ok(self.read()?.batches.get(&date).cloned())
    }

    fn set_phase(&self, date: NaiveDate, phase: BatchPhase) -> Result<bool, JobStoreError> {
        let mut tables = self.write()?;
        let batch = tables
            .batches
            .get_mut(&date)
            .ok_or(JobStoreError::BatchNotFound(date))?;
        Ok(batch.advance(phase))
    }

    fn mark_enqueued(&self, job_id: JobId, at: DateTime<Utc>) -> Result<(), JobStoreError> {
        self.with_live_job(job_id, at, |job| job.mark_enqueued(at))?
            .ok_or(JobStoreError::NotFound(job_id))
    }

    fn begin_attempt(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<AttemptOutcome, JobStoreError> {
        let outcome = self.with_live_job(job_id, now, |job| match job.begin_attempt(now) {
            Ok(()) => AttemptOutcome::Started(job.clone()),
            Err(_) => AttemptOutcome::AlreadyTerminal(job.status),
        })?;
        Ok(outcome.unwrap_or(AttemptOutcome::Missing))
    }

    fn complete(&self, job_id: JobId, now: DateTime<Utc>) -> Result<CompleteOutcome, JobStoreError> {
        self.with_live_job(job_id, now, |job| job.complete(now))?
            .ok_or(JobStoreError::NotFound(job_id))
    }

    fn fail(
        &self,
        job_id: JobId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, JobStoreError> {
        self.with_live_job(job_id, now, |job| job.fail(reason, now))?
            .ok_or(JobStoreError::NotFound(job_id))
    }

    fn record_error(
        &self,
        job_id: JobId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        self.with_live_job(job_id, now, |job| job.record_error(error, now))?
            .ok_or(JobStoreError::NotFound(job_id))
    }

    fn list_by_date(&self, date: NaiveDate) -> Result<Vec<Job>, JobStoreError> {
        let now = Utc::now();
        let tables = self.read()?;
        let mut jobs: Vec<Job> = tables
            .jobs
            .values()
            .filter(|j| j.date == date && !j.is_expired(now))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        Ok(jobs)
    }

    fn counts(&self, date: NaiveDate) -> Result<StatusCounts, JobStoreError> {
        let now = Utc::now();
        let tables = self.read()?;
        let mut counts = StatusCounts::default();
        tables
            .jobs
            .values()
            .filter(|j| j.date == date && !j.is_expired(now))
            .for_each(|j| counts.add(j.status));
        Ok(counts)
    }

    fn stuck_pending(
        &self,
        date: NaiveDate,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        Ok(self
            .list_by_date(date)?
            .into_iter()
            .filter(|j| j.status == JobStatus::Pending && j.created_at < created_before)
            .collect())
    }

    fn claim_completion(&self, date: NaiveDate, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let mut tables = self.write()?;
        let batch = tables
            .batches
            .get_mut(&date)
            .ok_or(JobStoreError::BatchNotFound(date))?;
        if batch.completion_emitted_at.is_some() {
            return Ok(false);
        }
        batch.completion_emitted_at = Some(now);
        Ok(true)
    }

    fn release_completion(&self, date: NaiveDate) -> Result<(), JobStoreError> {
        let mut tables = self.write()?;
        if let Some(batch) = tables.batches.get_mut(&date) {
            batch.completion_emitted_at = None;
        }
        Ok(())
    }

    fn open_batches(&self) -> Result<Vec<NaiveDate>, JobStoreError> {
        let mut dates: Vec<NaiveDate> = self
            .read()?
            .batches
            .values()
            .filter(|b| b.completion_emitted_at.is_none())
            .map(|b| b.batch_date)
            .collect();
        dates.sort();
        Ok(dates)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let mut tables = self.write()?;
        let before = tables.jobs.len();
        tables.jobs.retain(|_, j| !j.is_expired(now));
        let removed = before - tables.jobs.len();

        if removed > 0 {
            let Tables { jobs, batches } = &mut *tables;
            batches.retain(|date, _| jobs.values().any(|j| j.date == *date));
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use reportflow_core::Ticker;
    use std::thread;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 4, 15).unwrap()
    }

    fn seed(store: &InMemoryJobStatusStore, tickers: &[&str]) -> Vec<Job> {
        let now = Utc::now();
        let jobs: Vec<Job> = tickers
            .iter()
            .map(|t| Job::new(Ticker::parse(t).unwrap(), date(), now, Duration::days(7)))
            .collect();
        let batch = Batch::new(date(), jobs.len() as u32, now);
        store.create_batch(batch, jobs.clone()).unwrap();
        jobs
    }

    #[test]
    fn second_batch_for_same_date_conflicts_and_writes_nothing() {
        let store = InMemoryJobStatusStore::new();
        seed(&store, &["AAPL"]);

        let extra = Job::new(Ticker::parse("MSFT").unwrap(), date(), Utc::now(), Duration::days(1));
        let extra_id = extra.job_id;
        let err = store
            .create_batch(Batch::new(date(), 1, Utc::now()), vec![extra])
            .unwrap_err();

        assert!(matches!(err, JobStoreError::Conflict(_)));
        assert!(store.get(extra_id).unwrap().is_none());
        assert_eq!(store.counts(date()).unwrap().total(), 1);
    }

    #[test]
    fn attempts_and_terminal_states() {
        let store = InMemoryJobStatusStore::new();
        let job = seed(&store, &["AAPL"]).remove(0);
        let now = Utc::now();

        let AttemptOutcome::Started(j) = store.begin_attempt(job.job_id, now).unwrap() else {
            panic!("expected attempt to start");
        };
        assert_eq!(j.attempts, 1);
        assert_eq!(j.status, JobStatus::Processing);

        assert_eq!(store.complete(job.job_id, now).unwrap(), CompleteOutcome::Completed);
        assert_eq!(
            store.begin_attempt(job.job_id, now).unwrap(),
            AttemptOutcome::AlreadyTerminal(JobStatus::Completed)
        );
        assert_eq!(
            store.fail(job.job_id, "dlq", now).unwrap(),
            FailOutcome::AlreadyCompleted
        );
        assert_eq!(store.get(job.job_id).unwrap().unwrap().attempts, 1);
    }

    #[test]
    fn unknown_jobs_are_missing() {
        let store = InMemoryJobStatusStore::new();
        assert_eq!(
            store.begin_attempt(JobId::new(), Utc::now()).unwrap(),
            AttemptOutcome::Missing
        );
        assert!(matches!(
            store.complete(JobId::new(), Utc::now()),
            Err(JobStoreError::NotFound(_))
        ));
    }

    #[test]
    fn expired_jobs_are_absent_and_purged() {
        let store = InMemoryJobStatusStore::new();
        let created = Utc::now() - Duration::days(2);
        let job = Job::new(Ticker::parse("OLD").unwrap(), date(), created, Duration::days(1));
        let id = job.job_id;
        store
            .create_batch(Batch::new(date(), 1, created), vec![job])
            .unwrap();

        assert!(store.get(id).unwrap().is_none());
        assert_eq!(store.begin_attempt(id, Utc::now()).unwrap(), AttemptOutcome::Missing);

        assert_eq!(store.purge_expired(Utc::now()).unwrap(), 1);
        assert!(store.batch(date()).unwrap().is_none());
    }

    #[test]
    fn completion_claim_has_exactly_one_winner() {
        let store = Arc::new(InMemoryJobStatusStore::new());
        seed(&store, &["AAPL"]);

        let winners: usize = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.claim_completion(date(), Utc::now()).unwrap())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(winners, 1);

        store.release_completion(date()).unwrap();
        assert!(store.claim_completion(date(), Utc::now()).unwrap());
    }

    #[test]
    fn stuck_pending_respects_cutoff() {
        let store = InMemoryJobStatusStore::new();
        let jobs = seed(&store, &["AAPL", "MSFT"]);
        store.begin_attempt(jobs[1].job_id, Utc::now()).unwrap();

        let later = Utc::now() + Duration::minutes(1);
        let stuck = store.stuck_pending(date(), later).unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].job_id, jobs[0].job_id);

        let earlier = Utc::now() - Duration::minutes(1);
        assert!(store.stuck_pending(date(), earlier).unwrap().is_empty());
    }

    #[test]
    fn phase_moves_forward_only() {
        let store = InMemoryJobStatusStore::new();
        seed(&store, &["AAPL"]);
        assert!(store.set_phase(date(), BatchPhase::BatchComplete).unwrap());
        assert!(!store.set_phase(date(), BatchPhase::FannedOut).unwrap());
        assert_eq!(store.batch(date()).unwrap().unwrap().phase, BatchPhase::BatchComplete);
    }

    #[test]
    fn open_batches_drop_out_once_completion_is_claimed() {
        let store = InMemoryJobStatusStore::new();
        seed(&store, &["AAPL"]);
        let next = date().succ_opt().unwrap();
        store
            .create_batch(
                Batch::new(next, 1, Utc::now()),
                vec![Job::new(Ticker::parse("MSFT").unwrap(), next, Utc::now(), Duration::days(7))],
            )
            .unwrap();

        assert_eq!(store.open_batches().unwrap(), vec![date(), next]);
        store.claim_completion(date(), Utc::now()).unwrap();
        assert_eq!(store.open_batches().unwrap(), vec![next]);
    }
}
