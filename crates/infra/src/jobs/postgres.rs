//! Postgres-backed job status store.
//!
//! Schema: `migrations/0001_reportflow.sql` (`jobs`, `batches`).
//!
//! ## Atomicity
//!
//! Job transitions lock the row (`SELECT … FOR UPDATE`) and apply the lifecycle
//! rules from `reportflow_core::Job` inside one transaction, so the Postgres and
//! in-memory stores agree on every edge case. The completion claim is a single
//! conditional `UPDATE … WHERE completion_emitted_at IS NULL`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | anything else | any | `Storage` |
//!
//! ## Threading
//!
//! Callers are plain threads (workers, listeners), so every call is driven on
//! the tokio runtime `Handle` given at construction. Never call from inside an
//! async task; use `spawn_blocking`.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::instrument;
use uuid::Uuid;

use reportflow_core::{
    Batch, BatchId, BatchPhase, CompleteOutcome, FailOutcome, Job, JobId, JobStatus, Ticker,
};

use super::store::{AttemptOutcome, JobStatusStore, JobStoreError, StatusCounts};

#[derive(Debug, Clone)]
pub struct PostgresJobStatusStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

#[derive(Debug, FromRow)]
struct JobRow {
    job_id: Uuid,
    batch_date: NaiveDate,
    ticker: String,
    status: String,
    action: String,
    attempts: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    enqueued_at: Option<DateTime<Utc>>,
    ttl: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            job_id: JobId::from_uuid(row.job_id),
            ticker: Ticker::parse(&row.ticker).map_err(corrupt)?,
            date: row.batch_date,
            status: row.status.parse().map_err(corrupt)?,
            action: row.action.parse().map_err(corrupt)?,
            attempts: u32::try_from(row.attempts).map_err(corrupt)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            enqueued_at: row.enqueued_at,
            last_error: row.last_error,
            ttl: row.ttl,
        })
    }
}

#[derive(Debug, FromRow)]
struct BatchRow {
    batch_date: NaiveDate,
    batch_id: Uuid,
    total_jobs: i32,
    phase: String,
    created_at: DateTime<Utc>,
    completion_emitted_at: Option<DateTime<Utc>>,
}

impl TryFrom<BatchRow> for Batch {
    type Error = JobStoreError;

    fn try_from(row: BatchRow) -> Result<Self, Self::Error> {
        Ok(Batch {
            batch_id: BatchId::from_uuid(row.batch_id),
            batch_date: row.batch_date,
            total_jobs: u32::try_from(row.total_jobs).map_err(corrupt)?,
            phase: row.phase.parse().map_err(corrupt)?,
            created_at: row.created_at,
            completion_emitted_at: row.completion_emitted_at,
        })
    }
}

fn corrupt(e: impl core::fmt::Display) -> JobStoreError {
    JobStoreError::Storage(format!("corrupt row: {e}"))
}

fn map_sqlx(e: sqlx::Error) -> JobStoreError {
    match &e {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            JobStoreError::Conflict(db.message().to_string())
        }
        _ => JobStoreError::Storage(e.to_string()),
    }
}

const JOB_COLUMNS: &str = "job_id, batch_date, ticker, status, action, attempts, last_error, \
                           created_at, updated_at, enqueued_at, ttl";

const BATCH_COLUMNS: &str =
    "batch_date, batch_id, total_jobs, phase, created_at, completion_emitted_at";

impl PostgresJobStatusStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Lock a live job row, apply `f`, write the result back.
    ///
    /// Returns `Ok(None)` if the job does not exist or has expired.
    fn transition<T>(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut Job) -> T,
    ) -> Result<Option<T>, JobStoreError> {
        let pool = self.pool.clone();
        self.runtime.block_on(async move {
            let mut tx = pool.begin().await.map_err(map_sqlx)?;

            let row: Option<JobRow> = sqlx::query_as(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1 AND ttl > $2 FOR UPDATE"
            ))
            .bind(job_id.as_uuid())
            .bind(now)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx)?;

            let Some(row) = row else {
                return Ok(None);
            };
            let mut job = Job::try_from(row)?;
            let out = f(&mut job);
            write_job(&mut tx, &job).await?;

            tx.commit().await.map_err(map_sqlx)?;
            Ok(Some(out))
        })
    }

    fn fetch_jobs(
        &self,
        sql: String,
        date: NaiveDate,
        at: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let pool = self.pool.clone();
        let rows: Vec<JobRow> = self.runtime.block_on(async move {
            sqlx::query_as(&sql)
                .bind(date)
                .bind(at)
                .fetch_all(&*pool)
                .await
                .map_err(map_sqlx)
        })?;
        rows.into_iter().map(Job::try_from).collect()
    }
}

async fn write_job(tx: &mut Transaction<'_, Postgres>, job: &Job) -> Result<(), JobStoreError> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET status = $2, attempts = $3, last_error = $4, updated_at = $5, enqueued_at = $6
        WHERE job_id = $1
        "#,
    )
    .bind(job.job_id.as_uuid())
    .bind(job.status.as_str())
    .bind(job.attempts as i32)
    .bind(job.last_error.as_deref())
    .bind(job.updated_at)
    .bind(job.enqueued_at)
    .execute(&mut **tx)
    .await
    .map_err(map_sqlx)?;
    Ok(())
}

impl JobStatusStore for PostgresJobStatusStore {
    #[instrument(skip(self, batch, jobs), fields(batch_date = %batch.batch_date, jobs = jobs.len()), err)]
    fn create_batch(&self, batch: Batch, jobs: Vec<Job>) -> Result<(), JobStoreError> {
        let pool = self.pool.clone();
        self.runtime.block_on(async move {
            let mut tx = pool.begin().await.map_err(map_sqlx)?;

            sqlx::query(
                r#"
                INSERT INTO batches (batch_date, batch_id, total_jobs, phase, created_at, completion_emitted_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(batch.batch_date)
            .bind(batch.batch_id.as_uuid())
            .bind(batch.total_jobs as i32)
            .bind(batch.phase.as_str())
            .bind(batch.created_at)
            .bind(batch.completion_emitted_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| match map_sqlx(e) {
                JobStoreError::Conflict(_) => JobStoreError::Conflict(format!(
                    "batch already scheduled for {}",
                    batch.batch_date
                )),
                other => other,
            })?;

            for job in &jobs {
                sqlx::query(
                    r#"
                    INSERT INTO jobs (job_id, batch_date, ticker, status, action, attempts,
                                      last_error, created_at, updated_at, enqueued_at, ttl)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                    "#,
                )
                .bind(job.job_id.as_uuid())
                .bind(job.date)
                .bind(job.ticker.as_str())
                .bind(job.status.as_str())
                .bind(job.action.as_str())
                .bind(job.attempts as i32)
                .bind(job.last_error.as_deref())
                .bind(job.created_at)
                .bind(job.updated_at)
                .bind(job.enqueued_at)
                .bind(job.ttl)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
            }

            // Dropping the transaction on any error above rolls everything back.
            tx.commit().await.map_err(map_sqlx)
        })
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let pool = self.pool.clone();
        let row: Option<JobRow> = self.runtime.block_on(async move {
            sqlx::query_as(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1 AND ttl > NOW()"
            ))
            .bind(job_id.as_uuid())
            .fetch_optional(&*pool)
            .await
            .map_err(map_sqlx)
        })?;
        row.map(Job::try_from).transpose()
    }

    fn batch(&self, date: NaiveDate) -> Result<Option<Batch>, JobStoreError> {
        let pool = self.pool.clone();
        let row: Option<BatchRow> = self.runtime.block_on(async move {
            sqlx::query_as(&format!(
                "SELECT {BATCH_COLUMNS} FROM batches WHERE batch_date = $1"
            ))
            .bind(date)
            .fetch_optional(&*pool)
            .await
            .map_err(map_sqlx)
        })?;
        row.map(Batch::try_from).transpose()
    }

    #[instrument(skip(self), err)]
    fn set_phase(&self, date: NaiveDate, phase: BatchPhase) -> Result<bool, JobStoreError> {
        let pool = self.pool.clone();
        self.runtime.block_on(async move {
            let mut tx = pool.begin().await.map_err(map_sqlx)?;
            let row: Option<BatchRow> = sqlx::query_as(&format!(
                "SELECT {BATCH_COLUMNS} FROM batches WHERE batch_date = $1 FOR UPDATE"
            ))
            .bind(date)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx)?;

            let mut batch = Batch::try_from(row.ok_or(JobStoreError::BatchNotFound(date))?)?;
            if !batch.advance(phase) {
                return Ok(false);
            }
            sqlx::query("UPDATE batches SET phase = $2 WHERE batch_date = $1")
                .bind(date)
                .bind(batch.phase.as_str())
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
            tx.commit().await.map_err(map_sqlx)?;
            Ok(true)
        })
    }

    fn mark_enqueued(&self, job_id: JobId, at: DateTime<Utc>) -> Result<(), JobStoreError> {
        self.transition(job_id, at, |job| job.mark_enqueued(at))?
            .ok_or(JobStoreError::NotFound(job_id))
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    fn begin_attempt(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<AttemptOutcome, JobStoreError> {
        let outcome = self.transition(job_id, now, |job| match job.begin_attempt(now) {
            Ok(()) => AttemptOutcome::Started(job.clone()),
            Err(_) => AttemptOutcome::AlreadyTerminal(job.status),
        })?;
        Ok(outcome.unwrap_or(AttemptOutcome::Missing))
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    fn complete(&self, job_id: JobId, now: DateTime<Utc>) -> Result<CompleteOutcome, JobStoreError> {
        self.transition(job_id, now, |job| job.complete(now))?
            .ok_or(JobStoreError::NotFound(job_id))
    }

    #[instrument(skip(self, reason), fields(job_id = %job_id), err)]
    fn fail(
        &self,
        job_id: JobId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, JobStoreError> {
        self.transition(job_id, now, |job| job.fail(reason, now))?
            .ok_or(JobStoreError::NotFound(job_id))
    }

    fn record_error(
        &self,
        job_id: JobId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        self.transition(job_id, now, |job| job.record_error(error, now))?
            .ok_or(JobStoreError::NotFound(job_id))
    }

    fn list_by_date(&self, date: NaiveDate) -> Result<Vec<Job>, JobStoreError> {
        self.fetch_jobs(
            format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE batch_date = $1 AND ttl > $2 ORDER BY ticker"
            ),
            date,
            Utc::now(),
        )
    }

    fn counts(&self, date: NaiveDate) -> Result<StatusCounts, JobStoreError> {
        let pool = self.pool.clone();
        let rows = self.runtime.block_on(async move {
            sqlx::query(
                r#"
                SELECT status, COUNT(*) AS n
                FROM jobs
                WHERE batch_date = $1 AND ttl > NOW()
                GROUP BY status
                "#,
            )
            .bind(date)
            .fetch_all(&*pool)
            .await
            .map_err(map_sqlx)
        })?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: JobStatus = row
                .try_get::<String, _>("status")
                .map_err(map_sqlx)?
                .parse()
                .map_err(corrupt)?;
            let n = row.try_get::<i64, _>("n").map_err(map_sqlx)? as u32;
            match status {
                JobStatus::Pending => counts.pending = n,
                JobStatus::Processing => counts.processing = n,
                JobStatus::Completed => counts.completed = n,
                JobStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }

    fn stuck_pending(
        &self,
        date: NaiveDate,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        self.fetch_jobs(
            format!(
                "SELECT {JOB_COLUMNS} FROM jobs \
                 WHERE batch_date = $1 AND status = 'pending' AND created_at < $2 AND ttl > NOW() \
                 ORDER BY ticker"
            ),
            date,
            created_before,
        )
    }

    #[instrument(skip(self), err)]
    fn claim_completion(&self, date: NaiveDate, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let pool = self.pool.clone();
        let claimed = self.runtime.block_on(async move {
            sqlx::query(
                r#"
                UPDATE batches SET completion_emitted_at = $2
                WHERE batch_date = $1 AND completion_emitted_at IS NULL
                "#,
            )
            .bind(date)
            .bind(now)
            .execute(&*pool)
            .await
            .map_err(map_sqlx)
        })?;

        if claimed.rows_affected() == 1 {
            return Ok(true);
        }
        // Distinguish "someone else won" from "no such batch".
        match self.batch(date)? {
            Some(_) => Ok(false),
            None => Err(JobStoreError::BatchNotFound(date)),
        }
    }

    fn release_completion(&self, date: NaiveDate) -> Result<(), JobStoreError> {
        let pool = self.pool.clone();
        self.runtime.block_on(async move {
            sqlx::query("UPDATE batches SET completion_emitted_at = NULL WHERE batch_date = $1")
                .bind(date)
                .execute(&*pool)
                .await
                .map_err(map_sqlx)
        })?;
        Ok(())
    }

    fn open_batches(&self) -> Result<Vec<NaiveDate>, JobStoreError> {
        let pool = self.pool.clone();
        self.runtime.block_on(async move {
            sqlx::query_scalar(
                "SELECT batch_date FROM batches WHERE completion_emitted_at IS NULL ORDER BY batch_date",
            )
            .fetch_all(&*pool)
            .await
            .map_err(map_sqlx)
        })
    }

    #[instrument(skip(self), err)]
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let pool = self.pool.clone();
        self.runtime.block_on(async move {
            let mut tx = pool.begin().await.map_err(map_sqlx)?;
            let removed = sqlx::query("DELETE FROM jobs WHERE ttl <= $1")
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?
                .rows_affected();

            if removed > 0 {
                sqlx::query(
                    r#"
                    DELETE FROM batches b
                    WHERE NOT EXISTS (SELECT 1 FROM jobs j WHERE j.batch_date = b.batch_date)
                    "#,
                )
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
            }
            tx.commit().await.map_err(map_sqlx)?;
            Ok(removed as usize)
        })
    }
}
