//! Per-ticker job record and its lifecycle rules.
//!
//! The status machine is `pending → processing → {completed | failed}`.
//! Stores apply these transitions atomically; this module owns the rules so the
//! in-memory and durable stores agree on them.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::ticker::Ticker;

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created by the scheduler, waiting for a worker.
    Pending,
    /// Picked up by a worker (possibly on a retry).
    Processing,
    /// Result is in the cache.
    Completed,
    /// Message reached the dead-letter queue.
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!("unknown job status '{other}'"))),
        }
    }
}

/// What a worker should do with a job.
///
/// Closed set: every variant is handled by an exhaustive `match` in the worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    /// Compute the report unless a cached result already exists.
    #[default]
    Analyze,
    /// Recompute even if a cached result exists (overwrites it).
    Refresh,
}

impl JobAction {
    pub fn as_str(self) -> &'static str {
        match self {
            JobAction::Analyze => "analyze",
            JobAction::Refresh => "refresh",
        }
    }
}

impl core::str::FromStr for JobAction {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analyze" => Ok(JobAction::Analyze),
            "refresh" => Ok(JobAction::Refresh),
            other => Err(DomainError::validation(format!("unknown job action '{other}'"))),
        }
    }
}

/// Result of a completion write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    /// The job moved from pending/processing to completed.
    Completed,
    /// The job was already completed; nothing changed.
    AlreadyCompleted,
    /// A late success replaced a dead-letter failure.
    OverrodeFailure,
}

/// Result of a failure write (issued by the dead-letter listener).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Failed,
    AlreadyFailed,
    /// Completion won the race; the job stays completed.
    AlreadyCompleted,
}

/// One job per ticker per batch date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub ticker: Ticker,
    pub date: NaiveDate,
    pub status: JobStatus,
    /// Action the job was scheduled with; every message for it carries this.
    #[serde(default)]
    pub action: JobAction,
    /// Number of processing attempts started (only ever increases).
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the queue message was last handed to the queue. `None` means the
    /// enqueue never succeeded.
    pub enqueued_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Auto-expiry; an expired job is treated as absent.
    pub ttl: DateTime<Utc>,
}

impl Job {
    pub fn new(ticker: Ticker, date: NaiveDate, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            job_id: JobId::new(),
            ticker,
            date,
            status: JobStatus::Pending,
            action: JobAction::Analyze,
            attempts: 0,
            created_at: now,
            updated_at: now,
            enqueued_at: None,
            last_error: None,
            ttl: now + ttl,
        }
    }

    pub fn with_action(mut self, action: JobAction) -> Self {
        self.action = action;
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.ttl
    }

    /// Record that a queue message for this job was accepted by the queue.
    pub fn mark_enqueued(&mut self, now: DateTime<Utc>) {
        self.enqueued_at = Some(now);
        self.updated_at = now;
    }

    /// `pending|processing → processing`, bumping `attempts`.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::invariant(format!(
                "job {} is already {}",
                self.job_id, self.status
            )));
        }
        self.status = JobStatus::Processing;
        self.attempts += 1;
        self.updated_at = now;
        Ok(())
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> CompleteOutcome {
        let outcome = match self.status {
            JobStatus::Completed => return CompleteOutcome::AlreadyCompleted,
            JobStatus::Failed => CompleteOutcome::OverrodeFailure,
            JobStatus::Pending | JobStatus::Processing => CompleteOutcome::Completed,
        };
        self.status = JobStatus::Completed;
        self.updated_at = now;
        outcome
    }

    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> FailOutcome {
        match self.status {
            JobStatus::Completed => FailOutcome::AlreadyCompleted,
            JobStatus::Failed => FailOutcome::AlreadyFailed,
            JobStatus::Pending | JobStatus::Processing => {
                self.status = JobStatus::Failed;
                self.last_error = Some(reason.into());
                self.updated_at = now;
                FailOutcome::Failed
            }
        }
    }

    /// Remember the latest processing error without changing status.
    pub fn record_error(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.last_error = Some(error.into());
        self.updated_at = now;
    }
}

impl Entity for Job {
    type Id = JobId;

    fn id(&self) -> &Self::Id {
        &self.job_id
    }
}
