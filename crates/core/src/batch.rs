//! Batch record: one per batch date, tracks the two-stage pipeline phase.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::DomainError;
use crate::id::BatchId;

/// Pipeline phase for a whole batch.
///
/// `Scheduled → FannedOut → BatchComplete → Deriving → Derived`. Phases only move
/// forward; per-ticker progress lives on the individual jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPhase {
    Scheduled,
    FannedOut,
    BatchComplete,
    Deriving,
    Derived,
}

impl BatchPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchPhase::Scheduled => "scheduled",
            BatchPhase::FannedOut => "fanned_out",
            BatchPhase::BatchComplete => "batch_complete",
            BatchPhase::Deriving => "deriving",
            BatchPhase::Derived => "derived",
        }
    }
}

impl core::fmt::Display for BatchPhase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for BatchPhase {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(BatchPhase::Scheduled),
            "fanned_out" => Ok(BatchPhase::FannedOut),
            "batch_complete" => Ok(BatchPhase::BatchComplete),
            "deriving" => Ok(BatchPhase::Deriving),
            "derived" => Ok(BatchPhase::Derived),
            other => Err(DomainError::validation(format!("unknown batch phase '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: BatchId,
    pub batch_date: NaiveDate,
    /// Number of jobs created at schedule time; the completion threshold.
    pub total_jobs: u32,
    pub phase: BatchPhase,
    pub created_at: DateTime<Utc>,
    /// Set exactly once, by whoever emits the completion event.
    pub completion_emitted_at: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn new(batch_date: NaiveDate, total_jobs: u32, now: DateTime<Utc>) -> Self {
        Self {
            batch_id: BatchId::new(),
            batch_date,
            total_jobs,
            phase: BatchPhase::Scheduled,
            created_at: now,
            completion_emitted_at: None,
        }
    }

    /// Move forward to `next`; backwards moves are ignored. Returns whether the
    /// phase changed.
    pub fn advance(&mut self, next: BatchPhase) -> bool {
        if next > self.phase {
            self.phase = next;
            true
        } else {
            false
        }
    }
}

/// A batch is identified by its date; `batch_id` only labels the run.
impl Entity for Batch {
    type Id = NaiveDate;

    fn id(&self) -> &Self::Id {
        &self.batch_date
    }
}
