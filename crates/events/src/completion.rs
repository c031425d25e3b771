use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use reportflow_core::BatchId;

/// Emitted once per batch date when every job of the batch is terminal.
///
/// Consumed by the derivation trigger, which starts the derived-artifact
/// pipeline for `batch_date`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub batch_date: NaiveDate,
    pub batch_id: BatchId,
    pub emitted_at: DateTime<Utc>,
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
}

impl CompletionEvent {
    /// True when at least one job landed in the dead-letter path.
    pub fn is_partial(&self) -> bool {
        self.failed > 0
    }
}
