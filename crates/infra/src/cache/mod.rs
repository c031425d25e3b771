//! Result cache keyed by `(ticker, date)`.
//!
//! Workers write computed reports here; the derived-artifact pipeline reads
//! them back and attaches artifact references. Writes are last-write-wins per
//! key, guarded by `computed_at` so a slow writer can never roll a newer
//! result back.

mod in_memory;
mod postgres;

use chrono::{DateTime, NaiveDate, Utc};

use reportflow_core::{ArtifactRef, ResultCacheEntry, ResultKey};

pub use in_memory::InMemoryResultCache;
pub use postgres::PostgresResultCache;

pub trait ResultCache: Send + Sync {
    fn get(&self, key: &ResultKey) -> Result<Option<ResultCacheEntry>, CacheError>;

    /// Insert or replace. An entry whose `computed_at` is not newer than the
    /// stored one is ignored; a replacement clears `derived_artifact_ref`.
    fn upsert(&self, entry: ResultCacheEntry) -> Result<UpsertOutcome, CacheError>;

    /// Every entry for a batch date, ordered by ticker.
    fn list_by_date(&self, date: NaiveDate) -> Result<Vec<ResultCacheEntry>, CacheError>;

    /// Set `derived_artifact_ref`, but only if the entry still has the
    /// `computed_at` the artifact was rendered from.
    fn attach_artifact(
        &self,
        key: &ResultKey,
        computed_at: DateTime<Utc>,
        artifact: ArtifactRef,
    ) -> Result<AttachOutcome, CacheError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
    /// A result at least as new was already stored; nothing changed.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached,
    /// The payload was recomputed after rendering started; the ref was dropped.
    Superseded,
    Missing,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}
