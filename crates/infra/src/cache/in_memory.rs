use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, NaiveDate, Utc};

use reportflow_core::{ArtifactRef, ResultCacheEntry, ResultKey};

use super::{AttachOutcome, CacheError, ResultCache, UpsertOutcome};

/// In-memory result cache for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryResultCache {
    entries: RwLock<HashMap<ResultKey, ResultCacheEntry>>,
}

impl InMemoryResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn poisoned<T>(_: T) -> CacheError {
    CacheError::Storage("result cache lock poisoned".into())
}

impl ResultCache for InMemoryResultCache {
    fn get(&self, key: &ResultKey) -> Result<Option<ResultCacheEntry>, CacheError> {
        Ok(self.entries.read().map_err(poisoned)?.get(key).cloned())
    }

    fn upsert(&self, entry: ResultCacheEntry) -> Result<UpsertOutcome, CacheError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        let key = entry.key();

        match entries.get(&key) {
            Some(existing) if existing.computed_at >= entry.computed_at => Ok(UpsertOutcome::Stale),
            Some(_) => {
                entries.insert(
                    key,
                    ResultCacheEntry {
                        derived_artifact_ref: None,
                        ..entry
                    },
                );
                Ok(UpsertOutcome::Replaced)
            }
            None => {
                entries.insert(key, entry);
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    fn list_by_date(&self, date: NaiveDate) -> Result<Vec<ResultCacheEntry>, CacheError> {
        let entries = self.entries.read().map_err(poisoned)?;
        let mut out: Vec<ResultCacheEntry> =
            entries.values().filter(|e| e.date == date).cloned().collect();
        out.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        Ok(out)
    }

    fn attach_artifact(
        &self,
        key: &ResultKey,
        computed_at: DateTime<Utc>,
        artifact: ArtifactRef,
    ) -> Result<AttachOutcome, CacheError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        Ok(match entries.get_mut(key) {
            None => AttachOutcome::Missing,
            Some(entry) if entry.computed_at != computed_at => AttachOutcome::Superseded,
            Some(entry) => {
                entry.derived_artifact_ref = Some(artifact);
                AttachOutcome::Attached
            }
        })
    }
}
