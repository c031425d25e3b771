//! Postgres-backed result cache (`result_cache` table).
//!
//! The monotonic guard lives in SQL: the upsert's `DO UPDATE … WHERE
//! result_cache.computed_at < EXCLUDED.computed_at` turns stale writes into
//! no-ops, and `xmax = 0` tells inserts apart from replacements.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{FromRow, PgPool};
use tokio::runtime::Handle;
use tracing::instrument;

use reportflow_core::{ArtifactRef, ReportPayload, ResultCacheEntry, ResultKey, Ticker};

use super::{AttachOutcome, CacheError, ResultCache, UpsertOutcome};

#[derive(Debug, Clone)]
pub struct PostgresResultCache {
    pool: Arc<PgPool>,
    runtime: Handle,
}

#[derive(Debug, FromRow)]
struct CacheRow {
    ticker: String,
    date: NaiveDate,
    report_payload: serde_json::Value,
    computed_at: DateTime<Utc>,
    derived_artifact_ref: Option<String>,
}

impl TryFrom<CacheRow> for ResultCacheEntry {
    type Error = CacheError;

    fn try_from(row: CacheRow) -> Result<Self, Self::Error> {
        Ok(ResultCacheEntry {
            ticker: Ticker::parse(&row.ticker)
                .map_err(|e| CacheError::Storage(format!("corrupt row: {e}")))?,
            date: row.date,
            report_payload: ReportPayload(row.report_payload),
            computed_at: row.computed_at,
            derived_artifact_ref: row.derived_artifact_ref.map(ArtifactRef),
        })
    }
}

fn map_sqlx(e: sqlx::Error) -> CacheError {
    CacheError::Storage(e.to_string())
}

impl PostgresResultCache {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }
}

impl ResultCache for PostgresResultCache {
    fn get(&self, key: &ResultKey) -> Result<Option<ResultCacheEntry>, CacheError> {
        let pool = self.pool.clone();
        let row: Option<CacheRow> = self.runtime.block_on(async move {
            sqlx::query_as(
                r#"
                SELECT ticker, date, report_payload, computed_at, derived_artifact_ref
                FROM result_cache
                WHERE ticker = $1 AND date = $2
                "#,
            )
            .bind(key.ticker.as_str())
            .bind(key.date)
            .fetch_optional(&*pool)
            .await
            .map_err(map_sqlx)
        })?;
        row.map(ResultCacheEntry::try_from).transpose()
    }

    #[instrument(skip(self, entry), fields(ticker = %entry.ticker, date = %entry.date), err)]
    fn upsert(&self, entry: ResultCacheEntry) -> Result<UpsertOutcome, CacheError> {
        let pool = self.pool.clone();
        // RETURNING yields no row when the guard rejected the update.
        let inserted: Option<bool> = self.runtime.block_on(async move {
            sqlx::query_scalar(
                r#"
                INSERT INTO result_cache (ticker, date, report_payload, computed_at, derived_artifact_ref)
                VALUES ($1, $2, $3, $4, NULL)
                ON CONFLICT (ticker, date) DO UPDATE SET
                    report_payload = EXCLUDED.report_payload,
                    computed_at = EXCLUDED.computed_at,
                    derived_artifact_ref = NULL
                WHERE result_cache.computed_at < EXCLUDED.computed_at
                RETURNING (xmax = 0) AS inserted
                "#,
            )
            .bind(entry.ticker.as_str())
            .bind(entry.date)
            .bind(&entry.report_payload.0)
            .bind(entry.computed_at)
            .fetch_optional(&*pool)
            .await
            .map_err(map_sqlx)
        })?;

        Ok(match inserted {
            Some(true) => UpsertOutcome::Inserted,
            Some(false) => UpsertOutcome::Replaced,
            None => UpsertOutcome::Stale,
        })
    }

    fn list_by_date(&self, date: NaiveDate) -> Result<Vec<ResultCacheEntry>, CacheError> {
        let pool = self.pool.clone();
        let rows: Vec<CacheRow> = self.runtime.block_on(async move {
            sqlx::query_as(
                r#"
                SELECT ticker, date, report_payload, computed_at, derived_artifact_ref
                FROM result_cache
                WHERE date = $1
                ORDER BY ticker
                "#,
            )
            .bind(date)
            .fetch_all(&*pool)
            .await
            .map_err(map_sqlx)
        })?;
        rows.into_iter().map(ResultCacheEntry::try_from).collect()
    }

    #[instrument(skip(self, key, artifact), fields(ticker = %key.ticker, date = %key.date), err)]
    fn attach_artifact(
        &self,
        key: &ResultKey,
        computed_at: DateTime<Utc>,
        artifact: ArtifactRef,
    ) -> Result<AttachOutcome, CacheError> {
        let pool = self.pool.clone();
        let updated = self.runtime.block_on(async {
            sqlx::query(
                r#"
                UPDATE result_cache SET derived_artifact_ref = $4
                WHERE ticker = $1 AND date = $2 AND computed_at = $3
                "#,
            )
            .bind(key.ticker.as_str())
            .bind(key.date)
            .bind(computed_at)
            .bind(&artifact.0)
            .execute(&*pool)
            .await
            .map_err(map_sqlx)
        })?;

        if updated.rows_affected() == 1 {
            return Ok(AttachOutcome::Attached);
        }
        Ok(match self.get(key)? {
            Some(_) => AttachOutcome::Superseded,
            None => AttachOutcome::Missing,
        })
    }
}
