//! Cached report results and derived artifact references.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::ticker::Ticker;

/// Opaque report content produced by the report computation collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportPayload(pub serde_json::Value);

/// Reference to a derived artifact (e.g. an object-store key for a PDF).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(pub String);

impl core::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cache key: at most one entry per `(ticker, date)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultKey {
    pub ticker: Ticker,
    pub date: NaiveDate,
}

impl ResultKey {
    pub fn new(ticker: Ticker, date: NaiveDate) -> Self {
        Self { ticker, date }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultCacheEntry {
    pub ticker: Ticker,
    pub date: NaiveDate,
    pub report_payload: ReportPayload,
    pub computed_at: DateTime<Utc>,
    pub derived_artifact_ref: Option<ArtifactRef>,
}

impl ResultCacheEntry {
    pub fn new(
        ticker: Ticker,
        date: NaiveDate,
        report_payload: ReportPayload,
        computed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            ticker,
            date,
            report_payload,
            computed_at,
            derived_artifact_ref: None,
        }
    }

    pub fn key(&self) -> ResultKey {
        ResultKey::new(self.ticker.clone(), self.date)
    }
}
