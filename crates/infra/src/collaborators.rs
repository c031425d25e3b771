//! External worker functions: report computation and artifact rendering.
//!
//! Both are opaque to the pipeline. Implementations live at the edge (HTTP
//! clients in the API binary, closures in tests).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use reportflow_core::{ArtifactRef, ReportPayload, ResultCacheEntry, Ticker};

#[derive(Debug, Clone, thiserror::Error)]
pub enum CollaboratorError {
    /// Worth retrying (timeouts, 5xx, rate limits).
    #[error("transient failure: {0}")]
    Transient(String),
    /// Will fail again (bad symbol, malformed payload).
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl CollaboratorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CollaboratorError::Transient(_))
    }
}

/// Computes the report for one ticker and date.
pub trait ReportComputer: Send + Sync {
    fn compute_report(
        &self,
        ticker: &Ticker,
        date: NaiveDate,
    ) -> Result<ReportPayload, CollaboratorError>;
}

impl<F> ReportComputer for F
where
    F: Fn(&Ticker, NaiveDate) -> Result<ReportPayload, CollaboratorError> + Send + Sync,
{
    fn compute_report(
        &self,
        ticker: &Ticker,
        date: NaiveDate,
    ) -> Result<ReportPayload, CollaboratorError> {
        self(ticker, date)
    }
}

/// Input to the artifact renderer: one cached result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRequest {
    pub ticker: Ticker,
    pub date: NaiveDate,
    pub report_payload: ReportPayload,
    pub computed_at: DateTime<Utc>,
}

impl From<&ResultCacheEntry> for ArtifactRequest {
    fn from(entry: &ResultCacheEntry) -> Self {
        Self {
            ticker: entry.ticker.clone(),
            date: entry.date,
            report_payload: entry.report_payload.clone(),
            computed_at: entry.computed_at,
        }
    }
}

/// Renders a cached result into a derived artifact (e.g. a PDF) and returns
/// where it was stored.
pub trait ArtifactRenderer: Send + Sync {
    fn render(&self, request: &ArtifactRequest) -> Result<ArtifactRef, CollaboratorError>;
}

impl<F> ArtifactRenderer for F
where
    F: Fn(&ArtifactRequest) -> Result<ArtifactRef, CollaboratorError> + Send + Sync,
{
    fn render(&self, request: &ArtifactRequest) -> Result<ArtifactRef, CollaboratorError> {
        self(request)
    }
}
