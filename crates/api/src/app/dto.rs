use axum::http::StatusCode;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use reportflow_core::{JobId, Ticker};
use reportflow_infra::queue::DeadLetter;

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct ScheduleBatchRequest {
    pub tickers: Vec<String>,
    /// Defaults to today (UTC).
    pub date: Option<NaiveDate>,
    /// Recompute even when a cached result exists.
    #[serde(default)]
    pub refresh: bool,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct DeadLetterResponse {
    pub batch_date: NaiveDate,
    pub job_ids: Vec<JobId>,
    pub dead_letters: Vec<DeadLetter>,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub removed: usize,
}

// -------------------------
// Parsing helpers
// -------------------------

pub fn parse_date(s: &str) -> Result<NaiveDate, axum::response::Response> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| {
        errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_date",
            format!("'{s}' is not a YYYY-MM-DD date"),
        )
    })
}

pub fn parse_job_id(s: &str) -> Result<JobId, axum::response::Response> {
    s.parse::<JobId>()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"))
}

/// Every symbol must parse; the first bad one is reported.
pub fn parse_tickers(raw: &[String]) -> Result<Vec<Ticker>, axum::response::Response> {
    raw.iter()
        .map(|s| {
            Ticker::parse(s).map_err(|e| {
                errors::json_error(StatusCode::BAD_REQUEST, "invalid_ticker", e.to_string())
            })
        })
        .collect()
}
