use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use tracing::info;

use crate::app::routes::common::blocking;
use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(schedule_batch))
        .route("/:date", get(get_batch))
        .route("/:date/dlq", get(get_dead_letters))
        .route("/:date/stuck", get(get_stuck_pending))
        .route("/:date/results", get(get_results))
        .route("/:date/derive", post(derive_artifacts))
}

/// Fan out one job per ticker. Returns once every message is enqueued; the
/// batch completes in the background.
pub async fn schedule_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::ScheduleBatchRequest>,
) -> axum::response::Response {
    let tickers = match dto::parse_tickers(&body.tickers) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let date = body.date.unwrap_or_else(|| Utc::now().date_naive());
    let refresh = body.refresh;

    let result = blocking(&services, move |s| {
        let receipt = if refresh {
            s.scheduler.schedule_refresh(&tickers, date)
        } else {
            s.scheduler.schedule(&tickers, date)
        }
        .map_err(errors::schedule_error_to_response)?;
        s.watch_batch(date);
        Ok(receipt)
    })
    .await;

    match result {
        Ok(receipt) => {
            info!(
                batch_date = %receipt.batch_date,
                total_jobs = receipt.total_jobs,
                enqueue_failures = receipt.enqueue_failures.len(),
                "batch scheduled via api"
            );
            (StatusCode::ACCEPTED, Json(receipt)).into_response()
        }
        Err(resp) => resp,
    }
}

pub async fn get_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Path(date): Path<String>,
) -> axum::response::Response {
    let date = match dto::parse_date(&date) {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    match blocking(&services, move |s| {
        s.operator
            .batch_status(date)
            .map_err(errors::operator_error_to_response)
    })
    .await
    {
        Ok(status) => Json(status).into_response(),
        Err(resp) => resp,
    }
}

pub async fn get_dead_letters(
    Extension(services): Extension<Arc<AppServices>>,
    Path(date): Path<String>,
) -> axum::response::Response {
    let date = match dto::parse_date(&date) {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    match blocking(&services, move |s| {
        let job_ids = s
            .operator
            .inspect_dlq(date)
            .map_err(errors::operator_error_to_response)?;
        let dead_letters = s
            .operator
            .dead_letters(date)
            .map_err(errors::operator_error_to_response)?;
        Ok(dto::DeadLetterResponse {
            batch_date: date,
            job_ids,
            dead_letters,
        })
    })
    .await
    {
        Ok(body) => Json(body).into_response(),
        Err(resp) => resp,
    }
}

pub async fn get_stuck_pending(
    Extension(services): Extension<Arc<AppServices>>,
    Path(date): Path<String>,
) -> axum::response::Response {
    let date = match dto::parse_date(&date) {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    match blocking(&services, move |s| {
        s.operator
            .stuck_pending(date)
            .map_err(errors::operator_error_to_response)
    })
    .await
    {
        Ok(stuck) => Json(stuck).into_response(),
        Err(resp) => resp,
    }
}

/// Cached results for the date, with their artifact refs.
pub async fn get_results(
    Extension(services): Extension<Arc<AppServices>>,
    Path(date): Path<String>,
) -> axum::response::Response {
    let date = match dto::parse_date(&date) {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    match blocking(&services, move |s| {
        s.backends.cache.list_by_date(date).map_err(|e| {
            errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "cache_error", e.to_string())
        })
    })
    .await
    {
        Ok(entries) => Json(entries).into_response(),
        Err(resp) => resp,
    }
}

/// Run the derived-artifact pipeline now; safe to repeat.
pub async fn derive_artifacts(
    Extension(services): Extension<Arc<AppServices>>,
    Path(date): Path<String>,
) -> axum::response::Response {
    let date = match dto::parse_date(&date) {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    match blocking(&services, move |s| {
        s.derive.run(date).map_err(errors::derive_error_to_response)
    })
    .await
    {
        Ok(report) => Json(report).into_response(),
        Err(resp) => resp,
    }
}
