use std::sync::Arc;

use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};

use crate::app::routes::common::blocking;
use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Whole-queue depth, DLQ depth included.
pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let result = blocking(&services, |s| {
        s.backends.queue.stats().map_err(|e| {
            errors::json_error(StatusCode::BAD_GATEWAY, "queue_error", e.to_string())
        })
    })
    .await;
    match result {
        Ok(stats) => Json(stats).into_response(),
        Err(resp) => resp,
    }
}

pub async fn purge_expired(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let result = blocking(&services, |s| {
        s.operator
            .purge_expired()
            .map_err(errors::operator_error_to_response)
    })
    .await;
    match result {
        Ok(removed) => Json(dto::PurgeResponse { removed }).into_response(),
        Err(resp) => resp,
    }
}
