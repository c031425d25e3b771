use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    response::IntoResponse,
    routing::{get, post},
};

use crate::app::routes::common::blocking;
use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/:id", get(get_job))
        .route("/:id/requeue", post(requeue_job))
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match dto::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match blocking(&services, move |s| {
        s.operator.job(job_id).map_err(errors::operator_error_to_response)
    })
    .await
    {
        Ok(job) => Json(job).into_response(),
        Err(resp) => resp,
    }
}

/// Manual repair for a job stuck `pending` past the grace period.
pub async fn requeue_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match dto::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match blocking(&services, move |s| {
        let receipt = s
            .operator
            .requeue(job_id)
            .map_err(errors::operator_error_to_response)?;
        let job = s.operator.job(job_id).map_err(errors::operator_error_to_response)?;
        s.watch_batch(job.date);
        Ok(receipt)
    })
    .await
    {
        Ok(receipt) => Json(receipt).into_response(),
        Err(resp) => resp,
    }
}
