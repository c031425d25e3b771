use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use reportflow_infra::derive::DeriveError;
use reportflow_infra::jobs::JobStoreError;
use reportflow_infra::operator::OperatorError;
use reportflow_infra::scheduler::ScheduleError;

pub fn operator_error_to_response(err: OperatorError) -> axum::response::Response {
    match err {
        OperatorError::JobNotFound(_) | OperatorError::BatchNotFound(_) => {
            json_error(StatusCode::NOT_FOUND, "not_found", err.to_string())
        }
        OperatorError::NotPending { .. } => json_error(StatusCode::CONFLICT, "not_pending", err.to_string()),
        OperatorError::WithinGrace { .. } => {
            json_error(StatusCode::CONFLICT, "within_grace_period", err.to_string())
        }
        OperatorError::Store(e) => store_error_to_response(e),
        OperatorError::Queue(e) => json_error(StatusCode::BAD_GATEWAY, "queue_error", e.to_string()),
    }
}

pub fn schedule_error_to_response(err: ScheduleError) -> axum::response::Response {
    match err {
        ScheduleError::EmptyBatch | ScheduleError::DuplicateTicker(_) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", err.to_string())
        }
        ScheduleError::Store(e) => store_error_to_response(e),
    }
}

pub fn derive_error_to_response(err: DeriveError) -> axum::response::Response {
    match err {
        DeriveError::Store(e) => store_error_to_response(e),
        other => json_error(StatusCode::INTERNAL_SERVER_ERROR, "derive_error", other.to_string()),
    }
}

pub fn store_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::NotFound(_) | JobStoreError::BatchNotFound(_) => {
            json_error(StatusCode::NOT_FOUND, "not_found", err.to_string())
        }
        JobStoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        JobStoreError::Storage(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
