use axum::{
    Router,
    routing::{get, post},
};

pub mod batches;
pub mod common;
pub mod jobs;
pub mod system;

/// Router for the operator endpoints.
pub fn router() -> Router {
    Router::new()
        .nest("/batches", batches::router())
        .nest("/jobs", jobs::router())
        .route("/maintenance/purge", post(system::purge_expired))
        .route("/stats", get(system::stats))
}
