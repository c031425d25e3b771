use std::sync::Arc;

use axum::http::StatusCode;

use crate::app::errors;
use crate::app::services::AppServices;

/// Run a pipeline call off the async executor.
///
/// Durable adapters block on the runtime handle, which panics on an executor
/// thread; in-memory calls just take locks.
pub async fn blocking<T, F>(services: &Arc<AppServices>, f: F) -> Result<T, axum::response::Response>
where
    F: FnOnce(&AppServices) -> Result<T, axum::response::Response> + Send + 'static,
    T: Send + 'static,
{
    let services = services.clone();
    match tokio::task::spawn_blocking(move || f(&services)).await {
        Ok(result) => result,
        Err(e) => Err(errors::json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            e.to_string(),
        )),
    }
}
