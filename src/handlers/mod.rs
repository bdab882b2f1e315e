//! # API Handlers
//!
//! HTTP endpoints of the sync management API.

pub mod conflicts;
pub mod notify;
pub mod sync;
pub mod tasks;
pub mod types;

use axum::{extract::State, http::StatusCode, response::Json};

use crate::db;
use crate::server::AppState;
use types::HealthResponse;

/// Liveness plus database connectivity
#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (status = 200, description = "Service and database are healthy", body = HealthResponse),
        (status = 503, description = "Database unreachable", body = HealthResponse)
    ),
    tag = "health"
)]
pub async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    match db::health_check(state.manager.db()).await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok".into(),
                database: "ok".into(),
            }),
        ),
        Err(err) => {
            tracing::warn!(error = %err, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "degraded".into(),
                    database: "unreachable".into(),
                }),
            )
        }
    }
}

#[cfg(test)]
mod tests;
