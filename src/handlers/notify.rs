//! # Change Push Handler
//!
//! Entry point for systems that push their deltas instead of being polled.

use axum::{
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use serde_json::Value;
use tracing::info;

use crate::error::ApiError;
use crate::handlers::types::PushAccepted;
use crate::scope::{RequestScope, ScopeHeaders};
use crate::server::AppState;
use crate::sync::task_manager::PushRequest;

/// Push a changeset and start an incremental task that applies it
#[utoipa::path(
    post,
    path = "/notify/changes",
    params(ScopeHeaders),
    request_body(content = Value, description = "`{changes: {<entityType>: {created, updated, deleted}}, target, options?}`", content_type = "application/json"),
    responses(
        (status = 202, description = "Changes stored and task started", body = PushAccepted),
        (status = 400, description = "Malformed changeset", body = ApiError)
    ),
    tag = "sync"
)]
pub async fn push_changes(
    State(state): State<AppState>,
    scope: RequestScope,
    payload: Result<Json<PushRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<PushAccepted>), ApiError> {
    let Json(request) = payload?;
    let (view, accepted) = state.manager.push_changes(&scope.0, request).await?;
    info!(task_id = %view.id, scope = %scope.0, accepted, "pushed changes accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(PushAccepted {
            task_id: view.id,
            status: view.status,
            accepted,
        }),
    ))
}
