//! # Sync Start Handlers

use axum::{
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use tracing::info;

use crate::error::ApiError;
use crate::handlers::types::TaskAccepted;
use crate::scope::{RequestScope, ScopeHeaders};
use crate::server::AppState;
use crate::sync::task::{SyncRequest, TaskType};

async fn start(
    state: AppState,
    scope: RequestScope,
    task_type: TaskType,
    payload: Result<Json<SyncRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    let Json(request) = payload?;
    let view = state.manager.submit(&scope.0, task_type, request).await?;
    info!(
        task_id = %view.id,
        scope = %scope.0,
        task_type = task_type.as_str(),
        "sync task accepted"
    );
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted::from(&view))))
}

/// Start a full reconciliation
#[utoipa::path(
    post,
    path = "/sync/full",
    params(ScopeHeaders),
    request_body = SyncRequest,
    responses(
        (status = 202, description = "Task created and started", body = TaskAccepted),
        (status = 400, description = "Invalid request or configuration", body = ApiError)
    ),
    tag = "sync"
)]
pub async fn start_full_sync(
    State(state): State<AppState>,
    scope: RequestScope,
    payload: Result<Json<SyncRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    start(state, scope, TaskType::Full, payload).await
}

/// Start an incremental sync
#[utoipa::path(
    post,
    path = "/sync/incremental",
    params(ScopeHeaders),
    request_body = SyncRequest,
    responses(
        (status = 202, description = "Task created and started", body = TaskAccepted),
        (status = 400, description = "Invalid request or configuration", body = ApiError)
    ),
    tag = "sync"
)]
pub async fn start_incremental_sync(
    State(state): State<AppState>,
    scope: RequestScope,
    payload: Result<Json<SyncRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    start(state, scope, TaskType::Incremental, payload).await
}
