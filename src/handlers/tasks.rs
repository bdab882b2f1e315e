//! # Task Handlers
//!
//! Task history, status, cancellation, resume and per-operation replay.

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use uuid::Uuid;

use crate::cursor::{decode_cursor, encode_cursor};
use crate::error::{ApiError, not_found, validation_error};
use crate::handlers::types::{ListOperationsQuery, ListTasksQuery, OperationsResponse, TasksResponse};
use crate::repositories::{OperationRepository, TaskFilter, TaskRepository};
use crate::scope::{RequestScope, ScopeHeaders};
use crate::server::AppState;
use crate::sync::operation::{OperationRecord, OperationStatus};
use crate::sync::task::{TaskStatus, TaskType, TaskView};

const DEFAULT_PAGE: u32 = 50;
const MAX_PAGE: u32 = 100;

fn parse_filter(params: &ListTasksQuery) -> Result<TaskFilter, ApiError> {
    let task_type = params
        .task_type
        .as_deref()
        .map(str::parse::<TaskType>)
        .transpose()
        .map_err(|_| validation_error("Invalid type", serde_json::json!({ "type": "Must be one of: full, incremental" })))?;
    let status = params
        .status
        .as_deref()
        .map(str::parse::<TaskStatus>)
        .transpose()
        .map_err(|_| {
            validation_error(
                "Invalid status",
                serde_json::json!({ "status": "Must be one of: pending, running, paused, completed, failed" }),
            )
        })?;
    if let (Some(from), Some(to)) = (params.from, params.to)
        && from >= to
    {
        return Err(validation_error(
            "Invalid date range",
            serde_json::json!({ "from": "Must be earlier than 'to'" }),
        ));
    }
    Ok(TaskFilter {
        task_type,
        status,
        created_after: params.from,
        created_before: params.to,
    })
}

/// List sync tasks, newest first
#[utoipa::path(
    get,
    path = "/tasks",
    params(ScopeHeaders, ListTasksQuery),
    responses(
        (status = 200, description = "Page of tasks", body = TasksResponse),
        (status = 400, description = "Invalid query parameters", body = ApiError)
    ),
    tag = "tasks"
)]
pub async fn list_tasks(
    State(state): State<AppState>,
    scope: RequestScope,
    Query(params): Query<ListTasksQuery>,
) -> Result<Json<TasksResponse>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_PAGE);
    if limit == 0 || limit > MAX_PAGE {
        return Err(validation_error(
            "Invalid limit",
            serde_json::json!({ "limit": format!("Must be between 1 and {MAX_PAGE}") }),
        ));
    }
    let filter = parse_filter(&params)?;
    let after = params
        .cursor
        .as_deref()
        .map(decode_cursor)
        .transpose()?
        .map(|c| (c.created_at, c.id));

    // One extra row tells us whether another page exists.
    let mut rows = TaskRepository::new()
        .list(state.manager.db(), &scope.0, &filter, after, u64::from(limit) + 1)
        .await?;
    let next_cursor = if rows.len() > limit as usize {
        rows.truncate(limit as usize);
        rows.last()
            .map(|last| encode_cursor(last.created_at.with_timezone(&chrono::Utc), last.id))
    } else {
        None
    };

    Ok(Json(TasksResponse {
        tasks: rows.into_iter().map(TaskView::from).collect(),
        next_cursor,
    }))
}

/// Current status and progress of one task
#[utoipa::path(
    get,
    path = "/tasks/{id}",
    params(ScopeHeaders, ("id" = Uuid, Path, description = "Task id")),
    responses(
        (status = 200, description = "Task", body = TaskView),
        (status = 404, description = "Task not found in this scope", body = ApiError)
    ),
    tag = "tasks"
)]
pub async fn get_task(
    State(state): State<AppState>,
    scope: RequestScope,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskView>, ApiError> {
    let task = TaskRepository::new()
        .find_scoped(state.manager.db(), &scope.0, id)
        .await?
        .ok_or_else(|| not_found("task"))?;
    Ok(Json(task.into()))
}

/// Request cooperative cancellation
#[utoipa::path(
    post,
    path = "/tasks/{id}/cancel",
    params(ScopeHeaders, ("id" = Uuid, Path, description = "Task id")),
    responses(
        (status = 200, description = "Cancellation recorded", body = TaskView),
        (status = 404, description = "Task not found in this scope", body = ApiError),
        (status = 409, description = "Task already finished", body = ApiError)
    ),
    tag = "tasks"
)]
pub async fn cancel_task(
    State(state): State<AppState>,
    scope: RequestScope,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskView>, ApiError> {
    Ok(Json(state.manager.cancel(&scope.0, id).await?))
}

/// Resume a paused task from its checkpoint
#[utoipa::path(
    post,
    path = "/tasks/{id}/resume",
    params(ScopeHeaders, ("id" = Uuid, Path, description = "Task id")),
    responses(
        (status = 200, description = "Task queued for resumption", body = TaskView),
        (status = 404, description = "Task not found in this scope", body = ApiError),
        (status = 409, description = "Task is not paused", body = ApiError)
    ),
    tag = "tasks"
)]
pub async fn resume_task(
    State(state): State<AppState>,
    scope: RequestScope,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskView>, ApiError> {
    Ok(Json(state.manager.resume(&scope.0, id).await?))
}

/// Operations planned by a task, in execution order
#[utoipa::path(
    get,
    path = "/tasks/{id}/operations",
    params(ScopeHeaders, ("id" = Uuid, Path, description = "Task id"), ListOperationsQuery),
    responses(
        (status = 200, description = "Operations", body = OperationsResponse),
        (status = 400, description = "Invalid status filter", body = ApiError),
        (status = 404, description = "Task not found in this scope", body = ApiError)
    ),
    tag = "tasks"
)]
pub async fn list_operations(
    State(state): State<AppState>,
    scope: RequestScope,
    Path(id): Path<Uuid>,
    Query(params): Query<ListOperationsQuery>,
) -> Result<Json<OperationsResponse>, ApiError> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<OperationStatus>)
        .transpose()
        .map_err(|_| {
            validation_error(
                "Invalid status",
                serde_json::json!({ "status": "Must be one of: pending, running, completed, failed, skipped, paused" }),
            )
        })?;

    let db = state.manager.db();
    TaskRepository::new()
        .find_scoped(db, &scope.0, id)
        .await?
        .ok_or_else(|| not_found("task"))?;
    let operations = OperationRepository::new()
        .for_task(db, id, status)
        .await?
        .into_iter()
        .map(OperationRecord::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(OperationsResponse { operations }))
}

/// Replay one failed operation
#[utoipa::path(
    post,
    path = "/tasks/{id}/operations/{op_id}/retry",
    params(
        ScopeHeaders,
        ("id" = Uuid, Path, description = "Task id"),
        ("op_id" = String, Path, description = "Operation id")
    ),
    responses(
        (status = 200, description = "Operation after the replay", body = OperationRecord),
        (status = 404, description = "Task or operation not found", body = ApiError),
        (status = 409, description = "Operation is not failed or the task is running", body = ApiError)
    ),
    tag = "tasks"
)]
pub async fn retry_operation(
    State(state): State<AppState>,
    scope: RequestScope,
    Path((id, op_id)): Path<(Uuid, String)>,
) -> Result<Json<OperationRecord>, ApiError> {
    Ok(Json(state.manager.retry_operation(&scope.0, id, &op_id).await?))
}
