//! # Conflict Handlers

use axum::{
    extract::{Path, Query, State, rejection::JsonRejection},
    response::Json,
};
use uuid::Uuid;

use crate::error::{ApiError, validation_error};
use crate::handlers::types::{ConflictView, ConflictsResponse, ListConflictsQuery, ResolveConflictRequest};
use crate::repositories::ConflictRepository;
use crate::scope::{RequestScope, ScopeHeaders};
use crate::server::AppState;
use crate::sync::conflict::ConflictResolution;

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 500;

/// List conflicts; unresolved ones by default
#[utoipa::path(
    get,
    path = "/conflicts",
    params(ScopeHeaders, ListConflictsQuery),
    responses(
        (status = 200, description = "Conflicts", body = ConflictsResponse),
        (status = 400, description = "Invalid query parameters", body = ApiError)
    ),
    tag = "conflicts"
)]
pub async fn list_conflicts(
    State(state): State<AppState>,
    scope: RequestScope,
    Query(params): Query<ListConflictsQuery>,
) -> Result<Json<ConflictsResponse>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
    if limit == 0 || limit > MAX_LIMIT {
        return Err(validation_error(
            "Invalid limit",
            serde_json::json!({ "limit": format!("Must be between 1 and {MAX_LIMIT}") }),
        ));
    }
    let resolution = match params.resolution.as_deref() {
        None => Some(ConflictResolution::Pending),
        Some("all") => None,
        Some(other) => Some(other.parse::<ConflictResolution>().map_err(|_| {
            validation_error(
                "Invalid resolution",
                serde_json::json!({ "resolution": "Must be one of: pending, source_applied, target_kept, all" }),
            )
        })?),
    };

    let rows = ConflictRepository::new()
        .list(state.manager.db(), &scope.0, resolution, params.task_id, u64::from(limit))
        .await?;
    Ok(Json(ConflictsResponse {
        conflicts: rows.into_iter().map(ConflictView::from).collect(),
    }))
}

/// Resolve a pending conflict
#[utoipa::path(
    post,
    path = "/conflicts/{id}/resolve",
    params(ScopeHeaders, ("id" = Uuid, Path, description = "Conflict id")),
    request_body = ResolveConflictRequest,
    responses(
        (status = 200, description = "Conflict after resolution", body = ConflictView),
        (status = 400, description = "Invalid resolution", body = ApiError),
        (status = 404, description = "Conflict not found in this scope", body = ApiError),
        (status = 409, description = "Conflict already resolved", body = ApiError)
    ),
    tag = "conflicts"
)]
pub async fn resolve_conflict(
    State(state): State<AppState>,
    scope: RequestScope,
    Path(id): Path<Uuid>,
    payload: Result<Json<ResolveConflictRequest>, JsonRejection>,
) -> Result<Json<ConflictView>, ApiError> {
    let Json(request) = payload?;
    let conflict = state
        .manager
        .resolve_conflict(&scope.0, id, request.resolution)
        .await?;
    Ok(Json(conflict.into()))
}
