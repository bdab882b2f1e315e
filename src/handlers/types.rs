//! Request and response payloads of the management API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::models::sync_conflict;
use crate::sync::conflict::ResolveAction;
use crate::sync::operation::OperationRecord;
use crate::sync::task::TaskView;

/// Response of the sync start endpoints
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskAccepted {
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub task_id: Uuid,
    #[schema(example = "pending")]
    pub status: String,
}

impl From<&TaskView> for TaskAccepted {
    fn from(view: &TaskView) -> Self {
        Self {
            task_id: view.id,
            status: view.status.clone(),
        }
    }
}

/// Query parameters for the task history
#[derive(Debug, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct ListTasksQuery {
    /// full | incremental
    #[serde(rename = "type")]
    #[param(rename = "type")]
    pub task_type: Option<String>,
    /// pending | running | paused | completed | failed
    pub status: Option<String>,
    /// Only tasks created at or after this RFC 3339 timestamp
    pub from: Option<DateTime<Utc>>,
    /// Only tasks created before this RFC 3339 timestamp
    pub to: Option<DateTime<Utc>>,
    /// Page size (default 50, max 100)
    pub limit: Option<u32>,
    /// Opaque cursor from the previous page
    pub cursor: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TasksResponse {
    pub tasks: Vec<TaskView>,
    /// Cursor for the next page; absent on the last page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListOperationsQuery {
    /// pending | running | completed | failed | skipped | paused
    pub status: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperationsResponse {
    pub operations: Vec<OperationRecord>,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct ListConflictsQuery {
    /// pending (default) | source_applied | target_kept | all
    pub resolution: Option<String>,
    /// Restrict to one task
    pub task_id: Option<Uuid>,
    /// Maximum rows (default 100, max 500)
    pub limit: Option<u32>,
}

/// Conflict as exposed by the API
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConflictView {
    pub id: Uuid,
    pub task_id: Uuid,
    pub operation_id: String,
    pub entity_type: String,
    pub entity_id: String,
    #[schema(example = "manual")]
    pub strategy: String,
    #[schema(example = "pending")]
    pub resolution: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub source_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub target_data: Option<Value>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl From<sync_conflict::Model> for ConflictView {
    fn from(model: sync_conflict::Model) -> Self {
        let utc = |t: sea_orm::prelude::DateTimeWithTimeZone| t.with_timezone(&Utc);
        Self {
            id: model.id,
            task_id: model.task_id,
            operation_id: model.operation_id,
            entity_type: model.entity_type,
            entity_id: model.entity_id,
            strategy: model.strategy,
            resolution: model.resolution,
            source_updated_at: model.source_updated_at.map(utc),
            target_updated_at: model.target_updated_at.map(utc),
            last_synced_at: model.last_synced_at.map(utc),
            source_data: model.source_data,
            target_data: model.target_data,
            created_at: utc(model.created_at),
            resolved_at: model.resolved_at.map(utc),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConflictsResponse {
    pub conflicts: Vec<ConflictView>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResolveConflictRequest {
    pub resolution: ResolveAction,
}

/// Response of the push endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PushAccepted {
    pub task_id: Uuid,
    pub status: String,
    /// Number of change records stored
    pub accepted: usize,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    #[schema(example = "ok")]
    pub status: String,
    #[schema(example = "ok")]
    pub database: String,
}
