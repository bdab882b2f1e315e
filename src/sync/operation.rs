//! Operation records: the unit of work emitted by the diff engine and
//! executed against a target adapter.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::directory::{DirectoryRecord, EntityType, Scope};
use crate::models::sync_operation;
use crate::sync::error::SyncError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Move,
    Rename,
    Update,
    Delete,
}

impl OperationType {
    pub const fn as_str(self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Move => "move",
            OperationType::Rename => "rename",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }

    /// Operations that modify an entity that already exists on the target.
    pub const fn touches_existing(self) -> bool {
        !matches!(self, OperationType::Create)
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "create" => Ok(OperationType::Create),
            "move" => Ok(OperationType::Move),
            "rename" => Ok(OperationType::Rename),
            "update" => Ok(OperationType::Update),
            "delete" => Ok(OperationType::Delete),
            other => Err(SyncError::storage(format!("unknown operation type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
    Skipped,
}

impl OperationStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Running => "running",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::Paused => "paused",
            OperationStatus::Skipped => "skipped",
        }
    }

    /// Statuses that will never be dispatched again without operator action.
    pub const fn is_final(self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Skipped | OperationStatus::Failed
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(OperationStatus::Pending),
            "running" => Ok(OperationStatus::Running),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            "paused" => Ok(OperationStatus::Paused),
            "skipped" => Ok(OperationStatus::Skipped),
            other => Err(SyncError::storage(format!("unknown operation status '{other}'"))),
        }
    }
}

/// Worker pool an operation is routed to under the queued strategy.
pub fn queue_for(entity_type: EntityType) -> &'static str {
    match entity_type {
        EntityType::Organization => "organization",
        EntityType::User | EntityType::Membership => "user",
    }
}

/// Deterministic operation id used for idempotent enqueue and redelivery.
pub fn operation_id(
    scope: &Scope,
    task_id: Uuid,
    entity_type: EntityType,
    entity_id: &str,
    operation_type: OperationType,
) -> String {
    let mut hasher = Sha256::new();
    for part in [
        scope.tenant_id.to_string().as_str(),
        scope.project_id.to_string().as_str(),
        task_id.to_string().as_str(),
        entity_type.as_str(),
        entity_id,
        operation_type.as_str(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    hex::encode(hasher.finalize())
}

/// Operation produced by the planner, before it is bound to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedOperation {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation_type: OperationType,
    /// Dependency tier; every operation of tier `n` finishes before tier `n+1` starts.
    pub priority: i32,
    /// Local entity JSON for non-deletes, remote entity JSON for deletes.
    pub data: Value,
}

impl PlannedOperation {
    pub fn key(&self) -> (EntityType, &str, OperationType) {
        (self.entity_type, self.entity_id.as_str(), self.operation_type)
    }
}

/// Persisted operation as seen by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub id: String,
    pub task_id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation_type: OperationType,
    #[schema(value_type = Object)]
    pub data: Value,
    pub status: OperationStatus,
    pub priority: i32,
    pub sequence: i64,
    pub queue: String,
    pub batch: Option<i32>,
    pub attempts: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[schema(value_type = Option<Object>)]
    pub result: Option<Value>,
    #[schema(value_type = Option<Object>)]
    pub error: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OperationRecord {
    /// Entity payload carried by the operation.
    pub fn record(&self) -> Result<DirectoryRecord, SyncError> {
        DirectoryRecord::from_value(self.entity_type, self.data.clone()).map_err(|err| {
            SyncError::storage(format!("operation {} has a corrupt payload: {}", self.id, err.message))
                .with_entity(self.entity_type.as_str(), self.entity_id.as_str())
                .with_operation(self.operation_type.as_str())
        })
    }
}

impl TryFrom<sync_operation::Model> for OperationRecord {
    type Error = SyncError;

    fn try_from(model: sync_operation::Model) -> Result<Self, Self::Error> {
        Ok(Self {
            entity_type: model.entity_type.parse()?,
            operation_type: model.operation_type.parse()?,
            status: model.status.parse()?,
            id: model.id,
            task_id: model.task_id,
            entity_id: model.entity_id,
            data: model.data,
            priority: model.priority,
            sequence: model.sequence,
            queue: model.queue,
            batch: model.batch,
            attempts: model.attempts,
            next_attempt_at: model.next_attempt_at.map(|t| t.with_timezone(&Utc)),
            result: model.result,
            error: model.error,
            created_at: model.created_at.with_timezone(&Utc),
            updated_at: model.updated_at.with_timezone(&Utc),
        })
    }
}
