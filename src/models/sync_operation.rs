//! SyncOperation entity model
//!
//! Operation records produced by the diff engine and mutated only by the
//! executor. `status` transitions are guarded by conditional updates.

use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_operations")]
pub struct Model {
    /// SHA-256 hex of scope, task, entity type, entity id and operation type
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub task_id: Uuid,
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    /// create | update | move | rename | delete
    pub operation_type: String,
    #[sea_orm(column_type = "JsonBinary")]
    pub data: JsonValue,
    /// pending | running | completed | failed | skipped | paused
    pub status: String,
    /// Dependency tier; lower tiers run first
    pub priority: i32,
    /// Emission order within the plan
    pub sequence: i64,
    /// organization | user
    pub queue: String,
    pub batch: Option<i32>,
    pub attempts: i32,
    pub next_attempt_at: Option<DateTimeWithTimeZone>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTimeWithTimeZone>,
    #[sea_orm(column_type = "JsonBinary")]
    pub result: Option<JsonValue>,
    #[sea_orm(column_type = "JsonBinary")]
    pub error: Option<JsonValue>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
