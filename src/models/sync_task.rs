//! SyncTask entity model
//!
//! One row per full or incremental sync run, owning its progress, checkpoint,
//! effective configuration and final result.

use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_tasks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    /// full | incremental
    pub task_type: String,
    /// pending | running | paused | completed | failed
    pub status: String,
    /// 0-100
    pub progress: i16,
    pub current_step: Option<String>,
    #[sea_orm(column_type = "JsonBinary")]
    pub checkpoint: Option<JsonValue>,
    /// Effective request: entity types, source, target and execution options
    #[sea_orm(column_type = "JsonBinary")]
    pub config: JsonValue,
    #[sea_orm(column_type = "JsonBinary")]
    pub result: Option<JsonValue>,
    /// Serialized `SyncError` when the task failed
    #[sea_orm(column_type = "JsonBinary")]
    pub error: Option<JsonValue>,
    pub cancel_requested: bool,
    pub created_at: DateTimeWithTimeZone,
    pub started_at: Option<DateTimeWithTimeZone>,
    pub updated_at: DateTimeWithTimeZone,
    pub finished_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
