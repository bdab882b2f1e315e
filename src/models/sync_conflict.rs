//! SyncConflict entity model: entities modified on both sides since their last sync.

use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_conflicts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub task_id: Uuid,
    pub operation_id: String,
    pub entity_type: String,
    pub entity_id: String,
    /// Policy in force when the conflict was detected
    pub strategy: String,
    /// pending | source_applied | target_kept
    pub resolution: String,
    pub source_updated_at: Option<DateTimeWithTimeZone>,
    pub target_updated_at: Option<DateTimeWithTimeZone>,
    pub last_synced_at: Option<DateTimeWithTimeZone>,
    #[sea_orm(column_type = "JsonBinary")]
    pub source_data: Option<JsonValue>,
    #[sea_orm(column_type = "JsonBinary")]
    pub target_data: Option<JsonValue>,
    pub created_at: DateTimeWithTimeZone,
    pub resolved_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
