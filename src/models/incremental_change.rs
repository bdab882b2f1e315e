//! IncrementalChange entity model
//!
//! Raw deltas captured by a source change fetch (or pushed by an external
//! system), consumed and marked processed by the next incremental task.

use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "incremental_changes")]
pub struct Model {
    /// Deterministic id: hash of scope, entity type, entity id, change type and timestamp
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    /// created | updated | deleted
    pub change_type: String,
    pub changed_at: DateTimeWithTimeZone,
    /// Normalized entity JSON; absent for deletes
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: Option<JsonValue>,
    /// Source kind that captured the change (database, api, custom, push)
    pub source: String,
    pub processed: bool,
    pub processed_at: Option<DateTimeWithTimeZone>,
    /// Task that consumed the record
    pub task_id: Option<Uuid>,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
