//! Organization entity model (`organizations` table).

use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

/// Last-known-good organization row, keyed by `(tenant_id, project_id, external_id)`
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "organizations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    /// Stable identifier from the source system
    pub external_id: String,
    /// External id of the parent organization; `None` for roots
    pub parent_id: Option<String>,
    pub name: String,
    pub code: Option<String>,
    pub sort_order: i32,
    pub status: String,
    #[sea_orm(column_type = "JsonBinary")]
    pub extra: JsonValue,
    pub content_hash: String,
    pub source_updated_at: Option<DateTimeWithTimeZone>,
    pub synced: bool,
    pub deleted: bool,
    pub deleted_at: Option<DateTimeWithTimeZone>,
    pub last_synced_at: Option<DateTimeWithTimeZone>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
