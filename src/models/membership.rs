//! Membership entity model (`memberships` table).
//!
//! `org_id` and `user_id` hold external ids, matching what sources and targets exchange.

use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "memberships")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub external_id: String,
    pub org_id: String,
    pub user_id: String,
    pub is_primary: bool,
    pub position: Option<String>,
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
