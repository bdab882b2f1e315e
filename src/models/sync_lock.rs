//! SyncLock entity model (`sync_locks`), one row per held scope lock.

use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_locks")]
pub struct Model {
    /// `sync:{entityType}:{tenantId}:{projectId}`
    #[sea_orm(primary_key, auto_increment = false)]
    pub lock_key: String,
    pub holder: String,
    pub acquired_at: DateTimeWithTimeZone,
    pub expires_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
