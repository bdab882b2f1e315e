//! Scratch rows staged by the relational-join diff strategy.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "diff_staging")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub session_id: String,
    /// `l` for the local side, `r` for the remote side
    pub side: String,
    pub entity_type: String,
    pub entity_id: String,
    pub parent_id: Option<String>,
    pub name: Option<String>,
    pub content_hash: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
