//! # Scope Lock Repository
//!
//! Rows in `sync_locks` are leases: a holder owns a key until `expires_at`.
//! Expired leases are taken over by the next acquirer.

use chrono::{Duration, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set, TryInsertResult};

use crate::models::sync_lock::{ActiveModel, Column, Entity, Model};
use crate::sync::error::SyncError;

#[derive(Debug, Clone, Copy, Default)]
pub struct LockRepository;

impl LockRepository {
    pub fn new() -> Self {
        Self
    }

    /// Takes the lease on `key` unless a live lease belongs to someone else.
    /// Re-acquiring a key already held by `holder` extends it.
    pub async fn try_acquire<C: ConnectionTrait>(
        &self,
        conn: &C,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, SyncError> {
        let now = Utc::now();

        Entity::delete_many()
            .filter(Column::LockKey.eq(key))
            .filter(Column::ExpiresAt.lt(now.fixed_offset()))
            .exec(conn)
            .await?;

        let lease = ActiveModel {
            lock_key: Set(key.to_string()),
            holder: Set(holder.to_string()),
            acquired_at: Set(now.fixed_offset()),
            expires_at: Set((now + ttl).fixed_offset()),
        };
        let inserted = Entity::insert(lease)
            .on_conflict(OnConflict::column(Column::LockKey).do_nothing().to_owned())
            .do_nothing()
            .exec(conn)
            .await?;
        if matches!(inserted, TryInsertResult::Inserted(_)) {
            return Ok(true);
        }

        self.refresh(conn, key, holder, ttl).await
    }

    /// Extends a lease held by `holder`; false when it was lost.
    pub async fn refresh<C: ConnectionTrait>(
        &self,
        conn: &C,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, SyncError> {
        let result = Entity::update_many()
            .col_expr(Column::ExpiresAt, Expr::value((Utc::now() + ttl).fixed_offset()))
            .filter(Column::LockKey.eq(key))
            .filter(Column::Holder.eq(holder))
            .exec(conn)
            .await?;
        Ok(result.rows_affected == 1)
    }

    pub async fn release<C: ConnectionTrait>(
        &self,
        conn: &C,
        key: &str,
        holder: &str,
    ) -> Result<(), SyncError> {
        Entity::delete_many()
            .filter(Column::LockKey.eq(key))
            .filter(Column::Holder.eq(holder))
            .exec(conn)
            .await?;
        Ok(())
    }

    pub async fn find<C: ConnectionTrait>(&self, conn: &C, key: &str) -> Result<Option<Model>, SyncError> {
        Ok(Entity::find_by_id(key.to_string()).one(conn).await?)
    }
}
