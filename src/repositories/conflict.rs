//! # Conflict Repository

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use uuid::Uuid;

use crate::directory::Scope;
use crate::models::sync_conflict::{ActiveModel, Column, Entity, Model};
use crate::sync::conflict::{ConflictCandidate, ConflictResolution};
use crate::sync::error::SyncError;

#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictRepository;

impl ConflictRepository {
    pub fn new() -> Self {
        Self
    }

    pub async fn record<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
        task_id: Uuid,
        candidate: &ConflictCandidate,
        strategy: &str,
        resolution: ConflictResolution,
    ) -> Result<Model, SyncError> {
        let now = Utc::now().fixed_offset();
        let resolved_at = (resolution != ConflictResolution::Pending).then_some(now);
        let row = ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(scope.tenant_id),
            project_id: Set(scope.project_id),
            task_id: Set(task_id),
            operation_id: Set(candidate.operation_id.clone()),
            entity_type: Set(candidate.entity_type.as_str().to_string()),
            entity_id: Set(candidate.entity_id.clone()),
            strategy: Set(strategy.to_string()),
            resolution: Set(resolution.as_str().to_string()),
            source_updated_at: Set(candidate.source_updated_at.map(|t| t.fixed_offset())),
            target_updated_at: Set(Some(candidate.target_updated_at.fixed_offset())),
            last_synced_at: Set(candidate.last_synced_at.map(|t| t.fixed_offset())),
            source_data: Set(candidate.source_data.clone()),
            target_data: Set(candidate.target_data.clone()),
            created_at: Set(now),
            resolved_at: Set(resolved_at),
        };
        Ok(row.insert(conn).await?)
    }

    pub async fn list<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
        resolution: Option<ConflictResolution>,
        task_id: Option<Uuid>,
        limit: u64,
    ) -> Result<Vec<Model>, SyncError> {
        let mut query = Entity::find()
            .filter(Column::TenantId.eq(scope.tenant_id))
            .filter(Column::ProjectId.eq(scope.project_id));
        if let Some(resolution) = resolution {
            query = query.filter(Column::Resolution.eq(resolution.as_str()));
        }
        if let Some(task_id) = task_id {
            query = query.filter(Column::TaskId.eq(task_id));
        }
        Ok(query
            .order_by_asc(Column::CreatedAt)
            .limit(limit)
            .all(conn)
            .await?)
    }

    pub async fn find_scoped<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
        id: Uuid,
    ) -> Result<Option<Model>, SyncError> {
        Ok(Entity::find_by_id(id)
            .filter(Column::TenantId.eq(scope.tenant_id))
            .filter(Column::ProjectId.eq(scope.project_id))
            .one(conn)
            .await?)
    }

    /// Resolves a pending conflict; false when it was already resolved.
    pub async fn resolve<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: Uuid,
        resolution: ConflictResolution,
    ) -> Result<bool, SyncError> {
        let result = Entity::update_many()
            .col_expr(Column::Resolution, Expr::value(resolution.as_str()))
            .col_expr(Column::ResolvedAt, Expr::value(Some(Utc::now().fixed_offset())))
            .filter(Column::Id.eq(id))
            .filter(Column::Resolution.eq(ConflictResolution::Pending.as_str()))
            .exec(conn)
            .await?;
        Ok(result.rows_affected == 1)
    }
}
