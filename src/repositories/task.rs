//! # SyncTask Repository
//!
//! Tenant/project-scoped access to `sync_tasks`. Status transitions are
//! conditional updates so two workers can never both claim a task.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::directory::Scope;
use crate::models::sync_task::{ActiveModel, Column, Entity, Model};
use crate::sync::error::SyncError;
use crate::sync::task::{TaskStatus, TaskType};

/// Filters for the task history listing.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub task_type: Option<TaskType>,
    pub status: Option<TaskStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TaskRepository;

impl TaskRepository {
    pub fn new() -> Self {
        Self
    }

    pub async fn create<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
        task_type: TaskType,
        config: JsonValue,
    ) -> Result<Model, SyncError> {
        let now = Utc::now().fixed_offset();
        let task = ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(scope.tenant_id),
            project_id: Set(scope.project_id),
            task_type: Set(task_type.as_str().to_string()),
            status: Set(TaskStatus::Pending.as_str().to_string()),
            progress: Set(0),
            current_step: Set(None),
            checkpoint: Set(None),
            config: Set(config),
            result: Set(None),
            error: Set(None),
            cancel_requested: Set(false),
            created_at: Set(now),
            started_at: Set(None),
            updated_at: Set(now),
            finished_at: Set(None),
        };
        let model = task.insert(conn).await?;
        tracing::info!(
            task_id = %model.id,
            scope = %scope,
            task_type = %task_type,
            "sync task created"
        );
        Ok(model)
    }

    pub async fn find_by_id<C: ConnectionTrait>(
        &self,
        conn: &C,
        task_id: Uuid,
    ) -> Result<Option<Model>, SyncError> {
        Ok(Entity::find_by_id(task_id).one(conn).await?)
    }

    /// Finds a task only when it belongs to `scope`.
    pub async fn find_scoped<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
        task_id: Uuid,
    ) -> Result<Option<Model>, SyncError> {
        Ok(Entity::find_by_id(task_id)
            .filter(Column::TenantId.eq(scope.tenant_id))
            .filter(Column::ProjectId.eq(scope.project_id))
            .one(conn)
            .await?)
    }

    /// Newest first, keyset-paginated on `(created_at, id)`.
    pub async fn list<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
        filter: &TaskFilter,
        after: Option<(DateTime<Utc>, Uuid)>,
        limit: u64,
    ) -> Result<Vec<Model>, SyncError> {
        let mut query = Entity::find()
            .filter(Column::TenantId.eq(scope.tenant_id))
            .filter(Column::ProjectId.eq(scope.project_id));

        if let Some(task_type) = filter.task_type {
            query = query.filter(Column::TaskType.eq(task_type.as_str()));
        }
        if let Some(status) = filter.status {
            query = query.filter(Column::Status.eq(status.as_str()));
        }
        if let Some(from) = filter.created_after {
            query = query.filter(Column::CreatedAt.gte(from.fixed_offset()));
        }
        if let Some(to) = filter.created_before {
            query = query.filter(Column::CreatedAt.lt(to.fixed_offset()));
        }
        if let Some((created_at, id)) = after {
            let created_at = created_at.fixed_offset();
            query = query.filter(
                Condition::any()
                    .add(Column::CreatedAt.lt(created_at))
                    .add(
                        Condition::all()
                            .add(Column::CreatedAt.eq(created_at))
                            .add(Column::Id.lt(id)),
                    ),
            );
        }

        Ok(query
            .order_by_desc(Column::CreatedAt)
            .order_by_desc(Column::Id)
            .limit(limit)
            .all(conn)
            .await?)
    }

    /// Moves a task from one of `from` to `to`; false when another writer got there first.
    pub async fn transition<C: ConnectionTrait>(
        &self,
        conn: &C,
        task_id: Uuid,
        from: &[TaskStatus],
        to: TaskStatus,
    ) -> Result<bool, SyncError> {
        let now = Utc::now().fixed_offset();
        let mut update = Entity::update_many()
            .col_expr(Column::Status, Expr::value(to.as_str()))
            .col_expr(Column::UpdatedAt, Expr::value(now));
        if to == TaskStatus::Running {
            update = update.col_expr(Column::StartedAt, Expr::value(Some(now)));
        }
        if to == TaskStatus::Pending {
            update = update.col_expr(Column::CancelRequested, Expr::value(false));
        }
        let result = update
            .filter(Column::Id.eq(task_id))
            .filter(Column::Status.is_in(from.iter().map(|s| s.as_str())))
            .exec(conn)
            .await?;
        Ok(result.rows_affected == 1)
    }

    pub async fn save_progress<C: ConnectionTrait>(
        &self,
        conn: &C,
        task_id: Uuid,
        step: &str,
        progress: i16,
        checkpoint: Option<JsonValue>,
    ) -> Result<(), SyncError> {
        let mut update = Entity::update_many()
            .col_expr(Column::CurrentStep, Expr::value(Some(step.to_string())))
            .col_expr(Column::Progress, Expr::value(progress.clamp(0, 100)))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()));
        if let Some(checkpoint) = checkpoint {
            update = update.col_expr(Column::Checkpoint, Expr::value(Some(checkpoint)));
        }
        update.filter(Column::Id.eq(task_id)).exec(conn).await?;
        Ok(())
    }

    /// Writes the terminal (or paused) state of a task.
    pub async fn finish<C: ConnectionTrait>(
        &self,
        conn: &C,
        task_id: Uuid,
        status: TaskStatus,
        result: Option<JsonValue>,
        error: Option<JsonValue>,
    ) -> Result<(), SyncError> {
        let now = Utc::now().fixed_offset();
        let mut update = Entity::update_many()
            .col_expr(Column::Status, Expr::value(status.as_str()))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .col_expr(Column::Result, Expr::value(result))
            .col_expr(Column::Error, Expr::value(error));
        if status.is_terminal() {
            update = update
                .col_expr(Column::FinishedAt, Expr::value(Some(now)))
                .col_expr(Column::Progress, Expr::value(100i16));
        }
        update.filter(Column::Id.eq(task_id)).exec(conn).await?;
        Ok(())
    }

    pub async fn request_cancel<C: ConnectionTrait>(
        &self,
        conn: &C,
        task_id: Uuid,
    ) -> Result<(), SyncError> {
        Entity::update_many()
            .col_expr(Column::CancelRequested, Expr::value(true))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(task_id))
            .exec(conn)
            .await?;
        Ok(())
    }

    pub async fn cancel_requested<C: ConnectionTrait>(
        &self,
        conn: &C,
        task_id: Uuid,
    ) -> Result<bool, SyncError> {
        Ok(self
            .find_by_id(conn, task_id)
            .await?
            .is_some_and(|task| task.cancel_requested))
    }

    pub async fn with_status<C: ConnectionTrait>(
        &self,
        conn: &C,
        status: TaskStatus,
    ) -> Result<Vec<Model>, SyncError> {
        Ok(Entity::find()
            .filter(Column::Status.eq(status.as_str()))
            .order_by_asc(Column::CreatedAt)
            .all(conn)
            .await?)
    }

    /// Most recent completed incremental tasks of a scope, newest first.
    pub async fn recent_completed_incremental<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
        limit: u64,
    ) -> Result<Vec<Model>, SyncError> {
        Ok(Entity::find()
            .filter(Column::TenantId.eq(scope.tenant_id))
            .filter(Column::ProjectId.eq(scope.project_id))
            .filter(Column::TaskType.eq(TaskType::Incremental.as_str()))
            .filter(Column::Status.eq(TaskStatus::Completed.as_str()))
            .order_by_desc(Column::FinishedAt)
            .order_by_desc(Column::CreatedAt)
            .limit(limit)
            .all(conn)
            .await?)
    }
}
