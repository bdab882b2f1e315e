//! # Operation Repository
//!
//! Persists planned operations and implements the executor's state
//! transitions. `claim` is the single atomic `pending -> running` step that
//! keeps concurrent workers from dispatching the same operation twice.

use chrono::{DateTime, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, Condition, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::directory::Scope;
use crate::models::sync_operation::{ActiveModel, Column, Entity, Model};
use crate::sync::error::SyncError;
use crate::sync::operation::{OperationStatus, PlannedOperation, operation_id, queue_for};
use crate::sync::task::OperationCounts;

const INSERT_CHUNK: usize = 200;

#[derive(Debug, Clone, Copy, Default)]
pub struct OperationRepository;

impl OperationRepository {
    pub fn new() -> Self {
        Self
    }

    /// Inserts the plan; rows whose id already exists are left untouched so
    /// re-planning a resumed task never resets finished work. Returns the ids
    /// in plan order.
    pub async fn insert_planned<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
        task_id: Uuid,
        operations: &[PlannedOperation],
        batch_size: Option<u32>,
    ) -> Result<Vec<String>, SyncError> {
        let now = Utc::now().fixed_offset();
        let mut ids = Vec::with_capacity(operations.len());
        let mut rows = Vec::with_capacity(operations.len());

        for (sequence, op) in operations.iter().enumerate() {
            let id = operation_id(scope, task_id, op.entity_type, &op.entity_id, op.operation_type);
            let batch = batch_size
                .filter(|size| *size > 0)
                .map(|size| (sequence / size as usize) as i32);
            rows.push(ActiveModel {
                id: Set(id.clone()),
                task_id: Set(task_id),
                tenant_id: Set(scope.tenant_id),
                project_id: Set(scope.project_id),
                entity_type: Set(op.entity_type.as_str().to_string()),
                entity_id: Set(op.entity_id.clone()),
                operation_type: Set(op.operation_type.as_str().to_string()),
                data: Set(op.data.clone()),
                status: Set(OperationStatus::Pending.as_str().to_string()),
                priority: Set(op.priority),
                sequence: Set(sequence as i64),
                queue: Set(queue_for(op.entity_type).to_string()),
                batch: Set(batch),
                attempts: Set(0),
                next_attempt_at: Set(None),
                claimed_by: Set(None),
                claimed_at: Set(None),
                result: Set(None),
                error: Set(None),
                created_at: Set(now),
                updated_at: Set(now),
            });
            ids.push(id);
        }

        let mut pending = rows.into_iter().peekable();
        while pending.peek().is_some() {
            let chunk: Vec<ActiveModel> = pending.by_ref().take(INSERT_CHUNK).collect();
            Entity::insert_many(chunk)
                .on_conflict(OnConflict::column(Column::Id).do_nothing().to_owned())
                .do_nothing()
                .exec(conn)
                .await?;
        }

        Ok(ids)
    }

    pub async fn find<C: ConnectionTrait>(&self, conn: &C, id: &str) -> Result<Option<Model>, SyncError> {
        Ok(Entity::find_by_id(id.to_string()).one(conn).await?)
    }

    /// Operations of a task in execution order.
    pub async fn for_task<C: ConnectionTrait>(
        &self,
        conn: &C,
        task_id: Uuid,
        status: Option<OperationStatus>,
    ) -> Result<Vec<Model>, SyncError> {
        let mut query = Entity::find().filter(Column::TaskId.eq(task_id));
        if let Some(status) = status {
            query = query.filter(Column::Status.eq(status.as_str()));
        }
        Ok(query
            .order_by_asc(Column::Priority)
            .order_by_asc(Column::Sequence)
            .all(conn)
            .await?)
    }

    pub async fn count_for_task<C: ConnectionTrait>(&self, conn: &C, task_id: Uuid) -> Result<u64, SyncError> {
        Ok(Entity::find()
            .filter(Column::TaskId.eq(task_id))
            .count(conn)
            .await?)
    }

    pub async fn counts<C: ConnectionTrait>(
        &self,
        conn: &C,
        task_id: Uuid,
    ) -> Result<OperationCounts, SyncError> {
        let rows: Vec<(String, i64)> = Entity::find()
            .select_only()
            .column(Column::Status)
            .column_as(Expr::col(Column::Id).count(), "n")
            .filter(Column::TaskId.eq(task_id))
            .group_by(Column::Status)
            .into_tuple()
            .all(conn)
            .await?;

        let mut counts = OperationCounts::default();
        for (status, n) in rows {
            let n = n.max(0) as u64;
            counts.total += n;
            match status.parse::<OperationStatus>() {
                Ok(OperationStatus::Completed) => counts.completed += n,
                Ok(OperationStatus::Skipped) => counts.skipped += n,
                Ok(OperationStatus::Failed) => counts.failed += n,
                Ok(OperationStatus::Paused) => counts.paused += n,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Atomic `pending -> running`; false when another worker already holds it.
    pub async fn claim<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: &str,
        worker: &str,
    ) -> Result<bool, SyncError> {
        let now = Utc::now().fixed_offset();
        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(OperationStatus::Running.as_str()))
            .col_expr(Column::ClaimedBy, Expr::value(Some(worker.to_string())))
            .col_expr(Column::ClaimedAt, Expr::value(Some(now)))
            .col_expr(Column::Attempts, Expr::col(Column::Attempts).add(1))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(OperationStatus::Pending.as_str()))
            .exec(conn)
            .await?;
        Ok(result.rows_affected == 1)
    }

    pub async fn complete<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: &str,
        result: JsonValue,
    ) -> Result<(), SyncError> {
        Entity::update_many()
            .col_expr(Column::Status, Expr::value(OperationStatus::Completed.as_str()))
            .col_expr(Column::Result, Expr::value(Some(result)))
            .col_expr(Column::Error, Expr::value(Option::<JsonValue>::None))
            .col_expr(Column::NextAttemptAt, Expr::value(Option::<DateTimeWithTimeZone>::None))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(OperationStatus::Running.as_str()))
            .exec(conn)
            .await?;
        Ok(())
    }

    /// Returns a running operation to the queue for a later attempt.
    pub async fn schedule_retry<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: &str,
        next_attempt_at: DateTime<Utc>,
        error: JsonValue,
    ) -> Result<(), SyncError> {
        Entity::update_many()
            .col_expr(Column::Status, Expr::value(OperationStatus::Pending.as_str()))
            .col_expr(Column::NextAttemptAt, Expr::value(Some(next_attempt_at.fixed_offset())))
            .col_expr(Column::Error, Expr::value(Some(error)))
            .col_expr(Column::ClaimedBy, Expr::value(Option::<String>::None))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(OperationStatus::Running.as_str()))
            .exec(conn)
            .await?;
        Ok(())
    }

    pub async fn fail<C: ConnectionTrait>(&self, conn: &C, id: &str, error: JsonValue) -> Result<(), SyncError> {
        Entity::update_many()
            .col_expr(Column::Status, Expr::value(OperationStatus::Failed.as_str()))
            .col_expr(Column::Error, Expr::value(Some(error)))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(OperationStatus::Running.as_str()))
            .exec(conn)
            .await?;
        Ok(())
    }

    /// Conditional status change outside the claim path (pause, skip, requeue).
    pub async fn transition<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: &str,
        from: &[OperationStatus],
        to: OperationStatus,
    ) -> Result<bool, SyncError> {
        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(to.as_str()))
            .col_expr(Column::NextAttemptAt, Expr::value(Option::<DateTimeWithTimeZone>::None))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.is_in(from.iter().map(|s| s.as_str())))
            .exec(conn)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Next claimable operation of one tier and queue.
    pub async fn next_ready<C: ConnectionTrait>(
        &self,
        conn: &C,
        task_id: Uuid,
        priority: i32,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Model>, SyncError> {
        Ok(Entity::find()
            .filter(Column::TaskId.eq(task_id))
            .filter(Column::Priority.eq(priority))
            .filter(Column::Queue.eq(queue))
            .filter(Column::Status.eq(OperationStatus::Pending.as_str()))
            .filter(
                Condition::any()
                    .add(Column::NextAttemptAt.is_null())
                    .add(Column::NextAttemptAt.lte(now.fixed_offset())),
            )
            .order_by_asc(Column::Sequence)
            .one(conn)
            .await?)
    }

    /// Pending or running operations left in one tier and queue.
    pub async fn unfinished<C: ConnectionTrait>(
        &self,
        conn: &C,
        task_id: Uuid,
        priority: i32,
        queue: &str,
    ) -> Result<u64, SyncError> {
        Ok(Entity::find()
            .filter(Column::TaskId.eq(task_id))
            .filter(Column::Priority.eq(priority))
            .filter(Column::Queue.eq(queue))
            .filter(Column::Status.is_in([
                OperationStatus::Pending.as_str(),
                OperationStatus::Running.as_str(),
            ]))
            .count(conn)
            .await?)
    }

    /// Returns stale `running` claims of a task to `pending`, attempts preserved.
    pub async fn reap_running<C: ConnectionTrait>(&self, conn: &C, task_id: Uuid) -> Result<u64, SyncError> {
        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(OperationStatus::Pending.as_str()))
            .col_expr(Column::ClaimedBy, Expr::value(Option::<String>::None))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::TaskId.eq(task_id))
            .filter(Column::Status.eq(OperationStatus::Running.as_str()))
            .exec(conn)
            .await?;
        Ok(result.rows_affected)
    }

    /// Hands a running operation held by `worker` back to pending.
    pub async fn release_claim<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: &str,
        worker: &str,
    ) -> Result<bool, SyncError> {
        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(OperationStatus::Pending.as_str()))
            .col_expr(Column::ClaimedBy, Expr::value(Option::<String>::None))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(OperationStatus::Running.as_str()))
            .filter(Column::ClaimedBy.eq(worker))
            .exec(conn)
            .await?;
        Ok(result.rows_affected == 1)
    }
}
