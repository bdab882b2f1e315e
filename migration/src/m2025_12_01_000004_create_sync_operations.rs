//! Migration to create the sync_operations table.
//!
//! Operation ids are deterministic hashes so re-planning the same task inserts
//! nothing new, which makes the table usable as the durable work queue.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncOperations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncOperations::Id)
                            .text()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SyncOperations::TaskId).uuid().not_null())
                    .col(ColumnDef::new(SyncOperations::TenantId).uuid().not_null())
                    .col(ColumnDef::new(SyncOperations::ProjectId).uuid().not_null())
                    .col(ColumnDef::new(SyncOperations::EntityType).text().not_null())
                    .col(ColumnDef::new(SyncOperations::EntityId).text().not_null())
                    .col(ColumnDef::new(SyncOperations::OperationType).text().not_null())
                    .col(ColumnDef::new(SyncOperations::Data).json_binary().not_null())
                    .col(
                        ColumnDef::new(SyncOperations::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(SyncOperations::Priority)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncOperations::Sequence)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(SyncOperations::Queue).text().not_null())
                    .col(ColumnDef::new(SyncOperations::Batch).integer().null())
                    .col(
                        ColumnDef::new(SyncOperations::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncOperations::NextAttemptAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(SyncOperations::ClaimedBy).text().null())
                    .col(
                        ColumnDef::new(SyncOperations::ClaimedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(SyncOperations::Result).json_binary().null())
                    .col(ColumnDef::new(SyncOperations::Error).json_binary().null())
                    .col(
                        ColumnDef::new(SyncOperations::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncOperations::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_operations_task_status_priority")
                    .table(SyncOperations::Table)
                    .col(SyncOperations::TaskId)
                    .col(SyncOperations::Status)
                    .col(SyncOperations::Priority)
                    .col(SyncOperations::Sequence)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_operations_task_queue")
                    .table(SyncOperations::Table)
                    .col(SyncOperations::TaskId)
                    .col(SyncOperations::Queue)
                    .col(SyncOperations::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SyncOperations::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncOperations {
    Table,
    Id,
    TaskId,
    TenantId,
    ProjectId,
    EntityType,
    EntityId,
    OperationType,
    Data,
    Status,
    Priority,
    Sequence,
    Queue,
    Batch,
    Attempts,
    NextAttemptAt,
    ClaimedBy,
    ClaimedAt,
    Result,
    Error,
    CreatedAt,
    UpdatedAt,
}
