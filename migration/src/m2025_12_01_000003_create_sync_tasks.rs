//! Migration to create the sync_tasks table.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncTasks::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(SyncTasks::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(SyncTasks::TenantId).uuid().not_null())
                    .col(ColumnDef::new(SyncTasks::ProjectId).uuid().not_null())
                    .col(ColumnDef::new(SyncTasks::TaskType).text().not_null())
                    .col(
                        ColumnDef::new(SyncTasks::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(SyncTasks::Progress)
                            .small_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(SyncTasks::CurrentStep).text().null())
                    .col(ColumnDef::new(SyncTasks::Checkpoint).json_binary().null())
                    .col(ColumnDef::new(SyncTasks::Config).json_binary().not_null())
                    .col(ColumnDef::new(SyncTasks::Result).json_binary().null())
                    .col(ColumnDef::new(SyncTasks::Error).json_binary().null())
                    .col(
                        ColumnDef::new(SyncTasks::CancelRequested)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(SyncTasks::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncTasks::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncTasks::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncTasks::FinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        // History listing is ordered newest first within a scope
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_sync_tasks_scope_created ON sync_tasks (tenant_id, project_id, created_at DESC, id DESC)".to_string(),
            ))
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_tasks_status")
                    .table(SyncTasks::Table)
                    .col(SyncTasks::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_sync_tasks_scope_created").to_owned())
            .await?;
        manager
            .drop_index(Index::drop().name("idx_sync_tasks_status").to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(SyncTasks::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncTasks {
    Table,
    Id,
    TenantId,
    ProjectId,
    TaskType,
    Status,
    Progress,
    CurrentStep,
    Checkpoint,
    Config,
    Result,
    Error,
    CancelRequested,
    CreatedAt,
    StartedAt,
    UpdatedAt,
    FinishedAt,
}
