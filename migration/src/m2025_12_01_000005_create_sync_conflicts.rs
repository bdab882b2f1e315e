//! Migration to create the sync_conflicts table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncConflicts::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncConflicts::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SyncConflicts::TenantId).uuid().not_null())
                    .col(ColumnDef::new(SyncConflicts::ProjectId).uuid().not_null())
                    .col(ColumnDef::new(SyncConflicts::TaskId).uuid().not_null())
                    .col(ColumnDef::new(SyncConflicts::OperationId).text().not_null())
                    .col(ColumnDef::new(SyncConflicts::EntityType).text().not_null())
                    .col(ColumnDef::new(SyncConflicts::EntityId).text().not_null())
                    .col(ColumnDef::new(SyncConflicts::Strategy).text().not_null())
                    .col(ColumnDef::new(SyncConflicts::Resolution).text().not_null())
                    .col(
                        ColumnDef::new(SyncConflicts::SourceUpdatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncConflicts::TargetUpdatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncConflicts::LastSyncedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(SyncConflicts::SourceData).json_binary().null())
                    .col(ColumnDef::new(SyncConflicts::TargetData).json_binary().null())
                    .col(
                        ColumnDef::new(SyncConflicts::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncConflicts::ResolvedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_conflicts_operation")
                    .table(SyncConflicts::Table)
                    .col(SyncConflicts::OperationId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_conflicts_scope_resolution")
                    .table(SyncConflicts::Table)
                    .col(SyncConflicts::TenantId)
                    .col(SyncConflicts::ProjectId)
                    .col(SyncConflicts::Resolution)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SyncConflicts::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncConflicts {
    Table,
    Id,
    TenantId,
    ProjectId,
    TaskId,
    OperationId,
    EntityType,
    EntityId,
    Strategy,
    Resolution,
    SourceUpdatedAt,
    TargetUpdatedAt,
    LastSyncedAt,
    SourceData,
    TargetData,
    CreatedAt,
    ResolvedAt,
}
