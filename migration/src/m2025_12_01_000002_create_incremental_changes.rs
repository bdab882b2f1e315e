//! Migration to create the incremental_changes table.
//!
//! Holds raw deltas captured by source change fetches (or pushed through the
//! notify endpoint) until an incremental task consumes and marks them processed.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(IncrementalChanges::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(IncrementalChanges::Id)
                            .text()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(IncrementalChanges::TenantId).uuid().not_null())
                    .col(ColumnDef::new(IncrementalChanges::ProjectId).uuid().not_null())
                    .col(ColumnDef::new(IncrementalChanges::EntityType).text().not_null())
                    .col(ColumnDef::new(IncrementalChanges::EntityId).text().not_null())
                    .col(ColumnDef::new(IncrementalChanges::ChangeType).text().not_null())
                    .col(
                        ColumnDef::new(IncrementalChanges::ChangedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(IncrementalChanges::Payload).json_binary().null())
                    .col(ColumnDef::new(IncrementalChanges::Source).text().not_null())
                    .col(
                        ColumnDef::new(IncrementalChanges::Processed)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(IncrementalChanges::ProcessedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(IncrementalChanges::TaskId).uuid().null())
                    .col(
                        ColumnDef::new(IncrementalChanges::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_incremental_changes_scope_processed")
                    .table(IncrementalChanges::Table)
                    .col(IncrementalChanges::TenantId)
                    .col(IncrementalChanges::ProjectId)
                    .col(IncrementalChanges::Processed)
                    .col(IncrementalChanges::ChangedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(IncrementalChanges::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum IncrementalChanges {
    Table,
    Id,
    TenantId,
    ProjectId,
    EntityType,
    EntityId,
    ChangeType,
    ChangedAt,
    Payload,
    Source,
    Processed,
    ProcessedAt,
    TaskId,
    CreatedAt,
}
