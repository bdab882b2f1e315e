//! Migration to create the diff_staging scratch table.
//!
//! Rows only live for the duration of one relational-join comparison and are
//! partitioned by `session_id`.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(DiffStaging::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DiffStaging::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(DiffStaging::SessionId).text().not_null())
                    .col(ColumnDef::new(DiffStaging::Side).text().not_null())
                    .col(ColumnDef::new(DiffStaging::EntityType).text().not_null())
                    .col(ColumnDef::new(DiffStaging::EntityId).text().not_null())
                    .col(ColumnDef::new(DiffStaging::ParentId).text().null())
                    .col(ColumnDef::new(DiffStaging::Name).text().null())
                    .col(ColumnDef::new(DiffStaging::ContentHash).text().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_diff_staging_lookup")
                    .table(DiffStaging::Table)
                    .col(DiffStaging::SessionId)
                    .col(DiffStaging::Side)
                    .col(DiffStaging::EntityType)
                    .col(DiffStaging::EntityId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(DiffStaging::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum DiffStaging {
    Table,
    Id,
    SessionId,
    Side,
    EntityType,
    EntityId,
    ParentId,
    Name,
    ContentHash,
}
