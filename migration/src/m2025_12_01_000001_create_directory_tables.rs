//! Migration to create the intermediate directory store.
//!
//! Creates the organizations, users and memberships tables. Every row is scoped by
//! `(tenant_id, project_id)` and keyed by the upstream `external_id`; deletions are
//! soft (`deleted` / `deleted_at`) so the diff engine can emit target deletes.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Organizations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Organizations::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Organizations::TenantId).uuid().not_null())
                    .col(ColumnDef::new(Organizations::ProjectId).uuid().not_null())
                    .col(ColumnDef::new(Organizations::ExternalId).text().not_null())
                    .col(ColumnDef::new(Organizations::ParentId).text().null())
                    .col(ColumnDef::new(Organizations::Name).text().not_null())
                    .col(ColumnDef::new(Organizations::Code).text().null())
                    .col(
                        ColumnDef::new(Organizations::SortOrder)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Organizations::Status)
                            .text()
                            .not_null()
                            .default("active"),
                    )
                    .col(ColumnDef::new(Organizations::Extra).json_binary().not_null())
                    .col(ColumnDef::new(Organizations::ContentHash).text().not_null())
                    .col(
                        ColumnDef::new(Organizations::SourceUpdatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Organizations::Synced)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Organizations::Deleted)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Organizations::DeletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Organizations::LastSyncedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Organizations::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Organizations::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_organizations_scope_external_id")
                    .table(Organizations::Table)
                    .col(Organizations::TenantId)
                    .col(Organizations::ProjectId)
                    .col(Organizations::ExternalId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Users::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Users::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Users::TenantId).uuid().not_null())
                    .col(ColumnDef::new(Users::ProjectId).uuid().not_null())
                    .col(ColumnDef::new(Users::ExternalId).text().not_null())
                    .col(ColumnDef::new(Users::Username).text().not_null())
                    .col(ColumnDef::new(Users::DisplayName).text().not_null())
                    .col(ColumnDef::new(Users::Email).text().null())
                    .col(ColumnDef::new(Users::Mobile).text().null())
                    .col(
                        ColumnDef::new(Users::Status)
                            .text()
                            .not_null()
                            .default("active"),
                    )
                    .col(ColumnDef::new(Users::Extra).json_binary().not_null())
                    .col(ColumnDef::new(Users::ContentHash).text().not_null())
                    .col(
                        ColumnDef::new(Users::SourceUpdatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Users::Synced)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Users::Deleted)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Users::DeletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Users::LastSyncedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Users::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Users::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_users_scope_external_id")
                    .table(Users::Table)
                    .col(Users::TenantId)
                    .col(Users::ProjectId)
                    .col(Users::ExternalId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_users_scope_username")
                    .table(Users::Table)
                    .col(Users::TenantId)
                    .col(Users::ProjectId)
                    .col(Users::Username)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Memberships::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Memberships::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Memberships::TenantId).uuid().not_null())
                    .col(ColumnDef::new(Memberships::ProjectId).uuid().not_null())
                    .col(ColumnDef::new(Memberships::ExternalId).text().not_null())
                    .col(ColumnDef::new(Memberships::OrgId).text().not_null())
                    .col(ColumnDef::new(Memberships::UserId).text().not_null())
                    .col(
                        ColumnDef::new(Memberships::IsPrimary)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Memberships::Position).text().null())
                    .col(ColumnDef::new(Memberships::Extra).json_binary().not_null())
                    .col(ColumnDef::new(Memberships::ContentHash).text().not_null())
                    .col(
                        ColumnDef::new(Memberships::SourceUpdatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Memberships::Synced)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Memberships::Deleted)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Memberships::DeletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Memberships::LastSyncedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Memberships::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Memberships::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_memberships_scope_external_id")
                    .table(Memberships::Table)
                    .col(Memberships::TenantId)
                    .col(Memberships::ProjectId)
                    .col(Memberships::ExternalId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_memberships_scope_user")
                    .table(Memberships::Table)
                    .col(Memberships::TenantId)
                    .col(Memberships::ProjectId)
                    .col(Memberships::UserId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Memberships::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Users::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Organizations::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Organizations {
    Table,
    Id,
    TenantId,
    ProjectId,
    ExternalId,
    ParentId,
    Name,
    Code,
    SortOrder,
    Status,
    Extra,
    ContentHash,
    SourceUpdatedAt,
    Synced,
    Deleted,
    DeletedAt,
    LastSyncedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Users {
    Table,
    Id,
    TenantId,
    ProjectId,
    ExternalId,
    Username,
    DisplayName,
    Email,
    Mobile,
    Status,
    Extra,
    ContentHash,
    SourceUpdatedAt,
    Synced,
    Deleted,
    DeletedAt,
    LastSyncedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Memberships {
    Table,
    Id,
    TenantId,
    ProjectId,
    ExternalId,
    OrgId,
    UserId,
    IsPrimary,
    Position,
    Extra,
    ContentHash,
    SourceUpdatedAt,
    Synced,
    Deleted,
    DeletedAt,
    LastSyncedAt,
    CreatedAt,
    UpdatedAt,
}
