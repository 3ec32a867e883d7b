//! Migration to create the object_mappings table.
//!
//! A mapping correlates a local identifier with an external CRM identifier.
//! Both identifier spaces carry their own unique index per (tenant, object
//! type), so neither side can be claimed by two counterparts.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ObjectMappings::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ObjectMappings::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ObjectMappings::TenantId).uuid().not_null())
                    .col(ColumnDef::new(ObjectMappings::ObjectType).text().not_null())
                    .col(ColumnDef::new(ObjectMappings::LocalId).text().not_null())
                    .col(ColumnDef::new(ObjectMappings::ExternalId).text().not_null())
                    .col(
                        ColumnDef::new(ObjectMappings::LastDirection)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ObjectMappings::LastSyncedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ObjectMappings::SyncedVersionAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ObjectMappings::ExpiredAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(ObjectMappings::Metadata).json_binary().null())
                    .col(
                        ColumnDef::new(ObjectMappings::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ObjectMappings::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_object_mappings_local")
                    .table(ObjectMappings::Table)
                    .col(ObjectMappings::TenantId)
                    .col(ObjectMappings::ObjectType)
                    .col(ObjectMappings::LocalId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_object_mappings_external")
                    .table(ObjectMappings::Table)
                    .col(ObjectMappings::TenantId)
                    .col(ObjectMappings::ObjectType)
                    .col(ObjectMappings::ExternalId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_object_mappings_external").to_owned())
            .await?;
        manager
            .drop_index(Index::drop().name("idx_object_mappings_local").to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ObjectMappings::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ObjectMappings {
    Table,
    Id,
    TenantId,
    ObjectType,
    LocalId,
    ExternalId,
    LastDirection,
    LastSyncedAt,
    SyncedVersionAt,
    ExpiredAt,
    Metadata,
    CreatedAt,
    UpdatedAt,
}
