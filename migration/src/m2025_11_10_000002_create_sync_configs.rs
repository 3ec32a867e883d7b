//! Migration to create the sync_configs table.
//!
//! One row per (tenant, object type) holding direction, cadence and the
//! field-mapping rule set.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncConfigs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncConfigs::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SyncConfigs::TenantId).uuid().not_null())
                    .col(ColumnDef::new(SyncConfigs::ObjectType).text().not_null())
                    .col(ColumnDef::new(SyncConfigs::Direction).text().not_null())
                    .col(
                        ColumnDef::new(SyncConfigs::Enabled)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(SyncConfigs::FieldMappings)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncConfigs::CadenceMinutes)
                            .integer()
                            .not_null()
                            .default(15),
                    )
                    .col(
                        ColumnDef::new(SyncConfigs::LastRunAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncConfigs::DemandRequestedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncConfigs::SuspendedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncConfigs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SyncConfigs::UpdatedAt)
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
                    .name("idx_sync_configs_tenant_object")
                    .table(SyncConfigs::Table)
                    .col(SyncConfigs::TenantId)
                    .col(SyncConfigs::ObjectType)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_configs_enabled")
                    .table(SyncConfigs::Table)
                    .col(SyncConfigs::Enabled)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_sync_configs_enabled").to_owned())
            .await?;
        manager
            .drop_index(
                Index::drop()
                    .name("idx_sync_configs_tenant_object")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(SyncConfigs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncConfigs {
    Table,
    Id,
    TenantId,
    ObjectType,
    Direction,
    Enabled,
    FieldMappings,
    CadenceMinutes,
    LastRunAt,
    DemandRequestedAt,
    SuspendedAt,
    CreatedAt,
    UpdatedAt,
}
