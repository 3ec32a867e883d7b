//! Migration to create the local_records table backing `DbLocalStore`.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(LocalRecords::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LocalRecords::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(LocalRecords::TenantId).uuid().not_null())
                    .col(ColumnDef::new(LocalRecords::ObjectType).text().not_null())
                    .col(ColumnDef::new(LocalRecords::RecordId).text().not_null())
                    .col(ColumnDef::new(LocalRecords::Fields).json_binary().not_null())
                    .col(
                        ColumnDef::new(LocalRecords::Deleted)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(LocalRecords::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LocalRecords::CreatedAt)
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
                    .name("idx_local_records_record_key")
                    .table(LocalRecords::Table)
                    .col(LocalRecords::TenantId)
                    .col(LocalRecords::ObjectType)
                    .col(LocalRecords::RecordId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_local_records_tenant_object_updated")
                    .table(LocalRecords::Table)
                    .col(LocalRecords::TenantId)
                    .col(LocalRecords::ObjectType)
                    .col(LocalRecords::UpdatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_local_records_tenant_object_updated")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_index(Index::drop().name("idx_local_records_record_key").to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(LocalRecords::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum LocalRecords {
    Table,
    Id,
    TenantId,
    ObjectType,
    RecordId,
    Fields,
    Deleted,
    UpdatedAt,
    CreatedAt,
}
