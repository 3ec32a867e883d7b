//! Migration to create the sync_errors table.
//!
//! One row per failed record-level operation, carrying the retry schedule
//! consumed by the retry sweep.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncErrors::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncErrors::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SyncErrors::TenantId).uuid().not_null())
                    .col(ColumnDef::new(SyncErrors::JobId).uuid().null())
                    .col(ColumnDef::new(SyncErrors::ObjectType).text().not_null())
                    .col(ColumnDef::new(SyncErrors::Direction).text().not_null())
                    .col(ColumnDef::new(SyncErrors::LocalId).text().null())
                    .col(ColumnDef::new(SyncErrors::ExternalId).text().null())
                    .col(ColumnDef::new(SyncErrors::ErrorCode).text().not_null())
                    .col(ColumnDef::new(SyncErrors::ErrorMessage).text().not_null())
                    .col(
                        ColumnDef::new(SyncErrors::Status)
                            .text()
                            .not_null()
                            .default("pending_retry"),
                    )
                    .col(
                        ColumnDef::new(SyncErrors::RetryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(SyncErrors::MaxRetries).integer().not_null())
                    .col(
                        ColumnDef::new(SyncErrors::NextRetryAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncErrors::ResolvedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncErrors::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SyncErrors::UpdatedAt)
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
                    .name("idx_sync_errors_status_next_retry_at")
                    .table(SyncErrors::Table)
                    .col(SyncErrors::Status)
                    .col(SyncErrors::NextRetryAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_errors_tenant_id")
                    .table(SyncErrors::Table)
                    .col(SyncErrors::TenantId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_sync_errors_tenant_id").to_owned())
            .await?;
        manager
            .drop_index(
                Index::drop()
                    .name("idx_sync_errors_status_next_retry_at")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(SyncErrors::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncErrors {
    Table,
    Id,
    TenantId,
    JobId,
    ObjectType,
    Direction,
    LocalId,
    ExternalId,
    ErrorCode,
    ErrorMessage,
    Status,
    RetryCount,
    MaxRetries,
    NextRetryAt,
    ResolvedAt,
    CreatedAt,
    UpdatedAt,
}
