//! Migration to create the crm_connections table.
//!
//! Stores one OAuth authorization per tenant against the external CRM. Tokens are
//! kept as AES-GCM ciphertext. A partial unique index allows any number of
//! deactivated rows but at most one active row per tenant.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

const ACTIVE_TENANT_INDEX: &str = "idx_crm_connections_active_tenant";

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CrmConnections::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CrmConnections::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(CrmConnections::TenantId).uuid().not_null())
                    .col(
                        ColumnDef::new(CrmConnections::ExternalAccountId)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(CrmConnections::ExternalDomain).text().null())
                    .col(
                        ColumnDef::new(CrmConnections::Status)
                            .text()
                            .not_null()
                            .default("active"),
                    )
                    .col(
                        ColumnDef::new(CrmConnections::AccessTokenCiphertext)
                            .binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CrmConnections::RefreshTokenCiphertext)
                            .binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CrmConnections::ExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(CrmConnections::Scopes).json_binary().not_null())
                    .col(
                        ColumnDef::new(CrmConnections::TokenVersion)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(CrmConnections::AuthFailures)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(CrmConnections::ConnectedBy).uuid().null())
                    .col(
                        ColumnDef::new(CrmConnections::LastSyncAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CrmConnections::DeactivatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CrmConnections::DeactivationReason)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CrmConnections::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(CrmConnections::UpdatedAt)
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
                    .name("idx_crm_connections_tenant_id")
                    .table(CrmConnections::Table)
                    .col(CrmConnections::TenantId)
                    .to_owned(),
            )
            .await?;

        let backend = manager.get_database_backend();
        manager
            .get_connection()
            .execute(Statement::from_string(
                backend,
                format!(
                    "CREATE UNIQUE INDEX IF NOT EXISTS {ACTIVE_TENANT_INDEX} \
                     ON crm_connections (tenant_id) WHERE status = 'active'"
                ),
            ))
            .await
            .map(|_| ())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                format!("DROP INDEX IF EXISTS {ACTIVE_TENANT_INDEX}"),
            ))
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_crm_connections_tenant_id")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(CrmConnections::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum CrmConnections {
    Table,
    Id,
    TenantId,
    ExternalAccountId,
    ExternalDomain,
    Status,
    AccessTokenCiphertext,
    RefreshTokenCiphertext,
    ExpiresAt,
    Scopes,
    TokenVersion,
    AuthFailures,
    ConnectedBy,
    LastSyncAt,
    DeactivatedAt,
    DeactivationReason,
    CreatedAt,
    UpdatedAt,
}
