//! Migration to create webhook_events and webhook_object_states.
//!
//! `webhook_events` is the inbound log, deduplicated on the CRM event id.
//! `webhook_object_states` records the newest applied change per external
//! object so out-of-order deliveries can be recognised as stale.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(WebhookEvents::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(WebhookEvents::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(WebhookEvents::TenantId).uuid().not_null())
                    .col(ColumnDef::new(WebhookEvents::EventId).text().not_null())
                    .col(ColumnDef::new(WebhookEvents::EventType).text().null())
                    .col(ColumnDef::new(WebhookEvents::ObjectType).text().null())
                    .col(ColumnDef::new(WebhookEvents::ExternalId).text().null())
                    .col(
                        ColumnDef::new(WebhookEvents::ExternalAccountId)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(WebhookEvents::OccurredAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(WebhookEvents::Payload).json_binary().not_null())
                    .col(
                        ColumnDef::new(WebhookEvents::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(WebhookEvents::Outcome).text().null())
                    .col(ColumnDef::new(WebhookEvents::ErrorMessage).text().null())
                    .col(
                        ColumnDef::new(WebhookEvents::ReceivedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(WebhookEvents::ProcessedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_webhook_events_tenant_event")
                    .table(WebhookEvents::Table)
                    .col(WebhookEvents::TenantId)
                    .col(WebhookEvents::EventId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(WebhookObjectStates::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(WebhookObjectStates::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(WebhookObjectStates::TenantId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WebhookObjectStates::ObjectType)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WebhookObjectStates::ExternalId)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WebhookObjectStates::LastAppliedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WebhookObjectStates::UpdatedAt)
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
                    .name("idx_webhook_object_states_key")
                    .table(WebhookObjectStates::Table)
                    .col(WebhookObjectStates::TenantId)
                    .col(WebhookObjectStates::ObjectType)
                    .col(WebhookObjectStates::ExternalId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_webhook_object_states_key")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(WebhookObjectStates::Table).to_owned())
            .await?;
        manager
            .drop_index(
                Index::drop()
                    .name("idx_webhook_events_tenant_event")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(WebhookEvents::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum WebhookEvents {
    Table,
    Id,
    TenantId,
    EventId,
    EventType,
    ObjectType,
    ExternalId,
    ExternalAccountId,
    OccurredAt,
    Payload,
    Status,
    Outcome,
    ErrorMessage,
    ReceivedAt,
    ProcessedAt,
}

#[derive(DeriveIden)]
enum WebhookObjectStates {
    Table,
    Id,
    TenantId,
    ObjectType,
    ExternalId,
    LastAppliedAt,
    UpdatedAt,
}
