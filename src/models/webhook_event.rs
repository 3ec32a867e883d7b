//! Inbound webhook event log, deduplicated on (tenant, event id).

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

use super::ObjectType;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "webhook_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub tenant_id: Uuid,

    /// CRM-assigned event id, or `sha256:<hex>` of the raw event when absent
    pub event_id: String,

    /// e.g. `contact.propertyChange`
    pub event_type: Option<String>,

    pub object_type: Option<ObjectType>,

    pub external_id: Option<String>,

    pub external_account_id: Option<String>,

    pub occurred_at: Option<DateTimeWithTimeZone>,

    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,

    pub status: WebhookEventStatus,

    pub outcome: Option<WebhookOutcome>,

    pub error_message: Option<String>,

    pub received_at: DateTimeWithTimeZone,

    pub processed_at: Option<DateTimeWithTimeZone>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "processed")]
    Processed,
    #[sea_orm(string_value = "failed")]
    Failed,
}

/// What processing a `processed` event did.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// The change was synced inline
    #[sea_orm(string_value = "applied")]
    Applied,
    /// Older than the state already applied for the object
    #[sea_orm(string_value = "stale")]
    Stale,
    /// No enabled inbound config for the object type
    #[sea_orm(string_value = "ignored")]
    Ignored,
    /// Deferred to a scoped sync job
    #[sea_orm(string_value = "enqueued")]
    Enqueued,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
