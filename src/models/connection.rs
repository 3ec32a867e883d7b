//! CRM connection entity
//!
//! One OAuth authorization per tenant against the external CRM. Tokens are
//! stored sealed (see `crate::crypto`); only the credential store opens them.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "crm_connections")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub tenant_id: Uuid,

    /// CRM account (HubSpot portal) identifier
    pub external_account_id: String,

    pub external_domain: Option<String>,

    pub status: ConnectionStatus,

    pub access_token_ciphertext: Vec<u8>,

    pub refresh_token_ciphertext: Option<Vec<u8>>,

    /// Access token expiry; `None` means the token does not expire
    pub expires_at: Option<DateTimeWithTimeZone>,

    /// Granted OAuth scopes as a JSON array of strings
    #[sea_orm(column_type = "JsonBinary")]
    pub scopes: JsonValue,

    /// Incremented on every successful refresh; used to coalesce concurrent refreshes
    pub token_version: i32,

    /// Consecutive 401s observed after a refresh
    pub auth_failures: i32,

    /// Workspace user who completed the OAuth flow
    pub connected_by: Option<Uuid>,

    pub last_sync_at: Option<DateTimeWithTimeZone>,

    pub deactivated_at: Option<DateTimeWithTimeZone>,

    pub deactivation_reason: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "deactivated")]
    Deactivated,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_active(&self) -> bool {
        self.status == ConnectionStatus::Active
    }

    pub fn scope_list(&self) -> Vec<String> {
        serde_json::from_value(self.scopes.clone()).unwrap_or_default()
    }
}
