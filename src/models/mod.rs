//! # Data Models
//!
//! SeaORM entities for the sync core plus the enums shared between them.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod connection;
pub mod local_record;
pub mod object_mapping;
pub mod sync_config;
pub mod sync_error;
pub mod sync_job;
pub mod webhook_event;
pub mod webhook_object_state;

pub use connection::Entity as Connection;
pub use object_mapping::Entity as ObjectMapping;
pub use sync_config::Entity as SyncConfig;
pub use sync_error::Entity as SyncError;
pub use sync_job::Entity as SyncJob;
pub use webhook_event::Entity as WebhookEvent;

/// Synchronized object categories.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    #[sea_orm(string_value = "contact")]
    Contact,
    #[sea_orm(string_value = "company")]
    Company,
    #[sea_orm(string_value = "deal")]
    Deal,
    /// Notes, calls and meetings on the CRM side.
    #[sea_orm(string_value = "activity")]
    Activity,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Contact => "contact",
            ObjectType::Company => "company",
            ObjectType::Deal => "deal",
            ObjectType::Activity => "activity",
        }
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ObjectType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "contact" | "contacts" => Ok(ObjectType::Contact),
            "company" | "companies" => Ok(ObjectType::Company),
            "deal" | "deals" => Ok(ObjectType::Deal),
            "activity" | "activities" | "note" | "notes" => Ok(ObjectType::Activity),
            other => Err(format!("unknown object type '{other}'")),
        }
    }
}

/// Which way data flows for a config, a job, or a single write.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    #[sea_orm(string_value = "to_external")]
    ToExternal,
    #[sea_orm(string_value = "from_external")]
    FromExternal,
    #[sea_orm(string_value = "bidirectional")]
    Bidirectional,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::ToExternal => "to_external",
            SyncDirection::FromExternal => "from_external",
            SyncDirection::Bidirectional => "bidirectional",
        }
    }

    /// Local changes are propagated to the CRM.
    pub fn pushes(&self) -> bool {
        matches!(self, SyncDirection::ToExternal | SyncDirection::Bidirectional)
    }

    /// CRM changes are propagated locally.
    pub fn pulls(&self) -> bool {
        matches!(self, SyncDirection::FromExternal | SyncDirection::Bidirectional)
    }
}

impl std::fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    pub service: String,
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "crm-sync".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
