//! Object mapping entity
//!
//! Correlates a local record id with a CRM record id. Unique independently on
//! (tenant, object type, local id) and (tenant, object type, external id).

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::{ObjectType, SyncDirection};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "object_mappings")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub tenant_id: Uuid,

    pub object_type: ObjectType,

    pub local_id: String,

    pub external_id: String,

    /// Direction of the most recent successful write
    pub last_direction: SyncDirection,

    pub last_synced_at: DateTimeWithTimeZone,

    /// Modification timestamp of the version last propagated in either direction.
    /// Change-set entries not newer than this are echoes of our own writes.
    pub synced_version_at: DateTimeWithTimeZone,

    /// Set when either side deleted or archived the record
    pub expired_at: Option<DateTimeWithTimeZone>,

    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: Option<JsonValue>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_expired(&self) -> bool {
        self.expired_at.is_some()
    }
}
