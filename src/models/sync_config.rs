//! Sync configuration entity, one row per (tenant, object type).

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::{ObjectType, SyncDirection};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_configs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub tenant_id: Uuid,

    pub object_type: ObjectType,

    pub direction: SyncDirection,

    /// Disabled configs are never scheduled; running jobs are unaffected
    pub enabled: bool,

    /// Ordered `FieldRule` list (see `crate::field_mapping`)
    #[sea_orm(column_type = "JsonBinary")]
    pub field_mappings: JsonValue,

    pub cadence_minutes: i32,

    /// Change-set watermark: `started_at` of the last completed job
    pub last_run_at: Option<DateTimeWithTimeZone>,

    /// Set by webhook demand; makes the config due regardless of cadence
    pub demand_requested_at: Option<DateTimeWithTimeZone>,

    /// Running jobs observe this between records and end `paused`
    pub suspended_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
