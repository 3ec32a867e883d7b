//! SyncError entity
//!
//! One row per failed record-level operation, carrying its retry schedule.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{ObjectType, SyncDirection};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, ToSchema)]
#[sea_orm(table_name = "sync_errors")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub tenant_id: Uuid,

    /// Parent job; absent for failures raised by webhook processing
    pub job_id: Option<Uuid>,

    pub object_type: ObjectType,

    /// `to_external` for pushes, `from_external` for pulls
    pub direction: SyncDirection,

    pub local_id: Option<String>,

    pub external_id: Option<String>,

    pub error_code: String,

    pub error_message: String,

    pub status: SyncErrorStatus,

    pub retry_count: i32,

    pub max_retries: i32,

    #[schema(value_type = Option<String>)]
    pub next_retry_at: Option<DateTimeWithTimeZone>,

    #[schema(value_type = Option<String>)]
    pub resolved_at: Option<DateTimeWithTimeZone>,

    #[schema(value_type = String)]
    pub created_at: DateTimeWithTimeZone,

    #[schema(value_type = String)]
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorStatus {
    #[sea_orm(string_value = "pending_retry")]
    PendingRetry,
    #[sea_orm(string_value = "resolved")]
    Resolved,
    /// Retries exhausted or not retryable; awaits manual intervention
    #[sea_orm(string_value = "dead_letter")]
    DeadLetter,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
