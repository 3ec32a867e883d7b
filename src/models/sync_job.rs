//! SyncJob entity
//!
//! One row per execution attempt for a (tenant, object type) pair. Created by
//! the scheduler or the webhook ingestor, mutated only by the executor.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

use super::{ObjectType, SyncDirection};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, ToSchema)]
#[sea_orm(table_name = "sync_jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub tenant_id: Uuid,

    pub object_type: ObjectType,

    pub direction: SyncDirection,

    pub trigger: JobTrigger,

    pub status: JobStatus,

    /// Earliest instant the executor may claim the job
    #[schema(value_type = String)]
    pub scheduled_at: DateTimeWithTimeZone,

    #[schema(value_type = Option<String>)]
    pub started_at: Option<DateTimeWithTimeZone>,

    #[schema(value_type = Option<String>)]
    pub completed_at: Option<DateTimeWithTimeZone>,

    pub records_processed: i32,

    pub records_succeeded: i32,

    pub records_failed: i32,

    /// Free-form diagnostics (`reason`, `error_code`, `message`, ...)
    #[sea_orm(column_type = "JsonBinary")]
    #[schema(value_type = Object)]
    pub metadata: JsonValue,

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
pub enum JobStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "running")]
    Running,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "paused")]
    Paused,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Paused
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Paused => "paused",
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum JobTrigger {
    #[sea_orm(string_value = "schedule")]
    Schedule,
    #[sea_orm(string_value = "webhook")]
    Webhook,
    /// Continuation of a job paused by a rate limit
    #[sea_orm(string_value = "resume")]
    Resume,
}

impl JobTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobTrigger::Schedule => "schedule",
            JobTrigger::Webhook => "webhook",
            JobTrigger::Resume => "resume",
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
