//! SyncError persistence and the retry sweep's compare-and-set lease.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use uuid::Uuid;

use crate::db::to_db_time;
use crate::models::sync_error::{ActiveModel, Column, Entity, Model, SyncErrorStatus};
use crate::models::{ObjectType, SyncDirection};

#[derive(Debug, Clone)]
pub struct NewSyncError {
    pub tenant_id: Uuid,
    pub job_id: Option<Uuid>,
    pub object_type: ObjectType,
    pub direction: SyncDirection,
    pub local_id: Option<String>,
    pub external_id: Option<String>,
    pub error_code: String,
    pub error_message: String,
    pub status: SyncErrorStatus,
    pub max_retries: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SyncErrorRepository {
    db: DatabaseConnection,
}

impl SyncErrorRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn insert(&self, new: NewSyncError) -> Result<Model, DbErr> {
        let now = to_db_time(Utc::now());
        ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(new.tenant_id),
            job_id: Set(new.job_id),
            object_type: Set(new.object_type),
            direction: Set(new.direction),
            local_id: Set(new.local_id),
            external_id: Set(new.external_id),
            error_code: Set(new.error_code),
            error_message: Set(new.error_message),
            status: Set(new.status),
            retry_count: Set(0),
            max_retries: Set(new.max_retries),
            next_retry_at: Set(new.next_retry_at.map(to_db_time)),
            resolved_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&self.db)
        .await
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(id).one(&self.db).await
    }

    /// Unresolved errors whose retry time has come and with retries remaining.
    pub async fn find_due(&self, now: DateTime<Utc>, limit: u64) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::Status.eq(SyncErrorStatus::PendingRetry))
            .filter(Column::ResolvedAt.is_null())
            .filter(Column::NextRetryAt.lte(to_db_time(now)))
            .filter(Expr::col(Column::RetryCount).lt(Expr::col(Column::MaxRetries)))
            .order_by_asc(Column::NextRetryAt)
            .limit(limit)
            .all(&self.db)
            .await
    }

    /// Takes a lease on a due error by pushing `next_retry_at` to `lease_until`.
    ///
    /// Succeeds only if the row is still due with the observed `retry_count`,
    /// so two sweepers never attempt the same retry.
    pub async fn claim(
        &self,
        error: &Model,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, DbErr> {
        let result = Entity::update_many()
            .col_expr(Column::NextRetryAt, Expr::value(to_db_time(lease_until)))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(now)))
            .filter(Column::Id.eq(error.id))
            .filter(Column::Status.eq(SyncErrorStatus::PendingRetry))
            .filter(Column::RetryCount.eq(error.retry_count))
            .filter(Column::NextRetryAt.lte(to_db_time(now)))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    pub async fn mark_resolved(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DbErr> {
        let now = to_db_time(now);
        let no_retry: Option<sea_orm::prelude::DateTimeWithTimeZone> = None;
        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(SyncErrorStatus::Resolved))
            .col_expr(Column::ResolvedAt, Expr::value(now))
            .col_expr(Column::NextRetryAt, Expr::value(no_retry))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .filter(Column::ResolvedAt.is_null())
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Records a failed retry attempt.
    pub async fn record_attempt_failure(
        &self,
        id: Uuid,
        retry_count: i32,
        status: SyncErrorStatus,
        next_retry_at: Option<DateTime<Utc>>,
        error_code: &str,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DbErr> {
        Entity::update_many()
            .col_expr(Column::RetryCount, Expr::value(retry_count))
            .col_expr(Column::Status, Expr::value(status))
            .col_expr(
                Column::NextRetryAt,
                Expr::value(next_retry_at.map(to_db_time)),
            )
            .col_expr(Column::ErrorCode, Expr::value(error_code.to_string()))
            .col_expr(Column::ErrorMessage, Expr::value(error_message.to_string()))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(now)))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Moves `next_retry_at` without touching `retry_count`.
    pub async fn reschedule(
        &self,
        id: Uuid,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), DbErr> {
        Entity::update_many()
            .col_expr(Column::NextRetryAt, Expr::value(to_db_time(next_retry_at)))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(now)))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// The open retryable error for a record operation, if any.
    pub async fn find_open(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
        direction: SyncDirection,
        local_id: Option<&str>,
        external_id: Option<&str>,
    ) -> Result<Option<Model>, DbErr> {
        let Some(record) = record_condition(local_id, external_id) else {
            return Ok(None);
        };
        Entity::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::ObjectType.eq(object_type))
            .filter(Column::Direction.eq(direction))
            .filter(Column::Status.eq(SyncErrorStatus::PendingRetry))
            .filter(Column::ResolvedAt.is_null())
            .filter(record)
            .order_by_asc(Column::CreatedAt)
            .one(&self.db)
            .await
    }

    /// Resolves pending errors for a record that has since synced successfully.
    pub async fn resolve_for_record(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
        direction: SyncDirection,
        local_id: Option<&str>,
        external_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64, DbErr> {
        let Some(record) = record_condition(local_id, external_id) else {
            return Ok(0);
        };

        let now = to_db_time(now);
        let no_retry: Option<sea_orm::prelude::DateTimeWithTimeZone> = None;
        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(SyncErrorStatus::Resolved))
            .col_expr(Column::ResolvedAt, Expr::value(now))
            .col_expr(Column::NextRetryAt, Expr::value(no_retry))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::ObjectType.eq(object_type))
            .filter(Column::Direction.eq(direction))
            .filter(Column::Status.eq(SyncErrorStatus::PendingRetry))
            .filter(record)
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    /// Pending and dead-lettered errors, newest first.
    pub async fn list_unresolved(&self, tenant_id: Uuid) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::ResolvedAt.is_null())
            .order_by_desc(Column::CreatedAt)
            .all(&self.db)
            .await
    }

    pub async fn list_dead_letters(&self, tenant_id: Uuid) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::Status.eq(SyncErrorStatus::DeadLetter))
            .order_by_desc(Column::CreatedAt)
            .all(&self.db)
            .await
    }
}

/// Matches rows for either id of the record; `None` without any id.
fn record_condition(local_id: Option<&str>, external_id: Option<&str>) -> Option<Condition> {
    if local_id.is_none() && external_id.is_none() {
        return None;
    }
    let mut record = Condition::any();
    if let Some(local_id) = local_id {
        record = record.add(Column::LocalId.eq(local_id));
    }
    if let Some(external_id) = external_id {
        record = record.add(Column::ExternalId.eq(external_id));
    }
    Some(record)
}
