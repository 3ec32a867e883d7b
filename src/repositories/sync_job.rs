//! # SyncJob Repository
//!
//! Job creation honours the single-flight index: at most one `pending` or
//! `running` job per (tenant, object type). Status transitions are
//! compare-and-set so a job is claimed and finished exactly once.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::db::{is_unique_violation, to_db_time};
use crate::models::sync_job::{ActiveModel, Column, Entity, JobStatus, JobTrigger, Model};
use crate::models::{ObjectType, SyncDirection};

/// Result of asking for a new job.
#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    Enqueued(Model),
    /// Another job for the same key is pending or running.
    AlreadyPending,
}

impl EnqueueOutcome {
    pub fn job(&self) -> Option<&Model> {
        match self {
            EnqueueOutcome::Enqueued(job) => Some(job),
            EnqueueOutcome::AlreadyPending => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub tenant_id: Uuid,
    pub object_type: ObjectType,
    pub direction: SyncDirection,
    pub trigger: JobTrigger,
    pub scheduled_at: DateTime<Utc>,
    pub metadata: JsonValue,
}

/// Record counters written when a job reaches a terminal status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub processed: i32,
    pub succeeded: i32,
    pub failed: i32,
}

#[derive(Debug, Clone)]
pub struct SyncJobRepository {
    db: DatabaseConnection,
}

impl SyncJobRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn enqueue(&self, job: NewJob) -> Result<EnqueueOutcome, DbErr> {
        Self::enqueue_with(&self.db, job).await
    }

    /// Inserts a pending job on any connection, including an open transaction.
    pub async fn enqueue_with<C: ConnectionTrait>(
        conn: &C,
        job: NewJob,
    ) -> Result<EnqueueOutcome, DbErr> {
        let now = to_db_time(Utc::now());
        let model = ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(job.tenant_id),
            object_type: Set(job.object_type),
            direction: Set(job.direction),
            trigger: Set(job.trigger),
            status: Set(JobStatus::Pending),
            scheduled_at: Set(to_db_time(job.scheduled_at)),
            started_at: Set(None),
            completed_at: Set(None),
            records_processed: Set(0),
            records_succeeded: Set(0),
            records_failed: Set(0),
            metadata: Set(job.metadata),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match model.insert(conn).await {
            Ok(created) => {
                tracing::info!(
                    tenant_id = %created.tenant_id,
                    object_type = %created.object_type,
                    job_id = %created.id,
                    trigger = created.trigger.as_str(),
                    "Sync job enqueued"
                );
                Ok(EnqueueOutcome::Enqueued(created))
            }
            Err(err) if is_unique_violation(&err) => Ok(EnqueueOutcome::AlreadyPending),
            Err(err) => Err(err),
        }
    }

    pub async fn find_by_id(&self, job_id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(job_id).one(&self.db).await
    }

    pub async fn has_inflight(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
    ) -> Result<bool, DbErr> {
        let count = Entity::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::ObjectType.eq(object_type))
            .filter(Column::Status.is_in([JobStatus::Pending, JobStatus::Running]))
            .count(&self.db)
            .await?;
        Ok(count > 0)
    }

    /// Pending jobs whose `scheduled_at` has passed, oldest first.
    pub async fn find_claimable(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::Status.eq(JobStatus::Pending))
            .filter(Column::ScheduledAt.lte(to_db_time(now)))
            .order_by_asc(Column::ScheduledAt)
            .limit(limit)
            .all(&self.db)
            .await
    }

    /// `pending -> running`. Returns the claimed job, or `None` if another worker won.
    pub async fn claim(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<Option<Model>, DbErr> {
        let now = to_db_time(now);
        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Running))
            .col_expr(Column::StartedAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(job_id))
            .filter(Column::Status.eq(JobStatus::Pending))
            .exec(&self.db)
            .await?;

        if result.rows_affected != 1 {
            return Ok(None);
        }
        self.find_by_id(job_id).await
    }

    /// `running -> status`. Returns `false` if the job was no longer running.
    pub async fn finish(
        &self,
        job_id: Uuid,
        status: JobStatus,
        counts: JobCounts,
        metadata: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<bool, DbErr> {
        Self::finish_with(&self.db, job_id, status, counts, metadata, now).await
    }

    async fn finish_with<C: ConnectionTrait>(
        conn: &C,
        job_id: Uuid,
        status: JobStatus,
        counts: JobCounts,
        metadata: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<bool, DbErr> {
        let now = to_db_time(now);
        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(status))
            .col_expr(Column::CompletedAt, Expr::value(now))
            .col_expr(Column::RecordsProcessed, Expr::value(counts.processed))
            .col_expr(Column::RecordsSucceeded, Expr::value(counts.succeeded))
            .col_expr(Column::RecordsFailed, Expr::value(counts.failed))
            .col_expr(Column::Metadata, Expr::value(metadata))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(job_id))
            .filter(Column::Status.eq(JobStatus::Running))
            .exec(conn)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Pauses a running job and schedules its continuation atomically.
    ///
    /// The paused row leaves the single-flight set before the resume job is
    /// inserted, so the insert cannot collide with it.
    pub async fn pause_with_resume(
        &self,
        job: &Model,
        counts: JobCounts,
        metadata: JsonValue,
        resume_at: DateTime<Utc>,
        resume_metadata: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<Option<Model>, DbErr> {
        let txn = self.db.begin().await?;

        if !Self::finish_with(&txn, job.id, JobStatus::Paused, counts, metadata, now).await? {
            txn.rollback().await?;
            return Ok(None);
        }

        let outcome = Self::enqueue_with(
            &txn,
            NewJob {
                tenant_id: job.tenant_id,
                object_type: job.object_type,
                direction: job.direction,
                trigger: JobTrigger::Resume,
                scheduled_at: resume_at,
                metadata: resume_metadata,
            },
        )
        .await?;
        txn.commit().await?;

        Ok(outcome.job().cloned())
    }

    /// Running jobs started before `cutoff`.
    pub async fn find_stale_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::Status.eq(JobStatus::Running))
            .filter(Column::StartedAt.lt(to_db_time(cutoff)))
            .all(&self.db)
            .await
    }

    /// Job history for a tenant, newest first.
    pub async fn list_for_tenant(&self, tenant_id: Uuid, limit: u64) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::TenantId.eq(tenant_id))
            .order_by_desc(Column::CreatedAt)
            .order_by_desc(Column::Id)
            .limit(limit)
            .all(&self.db)
            .await
    }
}
