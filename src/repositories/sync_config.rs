//! Sync configuration registry persistence.
//!
//! Exactly one row per (tenant, object type); `upsert` relies on the unique
//! index rather than a read-then-write check.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::db::{is_unique_violation, to_db_time};
use crate::models::sync_config::{ActiveModel, Column, Entity, Model};
use crate::models::{ObjectType, SyncDirection};

/// Caller-supplied fields for [`SyncConfigRepository::upsert`].
#[derive(Debug, Clone)]
pub struct SyncConfigInput {
    pub direction: SyncDirection,
    pub enabled: bool,
    pub field_mappings: JsonValue,
    pub cadence_minutes: i32,
}

#[derive(Debug, Clone)]
pub struct SyncConfigRepository {
    db: DatabaseConnection,
}

impl SyncConfigRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn get(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
    ) -> Result<Option<Model>, DbErr> {
        Entity::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::ObjectType.eq(object_type))
            .one(&self.db)
            .await
    }

    pub async fn upsert(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
        input: SyncConfigInput,
    ) -> Result<Model, DbErr> {
        let now = to_db_time(Utc::now());

        if let Some(existing) = self.get(tenant_id, object_type).await? {
            return self.apply_update(existing, input, now).await;
        }

        let model = ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(tenant_id),
            object_type: Set(object_type),
            direction: Set(input.direction),
            enabled: Set(input.enabled),
            field_mappings: Set(input.field_mappings.clone()),
            cadence_minutes: Set(input.cadence_minutes),
            last_run_at: Set(None),
            demand_requested_at: Set(None),
            suspended_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match model.insert(&self.db).await {
            Ok(created) => Ok(created),
            Err(err) if is_unique_violation(&err) => {
                // Lost a concurrent insert; update the winner's row instead.
                let existing = self
                    .get(tenant_id, object_type)
                    .await?
                    .ok_or_else(|| DbErr::RecordNotFound("sync_config".to_string()))?;
                self.apply_update(existing, input, now).await
            }
            Err(err) => Err(err),
        }
    }

    async fn apply_update(
        &self,
        existing: Model,
        input: SyncConfigInput,
        now: sea_orm::prelude::DateTimeWithTimeZone,
    ) -> Result<Model, DbErr> {
        let mut active: ActiveModel = existing.into();
        active.direction = Set(input.direction);
        active.enabled = Set(input.enabled);
        active.field_mappings = Set(input.field_mappings);
        active.cadence_minutes = Set(input.cadence_minutes);
        active.updated_at = Set(now);
        active.update(&self.db).await
    }

    /// One page of enabled configs across all tenants, in id order.
    /// Pass the last id of the previous page as `after`.
    pub async fn list_enabled(&self, after: Option<Uuid>, limit: u64) -> Result<Vec<Model>, DbErr> {
        let mut query = Entity::find().filter(Column::Enabled.eq(true));
        if let Some(after) = after {
            query = query.filter(Column::Id.gt(after));
        }
        query
            .order_by_asc(Column::Id)
            .limit(limit)
            .all(&self.db)
            .await
    }

    pub async fn list_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::TenantId.eq(tenant_id))
            .order_by_asc(Column::ObjectType)
            .all(&self.db)
            .await
    }

    /// Returns `false` when no config exists for the key.
    pub async fn set_enabled(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
        enabled: bool,
    ) -> Result<bool, DbErr> {
        self.update_key(
            tenant_id,
            object_type,
            vec![(Column::Enabled, Expr::value(enabled))],
            Condition::all(),
        )
        .await
    }

    pub async fn delete(&self, tenant_id: Uuid, object_type: ObjectType) -> Result<bool, DbErr> {
        let result = Entity::delete_many()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::ObjectType.eq(object_type))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }

    /// Marks the config as wanted regardless of cadence.
    pub async fn request_demand(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
        at: DateTime<Utc>,
    ) -> Result<bool, DbErr> {
        self.update_key(
            tenant_id,
            object_type,
            vec![(Column::DemandRequestedAt, Expr::value(to_db_time(at)))],
            Condition::all(),
        )
        .await
    }

    /// Clears demand raised at or before `up_to`; later demand survives.
    pub async fn clear_demand(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
        up_to: DateTime<Utc>,
    ) -> Result<(), DbErr> {
        let none: Option<sea_orm::prelude::DateTimeWithTimeZone> = None;
        self.update_key(
            tenant_id,
            object_type,
            vec![(Column::DemandRequestedAt, Expr::value(none))],
            Condition::all().add(Column::DemandRequestedAt.lte(to_db_time(up_to))),
        )
        .await?;
        Ok(())
    }

    pub async fn suspend(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
        at: DateTime<Utc>,
    ) -> Result<bool, DbErr> {
        self.update_key(
            tenant_id,
            object_type,
            vec![(Column::SuspendedAt, Expr::value(to_db_time(at)))],
            Condition::all(),
        )
        .await
    }

    pub async fn resume(&self, tenant_id: Uuid, object_type: ObjectType) -> Result<bool, DbErr> {
        let none: Option<sea_orm::prelude::DateTimeWithTimeZone> = None;
        self.update_key(
            tenant_id,
            object_type,
            vec![(Column::SuspendedAt, Expr::value(none))],
            Condition::all(),
        )
        .await
    }

    pub async fn is_suspended(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
    ) -> Result<bool, DbErr> {
        Ok(self
            .get(tenant_id, object_type)
            .await?
            .is_some_and(|config| config.suspended_at.is_some()))
    }

    /// Moves the change-set watermark forward; never backwards.
    pub async fn advance_last_run(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
        to: DateTime<Utc>,
    ) -> Result<(), DbErr> {
        let to = to_db_time(to);
        self.update_key(
            tenant_id,
            object_type,
            vec![(Column::LastRunAt, Expr::value(to))],
            Condition::any()
                .add(Column::LastRunAt.is_null())
                .add(Column::LastRunAt.lt(to)),
        )
        .await?;
        Ok(())
    }

    async fn update_key(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
        values: Vec<(Column, sea_orm::sea_query::SimpleExpr)>,
        extra: Condition,
    ) -> Result<bool, DbErr> {
        let mut update = Entity::update_many()
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(Utc::now())))
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::ObjectType.eq(object_type))
            .filter(extra);
        for (column, value) in values {
            update = update.col_expr(column, value);
        }
        let result = update.exec(&self.db).await?;
        Ok(result.rows_affected > 0)
    }
}
