//! Per-object ordering state shared by the webhook and pull paths.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
};
use uuid::Uuid;

use crate::db::{is_unique_violation, to_db_time};
use crate::models::ObjectType;
use crate::models::webhook_object_state::{ActiveModel, Column, Entity, Model};

#[derive(Debug, Clone)]
pub struct ObjectStateRepository {
    db: DatabaseConnection,
}

impl ObjectStateRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Moves `last_applied_at` to `at` iff `at >= last_applied_at`.
    ///
    /// Returns `true` when the caller may apply a change observed at `at`,
    /// `false` when a newer change has already been applied for the object.
    pub async fn advance(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
        external_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DbErr> {
        let at = to_db_time(at);

        for _ in 0..2 {
            let result = Entity::update_many()
                .col_expr(Column::LastAppliedAt, Expr::value(at))
                .col_expr(Column::UpdatedAt, Expr::value(to_db_time(Utc::now())))
                .filter(Column::TenantId.eq(tenant_id))
                .filter(Column::ObjectType.eq(object_type))
                .filter(Column::ExternalId.eq(external_id))
                .filter(Column::LastAppliedAt.lte(at))
                .exec(&self.db)
                .await?;
            if result.rows_affected == 1 {
                return Ok(true);
            }

            if self.get(tenant_id, object_type, external_id).await?.is_some() {
                return Ok(false);
            }

            let insert = ActiveModel {
                id: Set(Uuid::new_v4()),
                tenant_id: Set(tenant_id),
                object_type: Set(object_type),
                external_id: Set(external_id.to_string()),
                last_applied_at: Set(at),
                updated_at: Set(to_db_time(Utc::now())),
            }
            .insert(&self.db)
            .await;

            match insert {
                Ok(_) => return Ok(true),
                // Raced with another first writer; compare against its row.
                Err(err) if is_unique_violation(&err) => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(false)
    }

    pub async fn get(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
        external_id: &str,
    ) -> Result<Option<Model>, DbErr> {
        Entity::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::ObjectType.eq(object_type))
            .filter(Column::ExternalId.eq(external_id))
            .one(&self.db)
            .await
    }
}
