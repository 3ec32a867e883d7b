//! # Identity Mapper
//!
//! Bidirectional local/external id index per (tenant, object type). The two
//! unique indexes on `object_mappings` are the source of truth; the lookups
//! before the insert only classify the outcome.

use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    Set,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::{is_unique_violation, to_db_time};
use crate::error::EngineError;
use crate::events::{SharedEventSink, SyncEvent};
use crate::models::object_mapping::{ActiveModel, Column, Entity, Model};
use crate::models::{ObjectType, SyncDirection};

pub struct IdentityMapper {
    db: DatabaseConnection,
    events: SharedEventSink,
}

/// What an existing row means for a requested (local, external) pair.
enum Existing {
    Same(Model),
    Conflict(String),
    None,
}

impl IdentityMapper {
    pub fn new(db: DatabaseConnection, events: SharedEventSink) -> Self {
        Self { db, events }
    }

    /// External id of a live mapping for `local_id`.
    pub async fn resolve(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
        local_id: &str,
    ) -> Result<Option<String>, EngineError> {
        Ok(self
            .find_by_local(tenant_id, object_type, local_id)
            .await?
            .filter(|m| !m.is_expired())
            .map(|m| m.external_id))
    }

    /// Local id of a live mapping for `external_id`.
    pub async fn resolve_reverse(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
        external_id: &str,
    ) -> Result<Option<String>, EngineError> {
        Ok(self
            .find_by_external(tenant_id, object_type, external_id)
            .await?
            .filter(|m| !m.is_expired())
            .map(|m| m.local_id))
    }

    /// True when `local_id` occupies a mapping row, expired or not.
    pub async fn is_mapped(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
        local_id: &str,
    ) -> Result<bool, EngineError> {
        Ok(self
            .find_by_local(tenant_id, object_type, local_id)
            .await?
            .is_some())
    }

    pub async fn find_by_local(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
        local_id: &str,
    ) -> Result<Option<Model>, DbErr> {
        Entity::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::ObjectType.eq(object_type))
            .filter(Column::LocalId.eq(local_id))
            .one(&self.db)
            .await
    }

    pub async fn find_by_external(
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

    /// Registers `local_id <-> external_id`.
    ///
    /// Re-asserting an identical pair returns the existing row. If either id
    /// is already paired with a different counterpart the call fails with
    /// [`EngineError::ConflictingMapping`] and nothing is written.
    pub async fn create_mapping(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
        local_id: &str,
        external_id: &str,
        direction: SyncDirection,
        synced_version_at: DateTime<Utc>,
    ) -> Result<Model, EngineError> {
        match self
            .classify(tenant_id, object_type, local_id, external_id)
            .await?
        {
            Existing::Same(model) => return Ok(model),
            Existing::Conflict(detail) => {
                return Err(conflict(object_type, local_id, external_id, detail));
            }
            Existing::None => {}
        }

        let now = to_db_time(Utc::now());
        let insert = ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(tenant_id),
            object_type: Set(object_type),
            local_id: Set(local_id.to_string()),
            external_id: Set(external_id.to_string()),
            last_direction: Set(direction),
            last_synced_at: Set(now),
            synced_version_at: Set(to_db_time(synced_version_at)),
            expired_at: Set(None),
            metadata: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&self.db)
        .await;

        match insert {
            Ok(created) => {
                counter!("crm_sync_mappings_created_total", "object_type" => object_type.as_str())
                    .increment(1);
                self.events.emit(SyncEvent::MappingCreated {
                    tenant_id,
                    object_type,
                    local_id: created.local_id.clone(),
                    external_id: created.external_id.clone(),
                });
                Ok(created)
            }
            Err(err) if is_unique_violation(&err) => {
                // Lost a race with a concurrent writer; the committed row decides.
                debug!(
                    tenant_id = %tenant_id,
                    object_type = %object_type,
                    local_id,
                    external_id,
                    "Mapping insert collided; re-classifying"
                );
                match self
                    .classify(tenant_id, object_type, local_id, external_id)
                    .await?
                {
                    Existing::Same(model) => Ok(model),
                    Existing::Conflict(detail) => {
                        Err(conflict(object_type, local_id, external_id, detail))
                    }
                    Existing::None => Err(conflict(
                        object_type,
                        local_id,
                        external_id,
                        "concurrent mapping insert".to_string(),
                    )),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Stamps a successful write on an existing mapping. `synced_version_at`
    /// only moves forward.
    pub async fn record_sync(
        &self,
        mapping: &Model,
        direction: SyncDirection,
        synced_version_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let now = to_db_time(Utc::now());
        let version = to_db_time(synced_version_at).max(mapping.synced_version_at);

        Entity::update_many()
            .col_expr(Column::LastDirection, Expr::value(direction))
            .col_expr(Column::LastSyncedAt, Expr::value(now))
            .col_expr(Column::SyncedVersionAt, Expr::value(version))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(mapping.id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Soft-expires a mapping after a deletion on either side. Idempotent.
    pub async fn expire(&self, mapping: &Model, reason: &str) -> Result<bool, EngineError> {
        let now = to_db_time(Utc::now());
        let result = Entity::update_many()
            .col_expr(Column::ExpiredAt, Expr::value(now))
            .col_expr(
                Column::Metadata,
                Expr::value(serde_json::json!({ "expired_reason": reason })),
            )
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(mapping.id))
            .filter(Column::ExpiredAt.is_null())
            .exec(&self.db)
            .await?;

        if result.rows_affected == 1 {
            warn!(
                tenant_id = %mapping.tenant_id,
                object_type = %mapping.object_type,
                local_id = %mapping.local_id,
                external_id = %mapping.external_id,
                reason,
                "Mapping expired"
            );
        }
        Ok(result.rows_affected == 1)
    }

    async fn classify(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
        local_id: &str,
        external_id: &str,
    ) -> Result<Existing, DbErr> {
        let rows = Entity::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::ObjectType.eq(object_type))
            .filter(
                Condition::any()
                    .add(Column::LocalId.eq(local_id))
                    .add(Column::ExternalId.eq(external_id)),
            )
            .all(&self.db)
            .await?;

        let mut same = None;
        for row in rows {
            if row.local_id == local_id && row.external_id == external_id {
                same = Some(row);
            } else if row.local_id == local_id {
                return Ok(Existing::Conflict(format!(
                    "local id already mapped to external '{}'",
                    row.external_id
                )));
            } else {
                return Ok(Existing::Conflict(format!(
                    "external id already mapped to local '{}'",
                    row.local_id
                )));
            }
        }

        Ok(same.map(Existing::Same).unwrap_or(Existing::None))
    }
}

fn conflict(
    object_type: ObjectType,
    local_id: &str,
    external_id: &str,
    detail: String,
) -> EngineError {
    EngineError::ConflictingMapping {
        object_type: object_type.to_string(),
        local_id: local_id.to_string(),
        external_id: external_id.to_string(),
        detail,
    }
}
