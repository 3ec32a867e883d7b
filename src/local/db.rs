//! [`LocalStore`] over the `local_records` table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::{Fields, LocalRecord, LocalStore};
use crate::db::to_db_time;
use crate::error::EngineError;
use crate::models::ObjectType;
use crate::models::local_record::{ActiveModel, Column, Entity, Model};

#[derive(Debug, Clone)]
pub struct DbLocalStore {
    db: DatabaseConnection,
}

impl DbLocalStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    async fn find(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
        id: &str,
    ) -> Result<Option<Model>, EngineError> {
        Ok(Entity::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::ObjectType.eq(object_type))
            .filter(Column::RecordId.eq(id))
            .one(&self.db)
            .await?)
    }
}

fn to_record(model: Model) -> LocalRecord {
    let fields = match model.fields {
        JsonValue::Object(map) => map,
        _ => Fields::new(),
    };
    LocalRecord {
        id: model.record_id,
        fields,
        updated_at: model.updated_at.with_timezone(&Utc),
        deleted: model.deleted,
    }
}

#[async_trait]
impl LocalStore for DbLocalStore {
    async fn fetch_changed(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<LocalRecord>, EngineError> {
        let mut query = Entity::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::ObjectType.eq(object_type));
        if let Some(since) = since {
            query = query.filter(Column::UpdatedAt.gte(to_db_time(since)));
        }

        let rows = query
            .order_by_asc(Column::UpdatedAt)
            .order_by_asc(Column::RecordId)
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(to_record).collect())
    }

    async fn get(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
        id: &str,
    ) -> Result<Option<LocalRecord>, EngineError> {
        Ok(self.find(tenant_id, object_type, id).await?.map(to_record))
    }

    async fn create(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
        fields: Fields,
        updated_at: DateTime<Utc>,
    ) -> Result<String, EngineError> {
        let record_id = Uuid::new_v4().to_string();
        ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(tenant_id),
            object_type: Set(object_type),
            record_id: Set(record_id.clone()),
            fields: Set(JsonValue::Object(fields)),
            deleted: Set(false),
            updated_at: Set(to_db_time(updated_at)),
            created_at: Set(to_db_time(Utc::now())),
        }
        .insert(&self.db)
        .await?;
        Ok(record_id)
    }

    async fn update(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
        id: &str,
        fields: Fields,
        updated_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let existing = self
            .find(tenant_id, object_type, id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("local {object_type} '{id}'")))?;

        let mut merged = match existing.fields.clone() {
            JsonValue::Object(map) => map,
            _ => Fields::new(),
        };
        for (key, value) in fields {
            merged.insert(key, value);
        }

        let mut active: ActiveModel = existing.into();
        active.fields = Set(JsonValue::Object(merged));
        active.updated_at = Set(to_db_time(updated_at));
        active.update(&self.db).await?;
        Ok(())
    }

    async fn mark_deleted(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let existing = self
            .find(tenant_id, object_type, id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("local {object_type} '{id}'")))?;
        let mut active: ActiveModel = existing.into();
        active.deleted = Set(true);
        active.updated_at = Set(to_db_time(at));
        active.update(&self.db).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;
    use serde_json::json;

    async fn store() -> DbLocalStore {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        DbLocalStore::new(db)
    }

    fn fields(value: JsonValue) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn update_merges_fields_and_keeps_source_timestamp() {
        let store = store().await;
        let tenant = Uuid::new_v4();
        let t0 = Utc::now() - Duration::hours(1);

        let id = store
            .create(
                tenant,
                ObjectType::Contact,
                fields(json!({"email": "a@example.com", "name": "A"})),
                t0,
            )
            .await
            .unwrap();

        let t1 = t0 + Duration::minutes(5);
        store
            .update(
                tenant,
                ObjectType::Contact,
                &id,
                fields(json!({"name": "Alice"})),
                t1,
            )
            .await
            .unwrap();

        let record = store
            .get(tenant, ObjectType::Contact, &id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.fields["email"], "a@example.com");
        assert_eq!(record.fields["name"], "Alice");
        assert_eq!(record.updated_at.timestamp(), t1.timestamp());
    }

    #[tokio::test]
    async fn fetch_changed_respects_since_and_tenant() {
        let store = store().await;
        let tenant = Uuid::new_v4();
        let other = Uuid::new_v4();
        let base = Utc::now() - Duration::hours(2);

        store
            .create(tenant, ObjectType::Deal, Fields::new(), base)
            .await
            .unwrap();
        let recent = store
            .create(tenant, ObjectType::Deal, Fields::new(), base + Duration::hours(1))
            .await
            .unwrap();
        store
            .create(other, ObjectType::Deal, Fields::new(), base + Duration::hours(1))
            .await
            .unwrap();

        let changed = store
            .fetch_changed(tenant, ObjectType::Deal, Some(base + Duration::minutes(30)))
            .await
            .unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].id, recent);

        let all = store
            .fetch_changed(tenant, ObjectType::Deal, None)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn update_missing_record_is_not_found() {
        let store = store().await;
        let err = store
            .update(
                Uuid::new_v4(),
                ObjectType::Contact,
                "nope",
                Fields::new(),
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
