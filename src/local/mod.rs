//! The product's own system of record, as seen by the sync core.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::ObjectType;

pub mod db;

pub use db::DbLocalStore;

/// Local field bag keyed by local field name.
pub type Fields = Map<String, JsonValue>;

#[derive(Debug, Clone, PartialEq)]
pub struct LocalRecord {
    pub id: String,
    pub fields: Fields,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
}

#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Records modified at or after `since`, oldest first. Includes deletions.
    async fn fetch_changed(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<LocalRecord>, EngineError>;

    async fn get(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
        id: &str,
    ) -> Result<Option<LocalRecord>, EngineError>;

    /// Creates a record carrying `updated_at` from the source system. Returns the new id.
    async fn create(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
        fields: Fields,
        updated_at: DateTime<Utc>,
    ) -> Result<String, EngineError>;

    /// Merges `fields` into the record and stamps it with `updated_at`.
    async fn update(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
        id: &str,
        fields: Fields,
        updated_at: DateTime<Utc>,
    ) -> Result<(), EngineError>;

    /// Marks a record deleted, stamped with `at`; a later sync observes it
    /// as a deletion.
    async fn mark_deleted(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), EngineError>;
}
