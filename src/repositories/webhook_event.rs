//! Webhook event log persistence.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::db::{is_unique_violation, to_db_time};
use crate::models::ObjectType;
use crate::models::webhook_event::{
    ActiveModel, Column, Entity, Model, WebhookEventStatus, WebhookOutcome,
};

#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub tenant_id: Uuid,
    pub event_id: String,
    pub event_type: Option<String>,
    pub object_type: Option<ObjectType>,
    pub external_id: Option<String>,
    pub external_account_id: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub payload: JsonValue,
}

#[derive(Debug, Clone)]
pub enum RecordOutcome {
    Inserted(Model),
    /// Logged by an earlier delivery that never finished; process it again.
    Unfinished(Model),
    /// The (tenant, event id) pair was already logged and settled.
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct WebhookEventRepository {
    db: DatabaseConnection,
}

impl WebhookEventRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Logs an inbound event as `pending`; the unique index detects redelivery.
    pub async fn record(&self, new: NewWebhookEvent) -> Result<RecordOutcome, DbErr> {
        let tenant_id = new.tenant_id;
        let event_id = new.event_id.clone();
        let now = to_db_time(Utc::now());
        let model = ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(new.tenant_id),
            event_id: Set(new.event_id),
            event_type: Set(new.event_type),
            object_type: Set(new.object_type),
            external_id: Set(new.external_id),
            external_account_id: Set(new.external_account_id),
            occurred_at: Set(new.occurred_at.map(to_db_time)),
            payload: Set(new.payload),
            status: Set(WebhookEventStatus::Pending),
            outcome: Set(None),
            error_message: Set(None),
            received_at: Set(now),
            processed_at: Set(None),
        };

        match model.insert(&self.db).await {
            Ok(created) => Ok(RecordOutcome::Inserted(created)),
            Err(err) if is_unique_violation(&err) => {
                match self.find_by_event_id(tenant_id, &event_id).await? {
                    Some(existing) if existing.status == WebhookEventStatus::Pending => {
                        Ok(RecordOutcome::Unfinished(existing))
                    }
                    _ => Ok(RecordOutcome::Duplicate),
                }
            }
            Err(err) => Err(err),
        }
    }

    pub async fn mark_processed(&self, id: Uuid, outcome: WebhookOutcome) -> Result<(), DbErr> {
        Entity::update_many()
            .col_expr(Column::Status, Expr::value(WebhookEventStatus::Processed))
            .col_expr(Column::Outcome, Expr::value(outcome))
            .col_expr(Column::ProcessedAt, Expr::value(to_db_time(Utc::now())))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(WebhookEventStatus::Pending))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: Uuid, message: &str) -> Result<(), DbErr> {
        Entity::update_many()
            .col_expr(Column::Status, Expr::value(WebhookEventStatus::Failed))
            .col_expr(Column::ErrorMessage, Expr::value(message.to_string()))
            .col_expr(Column::ProcessedAt, Expr::value(to_db_time(Utc::now())))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(WebhookEventStatus::Pending))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn find_by_event_id(
        &self,
        tenant_id: Uuid,
        event_id: &str,
    ) -> Result<Option<Model>, DbErr> {
        Entity::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::EventId.eq(event_id))
            .one(&self.db)
            .await
    }

    pub async fn count_for_tenant(&self, tenant_id: Uuid) -> Result<u64, DbErr> {
        Entity::find()
            .filter(Column::TenantId.eq(tenant_id))
            .count(&self.db)
            .await
    }

    pub async fn list_for_tenant(&self, tenant_id: Uuid, limit: u64) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::TenantId.eq(tenant_id))
            .order_by_desc(Column::ReceivedAt)
            .limit(limit)
            .all(&self.db)
            .await
    }
}
