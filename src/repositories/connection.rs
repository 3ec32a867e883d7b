//! Connection repository
//!
//! Persistence for `crm_connections`. Token sealing happens in
//! `crate::credentials`; this layer only moves ciphertext around.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, TransactionTrait,
};
use uuid::Uuid;

use crate::db::to_db_time;
use crate::models::connection::{ActiveModel, Column, ConnectionStatus, Entity, Model};

/// Sealed token material for a refresh write.
#[derive(Debug, Clone)]
pub struct TokenUpdate {
    pub access_token_ciphertext: Vec<u8>,
    pub refresh_token_ciphertext: Option<Vec<u8>>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ConnectionRepository {
    db: DatabaseConnection,
}

impl ConnectionRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn find_active(&self, tenant_id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::Status.eq(ConnectionStatus::Active))
            .one(&self.db)
            .await
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(id).one(&self.db).await
    }

    /// Replaces the tenant's active connection with `model` in one transaction.
    ///
    /// Returns the connection that was deactivated, if any.
    pub async fn replace_active(&self, model: Model) -> Result<Option<Model>, DbErr> {
        let now = to_db_time(Utc::now());
        let txn = self.db.begin().await?;

        let previous = Entity::find()
            .filter(Column::TenantId.eq(model.tenant_id))
            .filter(Column::Status.eq(ConnectionStatus::Active))
            .one(&txn)
            .await?;

        if let Some(ref prev) = previous {
            Self::deactivate_row(&txn, prev.id, "replaced", now).await?;
        }

        ActiveModel::from(model).reset_all().insert(&txn).await?;
        txn.commit().await?;

        Ok(previous)
    }

    /// Writes refreshed tokens iff nobody else refreshed since `expected_version`.
    ///
    /// Also resets the auth failure counter. Returns `false` when the version
    /// moved or the connection is no longer active.
    pub async fn update_tokens_if_version(
        &self,
        id: Uuid,
        expected_version: i32,
        tokens: TokenUpdate,
    ) -> Result<bool, DbErr> {
        let now = Utc::now();
        let result = Entity::update_many()
            .col_expr(
                Column::AccessTokenCiphertext,
                Expr::value(tokens.access_token_ciphertext),
            )
            .col_expr(
                Column::RefreshTokenCiphertext,
                Expr::value(tokens.refresh_token_ciphertext),
            )
            .col_expr(
                Column::ExpiresAt,
                Expr::value(tokens.expires_at.map(to_db_time)),
            )
            .col_expr(Column::TokenVersion, Expr::col(Column::TokenVersion).add(1))
            .col_expr(Column::AuthFailures, Expr::value(0))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(now)))
            .filter(Column::Id.eq(id))
            .filter(Column::TokenVersion.eq(expected_version))
            .filter(Column::Status.eq(ConnectionStatus::Active))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected == 1)
    }

    /// Increments the consecutive auth failure counter and returns the new value.
    pub async fn increment_auth_failures(&self, id: Uuid) -> Result<i32, DbErr> {
        Entity::update_many()
            .col_expr(Column::AuthFailures, Expr::col(Column::AuthFailures).add(1))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(Utc::now())))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;

        let model = Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| DbErr::RecordNotFound(format!("crm_connection {id}")))?;
        Ok(model.auth_failures)
    }

    /// Deactivates the tenant's active connection. Idempotent.
    ///
    /// Returns the deactivated row only when this call performed the transition.
    pub async fn deactivate_active(
        &self,
        tenant_id: Uuid,
        reason: &str,
    ) -> Result<Option<Model>, DbErr> {
        let Some(active) = self.find_active(tenant_id).await? else {
            return Ok(None);
        };

        let now = to_db_time(Utc::now());
        if !Self::deactivate_row(&self.db, active.id, reason, now).await? {
            return Ok(None);
        }

        Entity::find_by_id(active.id).one(&self.db).await
    }

    pub async fn touch_last_sync(&self, tenant_id: Uuid, at: DateTime<Utc>) -> Result<(), DbErr> {
        Entity::update_many()
            .col_expr(Column::LastSyncAt, Expr::value(to_db_time(at)))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(at)))
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::Status.eq(ConnectionStatus::Active))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn deactivate_row<C: ConnectionTrait>(
        conn: &C,
        id: Uuid,
        reason: &str,
        now: sea_orm::prelude::DateTimeWithTimeZone,
    ) -> Result<bool, DbErr> {
        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(ConnectionStatus::Deactivated))
            .col_expr(Column::DeactivatedAt, Expr::value(now))
            .col_expr(Column::DeactivationReason, Expr::value(reason.to_string()))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(ConnectionStatus::Active))
            .exec(conn)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Builds an active row ready for [`Self::replace_active`].
    #[allow(clippy::too_many_arguments)]
    pub fn new_model(
        tenant_id: Uuid,
        external_account_id: String,
        external_domain: Option<String>,
        scopes: Vec<String>,
        access_token_ciphertext: Vec<u8>,
        refresh_token_ciphertext: Option<Vec<u8>>,
        expires_at: Option<DateTime<Utc>>,
        connected_by: Option<Uuid>,
    ) -> Model {
        let now = to_db_time(Utc::now());
        Model {
            id: Uuid::new_v4(),
            tenant_id,
            external_account_id,
            external_domain,
            status: ConnectionStatus::Active,
            access_token_ciphertext,
            refresh_token_ciphertext,
            expires_at: expires_at.map(to_db_time),
            scopes: serde_json::json!(scopes),
            token_version: 0,
            auth_failures: 0,
            connected_by,
            last_sync_at: None,
            deactivated_at: None,
            deactivation_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}
