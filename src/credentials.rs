//! # Credential Store
//!
//! Owns the tenant's single active CRM connection. Tokens are sealed with
//! [`crate::crypto`] before they reach the database and opened only here.
//!
//! Refresh is coalesced per tenant: callers pass the `token_version` they
//! observed, and whoever acquires the tenant lock after a successful refresh
//! gets the already-refreshed connection instead of spending the refresh token
//! a second time.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::TokenRefreshConfig;
use crate::crm::{CrmClient, CrmError};
use crate::crypto::{CryptoKey, TokenKind, decrypt_token, encrypt_token};
use crate::error::EngineError;
use crate::events::{SharedEventSink, SyncEvent};
use crate::models::connection::Model as Connection;
use crate::repositories::ConnectionRepository;
use crate::repositories::connection::TokenUpdate;

/// Token pair delivered by the OAuth collaborator.
#[derive(Clone)]
pub struct ConnectionTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for ConnectionTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTokens")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionMetadata {
    pub external_account_id: String,
    pub external_domain: Option<String>,
    pub scopes: Vec<String>,
    pub actor_user_id: Option<Uuid>,
}

/// A usable access token and the connection version it came from.
#[derive(Clone)]
pub struct AccessToken {
    pub value: String,
    pub connection_id: Uuid,
    pub token_version: i32,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"[REDACTED]")
            .field("connection_id", &self.connection_id)
            .field("token_version", &self.token_version)
            .finish()
    }
}

pub struct CredentialStore {
    connections: ConnectionRepository,
    crm: Arc<dyn CrmClient>,
    key: CryptoKey,
    config: TokenRefreshConfig,
    events: SharedEventSink,
    refresh_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl CredentialStore {
    pub fn new(
        connections: ConnectionRepository,
        crm: Arc<dyn CrmClient>,
        key: CryptoKey,
        config: TokenRefreshConfig,
        events: SharedEventSink,
    ) -> Self {
        Self {
            connections,
            crm,
            key,
            config,
            events,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Installs a freshly authorized connection, deactivating any previous one.
    #[instrument(skip_all, fields(tenant_id = %tenant_id))]
    pub async fn store_connection(
        &self,
        tenant_id: Uuid,
        tokens: ConnectionTokens,
        metadata: ConnectionMetadata,
    ) -> Result<Connection, EngineError> {
        let account = metadata.external_account_id.as_str();
        let access = self.seal(tenant_id, account, TokenKind::Access, &tokens.access_token)?;
        let refresh = tokens
            .refresh_token
            .as_deref()
            .map(|t| self.seal(tenant_id, account, TokenKind::Refresh, t))
            .transpose()?;

        let model = ConnectionRepository::new_model(
            tenant_id,
            metadata.external_account_id.clone(),
            metadata.external_domain,
            metadata.scopes,
            access,
            refresh,
            tokens.expires_at,
            metadata.actor_user_id,
        );

        let previous = self.connections.replace_active(model.clone()).await?;
        if let Some(previous) = previous {
            self.events.emit(SyncEvent::ConnectionDeactivated {
                tenant_id,
                connection_id: previous.id,
                reason: "replaced".to_string(),
            });
        }

        info!(
            connection_id = %model.id,
            external_account_id = %model.external_account_id,
            "CRM connection stored"
        );
        Ok(model)
    }

    pub async fn get_active_connection(&self, tenant_id: Uuid) -> Result<Connection, EngineError> {
        self.connections
            .find_active(tenant_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("no active connection for tenant {tenant_id}")))
    }

    /// Returns a decrypted access token, refreshing first when it is about to expire.
    pub async fn valid_access_token(&self, tenant_id: Uuid) -> Result<AccessToken, EngineError> {
        let connection = self.active_or_unauthenticated(tenant_id).await?;

        let lead = Duration::seconds(self.config.lead_time_seconds as i64);
        let near_expiry = connection
            .expires_at
            .map(|exp| exp.with_timezone(&Utc) - lead <= Utc::now())
            .unwrap_or(false);

        if !near_expiry {
            return self.open_access_token(&connection);
        }

        match self.refresh_if_stale(tenant_id, connection.token_version).await {
            Ok(refreshed) => self.open_access_token(&refreshed),
            Err(err) if !err.is_job_fatal() && !is_expired(&connection) => {
                warn!(
                    tenant_id = %tenant_id,
                    error_code = err.code(),
                    "Proactive token refresh failed; using current token until expiry"
                );
                self.open_access_token(&connection)
            }
            Err(err) => Err(err),
        }
    }

    /// Refreshes the tenant's tokens unconditionally (modulo coalescing).
    pub async fn refresh(&self, tenant_id: Uuid) -> Result<Connection, EngineError> {
        let connection = self.active_or_unauthenticated(tenant_id).await?;
        self.refresh_if_stale(tenant_id, connection.token_version)
            .await
    }

    /// Refreshes unless the connection already moved past `observed_version`.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn refresh_if_stale(
        &self,
        tenant_id: Uuid,
        observed_version: i32,
    ) -> Result<Connection, EngineError> {
        let lock = self.tenant_lock(tenant_id).await;
        let _guard = lock.lock().await;

        let connection = self.active_or_unauthenticated(tenant_id).await?;
        if connection.token_version != observed_version {
            debug!(
                token_version = connection.token_version,
                observed_version, "Refresh already performed by another caller"
            );
            counter!("crm_token_refresh_total", "outcome" => "coalesced").increment(1);
            return Ok(connection);
        }

        let Some(refresh_ciphertext) = connection.refresh_token_ciphertext.as_deref() else {
            return Err(EngineError::Unauthenticated(
                "connection has no refresh token".to_string(),
            ));
        };
        let refresh_token = decrypt_token(
            &self.key,
            tenant_id,
            &connection.external_account_id,
            TokenKind::Refresh,
            refresh_ciphertext,
        )
        .map_err(|e| EngineError::Unauthenticated(format!("refresh token unreadable: {e}")))?;

        let grant = match self.crm.refresh_token(&refresh_token).await {
            Ok(grant) => grant,
            Err(CrmError::AuthRevoked(msg)) => {
                counter!("crm_token_refresh_total", "outcome" => "revoked").increment(1);
                self.deactivate(tenant_id, "refresh_revoked").await?;
                return Err(EngineError::AuthRevoked(msg));
            }
            Err(err) => {
                counter!("crm_token_refresh_total", "outcome" => "error").increment(1);
                return Err(err.into());
            }
        };

        let account = connection.external_account_id.as_str();
        let access_ciphertext =
            self.seal(tenant_id, account, TokenKind::Access, &grant.access_token)?;
        let refresh_ciphertext = match grant.refresh_token.as_deref() {
            Some(rotated) => Some(self.seal(tenant_id, account, TokenKind::Refresh, rotated)?),
            None => connection.refresh_token_ciphertext.clone(),
        };
        let expires_at = grant
            .expires_in_secs
            .map(|secs| Utc::now() + Duration::seconds(secs));

        let written = self
            .connections
            .update_tokens_if_version(
                connection.id,
                observed_version,
                TokenUpdate {
                    access_token_ciphertext: access_ciphertext,
                    refresh_token_ciphertext: refresh_ciphertext,
                    expires_at,
                },
            )
            .await?;
        if !written {
            warn!("Connection changed during refresh; returning current state");
        } else {
            counter!("crm_token_refresh_total", "outcome" => "refreshed").increment(1);
            info!(connection_id = %connection.id, "CRM access token refreshed");
        }

        self.active_or_unauthenticated(tenant_id).await
    }

    /// Counts a 401 that survived a refresh. Returns `true` when the
    /// connection was deactivated as a result.
    pub async fn record_auth_failure(&self, tenant_id: Uuid) -> Result<bool, EngineError> {
        let Some(connection) = self.connections.find_active(tenant_id).await? else {
            return Ok(false);
        };

        let failures = self
            .connections
            .increment_auth_failures(connection.id)
            .await?;
        warn!(tenant_id = %tenant_id, failures, "CRM authentication failure recorded");

        if failures >= self.config.max_auth_failures {
            return Ok(self.deactivate(tenant_id, "auth_failures").await?.is_some());
        }
        Ok(false)
    }

    /// Deactivates the active connection. Idempotent.
    pub async fn deactivate(
        &self,
        tenant_id: Uuid,
        reason: &str,
    ) -> Result<Option<Connection>, EngineError> {
        let deactivated = self.connections.deactivate_active(tenant_id, reason).await?;
        if let Some(ref connection) = deactivated {
            warn!(
                tenant_id = %tenant_id,
                connection_id = %connection.id,
                reason,
                "CRM connection deactivated"
            );
            self.events.emit(SyncEvent::ConnectionDeactivated {
                tenant_id,
                connection_id: connection.id,
                reason: reason.to_string(),
            });
        }
        Ok(deactivated)
    }

    pub async fn touch_last_sync(&self, tenant_id: Uuid, at: DateTime<Utc>) -> Result<(), EngineError> {
        Ok(self.connections.touch_last_sync(tenant_id, at).await?)
    }

    async fn active_or_unauthenticated(&self, tenant_id: Uuid) -> Result<Connection, EngineError> {
        self.connections
            .find_active(tenant_id)
            .await?
            .ok_or_else(|| EngineError::Unauthenticated("no active CRM connection".to_string()))
    }

    async fn tenant_lock(&self, tenant_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        locks
            .entry(tenant_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn open_access_token(&self, connection: &Connection) -> Result<AccessToken, EngineError> {
        let value = decrypt_token(
            &self.key,
            connection.tenant_id,
            &connection.external_account_id,
            TokenKind::Access,
            &connection.access_token_ciphertext,
        )
        .map_err(|e| EngineError::Unauthenticated(format!("access token unreadable: {e}")))?;

        Ok(AccessToken {
            value,
            connection_id: connection.id,
            token_version: connection.token_version,
        })
    }

    fn seal(
        &self,
        tenant_id: Uuid,
        account: &str,
        kind: TokenKind,
        token: &str,
    ) -> Result<Vec<u8>, EngineError> {
        encrypt_token(&self.key, tenant_id, account, kind, token)
            .map_err(|e| EngineError::Unauthenticated(format!("token encryption failed: {e}")))
    }
}

fn is_expired(connection: &Connection) -> bool {
    connection
        .expires_at
        .map(|exp| exp.with_timezone(&Utc) <= Utc::now())
        .unwrap_or(false)
}
