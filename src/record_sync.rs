//! Single-record synchronization shared by the executor, the webhook
//! ingestor and the retry sweep.
//!
//! Each successful write stamps the mapping with the newest modification
//! timestamp it propagated (`synced_version_at`). Change-set entries that are
//! not newer than that stamp are echoes of our own writes, or records already
//! applied before a rate-limit pause, and are skipped.
//!
//! Operations on one record are serialized in-process: a push holds the
//! local id, a pull holds the external id.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::{DateTime, Utc};
use metrics::counter;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::credentials::CredentialStore;
use crate::crm::{CrmClient, CrmError, CrmRecord};
use crate::error::EngineError;
use crate::field_mapping::FieldMapping;
use crate::identity::IdentityMapper;
use crate::local::{LocalRecord, LocalStore};
use crate::models::{ObjectType, SyncDirection};
use crate::repositories::ObjectStateRepository;

/// Per-(tenant, object type) inputs for record operations.
#[derive(Debug, Clone)]
pub struct SyncContext {
    pub tenant_id: Uuid,
    pub object_type: ObjectType,
    /// Owning job; `None` for webhook-applied changes
    pub job_id: Option<Uuid>,
    pub mapping: FieldMapping,
    pub properties: Vec<String>,
}

impl SyncContext {
    pub fn new(
        tenant_id: Uuid,
        object_type: ObjectType,
        job_id: Option<Uuid>,
        mapping: FieldMapping,
    ) -> Self {
        let properties = mapping.external_properties();
        Self {
            tenant_id,
            object_type,
            job_id,
            mapping,
            properties,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Version not newer than the last propagated one
    AlreadySynced,
    /// The pair's mapping has been soft-expired
    Expired,
    /// An equal or newer change was already applied for the object
    Stale,
    /// Deleted on the source side and never mapped
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Created { local_id: String, external_id: String },
    Updated { local_id: String, external_id: String },
    /// The counterpart is gone; the mapping was soft-expired.
    Expired,
    Skipped(SkipReason),
}

impl RecordOutcome {
    /// Whether this outcome wrote to the destination side.
    pub fn wrote(&self) -> bool {
        matches!(
            self,
            RecordOutcome::Created { .. } | RecordOutcome::Updated { .. }
        )
    }

    fn label(&self) -> &'static str {
        match self {
            RecordOutcome::Created { .. } => "created",
            RecordOutcome::Updated { .. } => "updated",
            RecordOutcome::Expired => "expired",
            RecordOutcome::Skipped(_) => "skipped",
        }
    }
}

/// Tenant, object type, id side and id.
type RecordKey = (Uuid, ObjectType, SyncDirection, String);

#[derive(Default)]
struct RecordLocks {
    held: StdMutex<HashMap<RecordKey, Arc<Mutex<()>>>>,
}

impl RecordLocks {
    async fn acquire(&self, key: RecordKey) -> RecordGuard<'_> {
        let slot = {
            let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
            held.entry(key.clone()).or_default().clone()
        };
        let guard = slot.clone().lock_owned().await;
        RecordGuard {
            locks: self,
            key,
            slot,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Releases the record lock and drops its slot once nobody else waits on it.
struct RecordGuard<'a> {
    locks: &'a RecordLocks,
    key: RecordKey,
    slot: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RecordGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut held = self
            .locks
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // The map and this guard are the only holders left.
        if Arc::strong_count(&self.slot) == 2 {
            held.remove(&self.key);
        }
    }
}

pub struct RecordSyncer {
    crm: Arc<dyn CrmClient>,
    local: Arc<dyn LocalStore>,
    identity: Arc<IdentityMapper>,
    credentials: Arc<CredentialStore>,
    object_states: ObjectStateRepository,
    locks: RecordLocks,
}

impl RecordSyncer {
    pub fn new(
        crm: Arc<dyn CrmClient>,
        local: Arc<dyn LocalStore>,
        identity: Arc<IdentityMapper>,
        credentials: Arc<CredentialStore>,
        object_states: ObjectStateRepository,
    ) -> Self {
        Self {
            crm,
            local,
            identity,
            credentials,
            object_states,
            locks: RecordLocks::default(),
        }
    }

    pub fn crm(&self) -> &Arc<dyn CrmClient> {
        &self.crm
    }

    pub fn local(&self) -> &Arc<dyn LocalStore> {
        &self.local
    }

    /// Runs a CRM call with the tenant's access token.
    ///
    /// A 401 triggers one coalesced refresh and one replay. A second 401 is
    /// counted against the connection and surfaces as `Unauthenticated`.
    pub async fn call_crm<T, F, Fut>(&self, tenant_id: Uuid, call: F) -> Result<T, EngineError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, CrmError>>,
    {
        let token = self.credentials.valid_access_token(tenant_id).await?;
        match call(token.value).await {
            Err(CrmError::Unauthorized) => {}
            other => return other.map_err(EngineError::from),
        }

        debug!(tenant_id = %tenant_id, "CRM returned 401; refreshing token and replaying");
        self.credentials
            .refresh_if_stale(tenant_id, token.token_version)
            .await?;
        let token = self.credentials.valid_access_token(tenant_id).await?;

        match call(token.value).await {
            Err(CrmError::Unauthorized) => {
                self.credentials.record_auth_failure(tenant_id).await?;
                Err(EngineError::Unauthenticated(
                    "CRM rejected refreshed access token".to_string(),
                ))
            }
            other => other.map_err(EngineError::from),
        }
    }

    /// Propagates one local record to the CRM.
    pub async fn push(
        &self,
        ctx: &SyncContext,
        record: &LocalRecord,
    ) -> Result<RecordOutcome, EngineError> {
        let _held = self
            .locks
            .acquire(record_key(ctx, SyncDirection::ToExternal, &record.id))
            .await;
        let outcome = self.push_inner(ctx, record).await;
        observe(SyncDirection::ToExternal, &outcome);
        outcome
    }

    async fn push_inner(
        &self,
        ctx: &SyncContext,
        record: &LocalRecord,
    ) -> Result<RecordOutcome, EngineError> {
        let mapping = self
            .identity
            .find_by_local(ctx.tenant_id, ctx.object_type, &record.id)
            .await?;

        if let Some(ref mapping) = mapping {
            if mapping.is_expired() {
                return Ok(RecordOutcome::Skipped(SkipReason::Expired));
            }
            if record.updated_at <= mapping.synced_version_at.with_timezone(&Utc) {
                return Ok(RecordOutcome::Skipped(SkipReason::AlreadySynced));
            }
        }

        if record.deleted {
            return match mapping {
                Some(mapping) => {
                    self.identity.expire(&mapping, "deleted_locally").await?;
                    Ok(RecordOutcome::Expired)
                }
                None => Ok(RecordOutcome::Skipped(SkipReason::Deleted)),
            };
        }

        let properties = ctx.mapping.to_external(&record.fields)?;
        let object_type = ctx.object_type;

        match mapping {
            Some(mapping) => {
                let external_id = mapping.external_id.clone();
                let crm = self.crm.clone();
                let result = self
                    .call_crm(ctx.tenant_id, |token| {
                        let crm = crm.clone();
                        let external_id = external_id.clone();
                        let properties = properties.clone();
                        async move {
                            crm.update_record(&token, object_type, &external_id, properties)
                                .await
                        }
                    })
                    .await;

                let ack = match result {
                    Ok(ack) => ack,
                    Err(EngineError::NotFound(_)) => {
                        self.identity.expire(&mapping, "missing_externally").await?;
                        return Ok(RecordOutcome::Expired);
                    }
                    Err(err) => return Err(err),
                };

                self.identity
                    .record_sync(
                        &mapping,
                        SyncDirection::ToExternal,
                        latest(record.updated_at, ack.updated_at),
                    )
                    .await?;
                Ok(RecordOutcome::Updated {
                    local_id: mapping.local_id,
                    external_id: mapping.external_id,
                })
            }
            None => {
                let crm = self.crm.clone();
                let ack = self
                    .call_crm(ctx.tenant_id, |token| {
                        let crm = crm.clone();
                        let properties = properties.clone();
                        async move { crm.create_record(&token, object_type, properties).await }
                    })
                    .await?;

                let created = self
                    .identity
                    .create_mapping(
                        ctx.tenant_id,
                        ctx.object_type,
                        &record.id,
                        &ack.id,
                        SyncDirection::ToExternal,
                        latest(record.updated_at, ack.updated_at),
                    )
                    .await;
                let created = match created {
                    Ok(created) => created,
                    Err(EngineError::ConflictingMapping {
                        object_type,
                        local_id,
                        external_id,
                        detail,
                    }) => {
                        warn!(
                            tenant_id = %ctx.tenant_id,
                            object_type = %ctx.object_type,
                            local_id = %record.id,
                            orphan_external_id = %ack.id,
                            "another writer mapped this record first; CRM copy left unmapped"
                        );
                        return Err(EngineError::ConflictingMapping {
                            object_type,
                            local_id,
                            external_id,
                            detail: format!("{detail}; unmapped CRM record '{}'", ack.id),
                        });
                    }
                    Err(err) => return Err(err),
                };
                Ok(RecordOutcome::Created {
                    local_id: created.local_id,
                    external_id: created.external_id,
                })
            }
        }
    }

    /// Propagates one CRM record locally, enforcing per-object ordering on
    /// its modification timestamp.
    pub async fn pull(
        &self,
        ctx: &SyncContext,
        record: &CrmRecord,
    ) -> Result<RecordOutcome, EngineError> {
        let _held = self
            .locks
            .acquire(record_key(ctx, SyncDirection::FromExternal, &record.id))
            .await;
        let advanced = self
            .object_states
            .advance(ctx.tenant_id, ctx.object_type, &record.id, record.updated_at)
            .await?;
        let outcome = if advanced {
            self.pull_inner(ctx, record).await
        } else {
            Ok(RecordOutcome::Skipped(SkipReason::Stale))
        };
        observe(SyncDirection::FromExternal, &outcome);
        outcome
    }

    /// Propagates one CRM record locally. The caller has already passed
    /// the ordering check.
    pub async fn apply_pull(
        &self,
        ctx: &SyncContext,
        record: &CrmRecord,
    ) -> Result<RecordOutcome, EngineError> {
        let _held = self
            .locks
            .acquire(record_key(ctx, SyncDirection::FromExternal, &record.id))
            .await;
        let outcome = self.pull_inner(ctx, record).await;
        observe(SyncDirection::FromExternal, &outcome);
        outcome
    }

    async fn pull_inner(
        &self,
        ctx: &SyncContext,
        record: &CrmRecord,
    ) -> Result<RecordOutcome, EngineError> {
        let mapping = self
            .identity
            .find_by_external(ctx.tenant_id, ctx.object_type, &record.id)
            .await?;

        if let Some(ref mapping) = mapping {
            if mapping.is_expired() {
                return Ok(RecordOutcome::Skipped(SkipReason::Expired));
            }
            if record.updated_at <= mapping.synced_version_at.with_timezone(&Utc) {
                return Ok(RecordOutcome::Skipped(SkipReason::AlreadySynced));
            }
        }

        if record.archived {
            return match mapping {
                Some(mapping) => {
                    self.identity.expire(&mapping, "archived_externally").await?;
                    Ok(RecordOutcome::Expired)
                }
                None => Ok(RecordOutcome::Skipped(SkipReason::Deleted)),
            };
        }

        let fields = ctx.mapping.to_local(&record.properties)?;

        match mapping {
            Some(mapping) => {
                let updated = self
                    .local
                    .update(
                        ctx.tenant_id,
                        ctx.object_type,
                        &mapping.local_id,
                        fields,
                        record.updated_at,
                    )
                    .await;
                match updated {
                    Ok(()) => {}
                    Err(EngineError::NotFound(_)) => {
                        self.identity.expire(&mapping, "missing_locally").await?;
                        return Ok(RecordOutcome::Expired);
                    }
                    Err(err) => return Err(err),
                }

                self.identity
                    .record_sync(&mapping, SyncDirection::FromExternal, record.updated_at)
                    .await?;
                Ok(RecordOutcome::Updated {
                    local_id: mapping.local_id,
                    external_id: mapping.external_id,
                })
            }
            None => {
                let local_id = self
                    .local
                    .create(ctx.tenant_id, ctx.object_type, fields, record.updated_at)
                    .await?;
                let created = self
                    .identity
                    .create_mapping(
                        ctx.tenant_id,
                        ctx.object_type,
                        &local_id,
                        &record.id,
                        SyncDirection::FromExternal,
                        record.updated_at,
                    )
                    .await;
                let created = match created {
                    Ok(created) => created,
                    Err(err @ EngineError::ConflictingMapping { .. }) => {
                        warn!(
                            tenant_id = %ctx.tenant_id,
                            object_type = %ctx.object_type,
                            external_id = %record.id,
                            orphan_local_id = %local_id,
                            "another writer mapped this record first; retiring local copy"
                        );
                        self.local
                            .mark_deleted(ctx.tenant_id, ctx.object_type, &local_id, record.updated_at)
                            .await?;
                        return Err(err);
                    }
                    Err(err) => return Err(err),
                };
                Ok(RecordOutcome::Created {
                    local_id: created.local_id,
                    external_id: created.external_id,
                })
            }
        }
    }

    /// Reads one CRM record; `None` when it no longer exists.
    pub async fn fetch_external(
        &self,
        ctx: &SyncContext,
        external_id: &str,
    ) -> Result<Option<CrmRecord>, EngineError> {
        let crm = self.crm.clone();
        let object_type = ctx.object_type;
        let properties = ctx.properties.clone();
        let id = external_id.to_string();
        let result = self
            .call_crm(ctx.tenant_id, |token| {
                let crm = crm.clone();
                let properties = properties.clone();
                let id = id.clone();
                async move {
                    crm.fetch_record(&token, object_type, &id, &properties)
                        .await
                }
            })
            .await;

        match result {
            Ok(record) => Ok(Some(record)),
            Err(EngineError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Re-runs the push for a local id from its current state.
    pub async fn push_by_id(
        &self,
        ctx: &SyncContext,
        local_id: &str,
    ) -> Result<RecordOutcome, EngineError> {
        match self
            .local
            .get(ctx.tenant_id, ctx.object_type, local_id)
            .await?
        {
            Some(record) => self.push(ctx, &record).await,
            None => self.expire_by_local(ctx, local_id, "missing_locally").await,
        }
    }

    /// Re-runs the pull for an external id from its current CRM state.
    pub async fn pull_by_id(
        &self,
        ctx: &SyncContext,
        external_id: &str,
    ) -> Result<RecordOutcome, EngineError> {
        match self.fetch_external(ctx, external_id).await? {
            Some(record) => self.pull(ctx, &record).await,
            None => self.expire_by_external(ctx, external_id, "missing_externally").await,
        }
    }

    /// Soft-expires the mapping of an externally deleted object, if any.
    pub async fn expire_by_external(
        &self,
        ctx: &SyncContext,
        external_id: &str,
        reason: &str,
    ) -> Result<RecordOutcome, EngineError> {
        match self
            .identity
            .find_by_external(ctx.tenant_id, ctx.object_type, external_id)
            .await?
        {
            Some(mapping) => {
                self.identity.expire(&mapping, reason).await?;
                Ok(RecordOutcome::Expired)
            }
            None => Ok(RecordOutcome::Skipped(SkipReason::Deleted)),
        }
    }

    async fn expire_by_local(
        &self,
        ctx: &SyncContext,
        local_id: &str,
        reason: &str,
    ) -> Result<RecordOutcome, EngineError> {
        match self
            .identity
            .find_by_local(ctx.tenant_id, ctx.object_type, local_id)
            .await?
        {
            Some(mapping) => {
                self.identity.expire(&mapping, reason).await?;
                Ok(RecordOutcome::Expired)
            }
            None => Ok(RecordOutcome::Skipped(SkipReason::Deleted)),
        }
    }
}

fn record_key(ctx: &SyncContext, side: SyncDirection, id: &str) -> RecordKey {
    (ctx.tenant_id, ctx.object_type, side, id.to_string())
}

fn latest(a: DateTime<Utc>, b: DateTime<Utc>) -> DateTime<Utc> {
    a.max(b)
}

fn observe(direction: SyncDirection, outcome: &Result<RecordOutcome, EngineError>) {
    match outcome {
        Ok(outcome) => {
            counter!(
                "crm_sync_records_total",
                "direction" => direction.as_str(),
                "outcome" => outcome.label()
            )
            .increment(1);
        }
        Err(err) => {
            if !matches!(err, EngineError::RateLimited { .. }) {
                warn!(
                    direction = direction.as_str(),
                    error_code = err.code(),
                    error = %err,
                    "Record sync failed"
                );
            }
            counter!(
                "crm_sync_records_failed_total",
                "direction" => direction.as_str(),
                "error_code" => err.code()
            )
            .increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(id: &str) -> RecordKey {
        (
            Uuid::nil(),
            ObjectType::Contact,
            SyncDirection::FromExternal,
            id.to_string(),
        )
    }

    #[tokio::test]
    async fn same_record_waits_for_the_holder() {
        let locks = RecordLocks::default();
        let first = locks.acquire(key("501")).await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), locks.acquire(key("501"))).await;
        assert!(blocked.is_err());

        let other = tokio::time::timeout(Duration::from_millis(50), locks.acquire(key("502"))).await;
        assert!(other.is_ok());
        drop(other);

        drop(first);
        let reacquired = tokio::time::timeout(Duration::from_millis(50), locks.acquire(key("501"))).await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn released_slots_are_dropped() {
        let locks = RecordLocks::default();
        {
            let _a = locks.acquire(key("501")).await;
            let _b = locks.acquire(key("502")).await;
            assert_eq!(locks.len(), 2);
        }
        assert_eq!(locks.len(), 0);
    }
}
