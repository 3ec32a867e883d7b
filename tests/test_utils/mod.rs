//! Test utilities shared by the integration tests.
//!
//! Provides an in-memory SQLite database with migrations applied, a
//! scriptable [`FakeCrm`], a [`RecordingEventSink`] and a [`Harness`] that
//! wires every component the way `main` does.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use crm_sync::config::AppConfig;
use crm_sync::credentials::{ConnectionMetadata, ConnectionTokens};
use crm_sync::crm::{CrmClient, CrmError, CrmRecord, CrmWriteAck, Properties, TokenGrant};
use crm_sync::crypto::CryptoKey;
use crm_sync::events::{EventSink, SyncEvent};
use crm_sync::local::{DbLocalStore, Fields, LocalStore};
use crm_sync::models::{ObjectType, SyncDirection};
use crm_sync::models::sync_job::{JobTrigger, Model as SyncJobModel};
use crm_sync::repositories::sync_config::SyncConfigInput;
use crm_sync::repositories::sync_job::{EnqueueOutcome, NewJob};
use crm_sync::repositories::{SyncConfigRepository, SyncJobRepository};
use crm_sync::sync_executor::TickStats;
use crm_sync::runtime::Components;
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use serde_json::{Value as JsonValue, json};
use uuid::Uuid;

pub const PORTAL_ID: &str = "62515";
pub const INITIAL_ACCESS_TOKEN: &str = "access-initial";
pub const REFRESH_TOKEN: &str = "refresh-initial";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

pub fn test_key() -> CryptoKey {
    CryptoKey::new(vec![7u8; 32]).expect("32-byte key")
}

/// Scriptable in-memory CRM.
#[derive(Default)]
pub struct FakeCrm {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    records: BTreeMap<(ObjectType, String), CrmRecord>,
    next_id: u64,
    last_write_at: Option<DateTime<Utc>>,
    /// Successful writes before every further write is rate limited
    write_budget: Option<usize>,
    rate_limit_retry_after: Option<u64>,
    rate_limit_reads: bool,
    rejected_tokens: HashSet<String>,
    reject_all_tokens: bool,
    refresh_revoked: bool,
    refresh_delay_ms: u64,
    write_delay_ms: u64,
    failing_writes: HashMap<String, CrmError>,
    creates: usize,
    updates: usize,
    refreshes: usize,
    issued_tokens: usize,
}

impl FakeCrm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Inserts or replaces a record as if it had been edited in the CRM.
    pub fn put(&self, object_type: ObjectType, id: &str, properties: JsonValue, at: DateTime<Utc>) {
        let properties = properties.as_object().cloned().unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        state.records.insert(
            (object_type, id.to_string()),
            CrmRecord {
                id: id.to_string(),
                properties,
                updated_at: at,
                archived: false,
            },
        );
    }

    pub fn archive(&self, object_type: ObjectType, id: &str, at: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.records.get_mut(&(object_type, id.to_string())) {
            record.archived = true;
            record.updated_at = at;
        }
    }

    pub fn remove(&self, object_type: ObjectType, id: &str) {
        self.state
            .lock()
            .unwrap()
            .records
            .remove(&(object_type, id.to_string()));
    }

    pub fn get(&self, object_type: ObjectType, id: &str) -> Option<CrmRecord> {
        self.state
            .lock()
            .unwrap()
            .records
            .get(&(object_type, id.to_string()))
            .cloned()
    }

    pub fn records(&self, object_type: ObjectType) -> Vec<CrmRecord> {
        self.state
            .lock()
            .unwrap()
            .records
            .iter()
            .filter(|((ot, _), _)| *ot == object_type)
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Allows `writes` more successful writes, then answers 429.
    pub fn rate_limit_after(&self, writes: usize, retry_after_secs: Option<u64>) {
        let mut state = self.state.lock().unwrap();
        state.write_budget = Some(writes);
        state.rate_limit_retry_after = retry_after_secs;
    }

    pub fn rate_limit_reads(&self, enabled: bool) {
        self.state.lock().unwrap().rate_limit_reads = enabled;
    }

    pub fn lift_rate_limit(&self) {
        let mut state = self.state.lock().unwrap();
        state.write_budget = None;
        state.rate_limit_reads = false;
    }

    pub fn reject_token(&self, token: &str) {
        self.state
            .lock()
            .unwrap()
            .rejected_tokens
            .insert(token.to_string());
    }

    pub fn reject_all_tokens(&self, enabled: bool) {
        self.state.lock().unwrap().reject_all_tokens = enabled;
    }

    pub fn revoke_refresh(&self) {
        self.state.lock().unwrap().refresh_revoked = true;
    }

    pub fn set_refresh_delay(&self, millis: u64) {
        self.state.lock().unwrap().refresh_delay_ms = millis;
    }

    /// Every create and update takes `millis` before it lands.
    pub fn set_write_delay(&self, millis: u64) {
        self.state.lock().unwrap().write_delay_ms = millis;
    }

    /// Writes touching `key` (external id on update, a property value on create) fail.
    pub fn fail_writes_for(&self, key: &str, error: CrmError) {
        self.state
            .lock()
            .unwrap()
            .failing_writes
            .insert(key.to_string(), error);
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failing_writes.clear();
    }

    pub fn creates(&self) -> usize {
        self.state.lock().unwrap().creates
    }

    pub fn updates(&self) -> usize {
        self.state.lock().unwrap().updates
    }

    pub fn refreshes(&self) -> usize {
        self.state.lock().unwrap().refreshes
    }

    async fn write_latency(&self) {
        let delay = self.state.lock().unwrap().write_delay_ms;
        if delay > 0 {
            tokio::time::sleep(StdDuration::from_millis(delay)).await;
        }
    }

    fn check_token(state: &FakeState, token: &str) -> Result<(), CrmError> {
        if state.reject_all_tokens || state.rejected_tokens.contains(token) {
            return Err(CrmError::Unauthorized);
        }
        Ok(())
    }

    fn take_write_budget(state: &mut FakeState) -> Result<(), CrmError> {
        match state.write_budget {
            Some(0) => Err(CrmError::RateLimited {
                retry_after_secs: state.rate_limit_retry_after,
            }),
            Some(ref mut remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Strictly increasing write timestamps.
    fn write_clock(state: &mut FakeState) -> DateTime<Utc> {
        let now = Utc::now();
        let at = match state.last_write_at {
            Some(last) if last >= now => last + Duration::milliseconds(1),
            _ => now,
        };
        state.last_write_at = Some(at);
        at
    }
}

#[async_trait]
impl CrmClient for FakeCrm {
    async fn fetch_changed(
        &self,
        access_token: &str,
        object_type: ObjectType,
        since: Option<DateTime<Utc>>,
        _properties: &[String],
    ) -> Result<Vec<CrmRecord>, CrmError> {
        let state = self.state.lock().unwrap();
        Self::check_token(&state, access_token)?;
        if state.rate_limit_reads {
            return Err(CrmError::RateLimited {
                retry_after_secs: state.rate_limit_retry_after,
            });
        }
        let mut changed: Vec<CrmRecord> = state
            .records
            .iter()
            .filter(|((ot, _), r)| *ot == object_type && since.is_none_or(|s| r.updated_at >= s))
            .map(|(_, r)| r.clone())
            .collect();
        changed.sort_by_key(|r| r.updated_at);
        Ok(changed)
    }

    async fn fetch_record(
        &self,
        access_token: &str,
        object_type: ObjectType,
        external_id: &str,
        _properties: &[String],
    ) -> Result<CrmRecord, CrmError> {
        let state = self.state.lock().unwrap();
        Self::check_token(&state, access_token)?;
        if state.rate_limit_reads {
            return Err(CrmError::RateLimited {
                retry_after_secs: state.rate_limit_retry_after,
            });
        }
        state
            .records
            .get(&(object_type, external_id.to_string()))
            .cloned()
            .ok_or_else(|| CrmError::NotFound(external_id.to_string()))
    }

    async fn create_record(
        &self,
        access_token: &str,
        object_type: ObjectType,
        properties: Properties,
    ) -> Result<CrmWriteAck, CrmError> {
        self.write_latency().await;
        let mut state = self.state.lock().unwrap();
        Self::check_token(&state, access_token)?;
        for value in properties.values() {
            if let Some(err) = value.as_str().and_then(|v| state.failing_writes.get(v)) {
                return Err(err.clone());
            }
        }
        Self::take_write_budget(&mut state)?;

        state.next_id += 1;
        let id = format!("{}", 1000 + state.next_id);
        let at = Self::write_clock(&mut state);
        state.creates += 1;
        state.records.insert(
            (object_type, id.clone()),
            CrmRecord {
                id: id.clone(),
                properties,
                updated_at: at,
                archived: false,
            },
        );
        Ok(CrmWriteAck { id, updated_at: at })
    }

    async fn update_record(
        &self,
        access_token: &str,
        object_type: ObjectType,
        external_id: &str,
        properties: Properties,
    ) -> Result<CrmWriteAck, CrmError> {
        self.write_latency().await;
        let mut state = self.state.lock().unwrap();
        Self::check_token(&state, access_token)?;
        if let Some(err) = state.failing_writes.get(external_id) {
            return Err(err.clone());
        }
        if !state
            .records
            .contains_key(&(object_type, external_id.to_string()))
        {
            return Err(CrmError::NotFound(external_id.to_string()));
        }
        Self::take_write_budget(&mut state)?;

        let at = Self::write_clock(&mut state);
        state.updates += 1;
        let record = state
            .records
            .get_mut(&(object_type, external_id.to_string()))
            .ok_or_else(|| CrmError::NotFound(external_id.to_string()))?;
        record.properties.extend(properties);
        record.updated_at = at;
        Ok(CrmWriteAck {
            id: external_id.to_string(),
            updated_at: at,
        })
    }

    async fn refresh_token(&self, _refresh_token: &str) -> Result<TokenGrant, CrmError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.refreshes += 1;
            if state.refresh_revoked {
                return Err(CrmError::AuthRevoked("invalid_grant".to_string()));
            }
            state.refresh_delay_ms
        };
        if delay > 0 {
            tokio::time::sleep(StdDuration::from_millis(delay)).await;
        }

        let mut state = self.state.lock().unwrap();
        state.issued_tokens += 1;
        Ok(TokenGrant {
            access_token: format!("access-{}", state.issued_tokens),
            refresh_token: Some(format!("refresh-{}", state.issued_tokens)),
            expires_in_secs: Some(3600),
        })
    }
}

/// Captures emitted events for assertions.
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingEventSink {
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(SyncEvent::kind).collect()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: SyncEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Name/email rules used by most tests.
pub fn contact_rules() -> JsonValue {
    json!([
        { "local_field": "name", "external_field": "firstname", "local_type": "string", "external_type": "string" },
        { "local_field": "email", "external_field": "email", "transform": "lowercase" }
    ])
}

pub fn fields(value: JsonValue) -> Fields {
    value.as_object().cloned().unwrap_or_default()
}

/// Every component over one in-memory database and a fake CRM.
pub struct Harness {
    pub db: DatabaseConnection,
    pub config: AppConfig,
    pub crm: Arc<FakeCrm>,
    pub local: Arc<DbLocalStore>,
    pub events: Arc<RecordingEventSink>,
    pub components: Components,
    pub tenant_id: Uuid,
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig {
        profile: "test".to_string(),
        crypto_key: Some(vec![7u8; 32]),
        ..AppConfig::default()
    };
    config.executor.inline_retries = 0;
    config.executor.max_run_seconds = 60;
    config.rate_limit_policy.jitter_factor = 0.0;
    config.retry.base_seconds = 30;
    config.retry.max_seconds = 3600;
    config.retry.max_retries = 3;
    config.webhook.batch_threshold = 10;
    config
}

impl Harness {
    pub async fn new() -> Result<Self> {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: AppConfig) -> Result<Self> {
        let db = setup_test_db().await?;
        let crm = FakeCrm::new();
        let local = Arc::new(DbLocalStore::new(db.clone()));
        let events = Arc::new(RecordingEventSink::default());
        let components = Components::build(
            &config,
            db.clone(),
            crm.clone(),
            local.clone(),
            test_key(),
            events.clone(),
        );

        Ok(Self {
            db,
            config,
            crm,
            local,
            events,
            components,
            tenant_id: Uuid::new_v4(),
        })
    }

    /// Stores an active connection whose access token is valid for an hour.
    pub async fn connect(&self) -> Result<()> {
        self.connect_expiring_at(Utc::now() + Duration::hours(1))
            .await
    }

    pub async fn connect_expiring_at(&self, expires_at: DateTime<Utc>) -> Result<()> {
        self.components
            .credentials
            .store_connection(
                self.tenant_id,
                ConnectionTokens {
                    access_token: INITIAL_ACCESS_TOKEN.to_string(),
                    refresh_token: Some(REFRESH_TOKEN.to_string()),
                    expires_at: Some(expires_at),
                },
                ConnectionMetadata {
                    external_account_id: PORTAL_ID.to_string(),
                    external_domain: Some("acme.hubspot.com".to_string()),
                    scopes: vec!["crm.objects.contacts.read".to_string()],
                    actor_user_id: None,
                },
            )
            .await?;
        Ok(())
    }

    pub fn configs(&self) -> SyncConfigRepository {
        SyncConfigRepository::new(self.db.clone())
    }

    pub async fn configure(&self, object_type: ObjectType, direction: SyncDirection) -> Result<()> {
        self.configs()
            .upsert(
                self.tenant_id,
                object_type,
                SyncConfigInput {
                    direction,
                    enabled: true,
                    field_mappings: contact_rules(),
                    cadence_minutes: 15,
                },
            )
            .await?;
        Ok(())
    }

    /// Creates a local contact stamped with `at`.
    pub async fn local_contact(&self, name: &str, at: DateTime<Utc>) -> Result<String> {
        let id = self
            .local
            .create(
                self.tenant_id,
                ObjectType::Contact,
                fields(json!({ "name": name, "email": format!("{name}@example.com") })),
                at,
            )
            .await?;
        Ok(id)
    }

    pub fn jobs(&self) -> SyncJobRepository {
        SyncJobRepository::new(self.db.clone())
    }

    /// Enqueues a due job for the configured direction of `object_type`.
    pub async fn enqueue_job(&self, object_type: ObjectType) -> Result<SyncJobModel> {
        let config = self
            .configs()
            .get(self.tenant_id, object_type)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no sync config for {object_type}"))?;
        match self
            .jobs()
            .enqueue(NewJob {
                tenant_id: self.tenant_id,
                object_type,
                direction: config.direction,
                trigger: JobTrigger::Schedule,
                scheduled_at: Utc::now(),
                metadata: json!({ "reason": "test" }),
            })
            .await?
        {
            EnqueueOutcome::Enqueued(job) => Ok(job),
            EnqueueOutcome::AlreadyPending => anyhow::bail!("a job is already in flight"),
        }
    }

    /// Runs one executor tick as of `now`.
    pub async fn run_executor(&self, now: DateTime<Utc>) -> Result<TickStats> {
        Ok(self.components.executor.clone().tick(now).await?)
    }

    /// Enqueues and runs one job, returning its final row.
    pub async fn sync_once(&self, object_type: ObjectType) -> Result<SyncJobModel> {
        let job = self.enqueue_job(object_type).await?;
        self.run_executor(Utc::now()).await?;
        self.jobs()
            .find_by_id(job.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("job {} vanished", job.id))
    }
}
