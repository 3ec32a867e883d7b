//! # Webhook Ingestor
//!
//! Turns HubSpot webhook batches into record syncs. Every event is logged
//! once per (tenant, event id); redeliveries are counted and dropped before
//! any processing. Accepted events are applied per object in
//! non-decreasing `occurredAt` order through the shared per-object ordering
//! state, so an older event arriving late is recorded as `stale` and has no
//! effect.
//!
//! Small groups are applied inline through the [`RecordSyncer`]. A group of
//! `batch_threshold` or more events for one object type enqueues a scoped
//! sync job instead.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use metrics::counter;
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::WebhookConfig;
use crate::credentials::CredentialStore;
use crate::error::EngineError;
use crate::field_mapping::FieldMapping;
use crate::models::sync_config::Model as SyncConfigModel;
use crate::models::sync_job::JobTrigger;
use crate::models::webhook_event::{Model as WebhookEventModel, WebhookOutcome};
use crate::models::{ObjectType, SyncDirection};
use crate::record_sync::{RecordOutcome, RecordSyncer, SkipReason, SyncContext};
use crate::repositories::sync_job::{EnqueueOutcome, NewJob};
use crate::repositories::webhook_event::{NewWebhookEvent, RecordOutcome as LogOutcome};
use crate::repositories::{
    ObjectStateRepository, SyncConfigRepository, SyncJobRepository, WebhookEventRepository,
};
use crate::retry::{RecordFailure, RetryManager};

/// What happened to an object, as far as the ingestor cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Created, updated, restored or merged; the current state is fetched.
    Upsert,
    Deletion,
}

/// A validated HubSpot webhook event.
#[derive(Debug, Clone, PartialEq)]
pub struct HubSpotEvent {
    pub event_id: String,
    pub portal_id: Option<String>,
    pub subscription_type: String,
    pub object_type: ObjectType,
    pub object_id: String,
    pub occurred_at: DateTime<Utc>,
    pub change: ChangeKind,
}

/// Per-outcome counts for one delivered batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct IngestSummary {
    pub received: usize,
    pub duplicates: usize,
    pub applied: usize,
    pub stale: usize,
    pub ignored: usize,
    pub enqueued: usize,
    pub failed: usize,
}

impl IngestSummary {
    fn count(&mut self, outcome: WebhookOutcome) {
        match outcome {
            WebhookOutcome::Applied => self.applied += 1,
            WebhookOutcome::Stale => self.stale += 1,
            WebhookOutcome::Ignored => self.ignored += 1,
            WebhookOutcome::Enqueued => self.enqueued += 1,
        }
    }
}

fn id_string(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

/// Validates one raw event from a HubSpot batch.
pub fn parse_event(raw: &JsonValue) -> Result<HubSpotEvent, String> {
    let event_id = id_string(raw.get("eventId")).ok_or("missing eventId")?;
    let subscription_type = raw
        .get("subscriptionType")
        .and_then(JsonValue::as_str)
        .ok_or("missing subscriptionType")?
        .to_string();

    let (object_part, action) = subscription_type
        .split_once('.')
        .ok_or_else(|| format!("unrecognized subscriptionType '{subscription_type}'"))?;
    let object_type: ObjectType = object_part.parse()?;
    let change = match action {
        "deletion" | "privacyDeletion" => ChangeKind::Deletion,
        _ => ChangeKind::Upsert,
    };

    let object_id = id_string(raw.get("objectId")).ok_or("missing objectId")?;
    let occurred_ms = raw
        .get("occurredAt")
        .and_then(JsonValue::as_i64)
        .ok_or("missing or non-integer occurredAt")?;
    let occurred_at = Utc
        .timestamp_millis_opt(occurred_ms)
        .single()
        .ok_or_else(|| format!("occurredAt {occurred_ms} out of range"))?;

    Ok(HubSpotEvent {
        event_id,
        portal_id: id_string(raw.get("portalId")),
        subscription_type,
        object_type,
        object_id,
        occurred_at,
        change,
    })
}

/// Dedupe key for an event that failed validation.
fn fallback_event_id(raw: &JsonValue) -> String {
    match id_string(raw.get("eventId")) {
        Some(id) => id,
        None => {
            let bytes = serde_json::to_vec(raw).unwrap_or_default();
            format!("sha256:{}", hex::encode(Sha256::digest(&bytes)))
        }
    }
}

pub struct WebhookIngestor {
    events: WebhookEventRepository,
    configs: SyncConfigRepository,
    jobs: SyncJobRepository,
    object_states: ObjectStateRepository,
    credentials: Arc<CredentialStore>,
    syncer: Arc<RecordSyncer>,
    retry: Arc<RetryManager>,
    config: WebhookConfig,
}

impl WebhookIngestor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        events: WebhookEventRepository,
        configs: SyncConfigRepository,
        jobs: SyncJobRepository,
        object_states: ObjectStateRepository,
        credentials: Arc<CredentialStore>,
        syncer: Arc<RecordSyncer>,
        retry: Arc<RetryManager>,
        config: WebhookConfig,
    ) -> Self {
        Self {
            events,
            configs,
            jobs,
            object_states,
            credentials,
            syncer,
            retry,
            config,
        }
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    /// Ingests one delivered batch for a tenant.
    #[instrument(skip(self, batch), fields(tenant_id = %tenant_id, batch_size = batch.len()))]
    pub async fn ingest(
        &self,
        tenant_id: Uuid,
        batch: Vec<JsonValue>,
    ) -> Result<IngestSummary, EngineError> {
        let mut summary = IngestSummary {
            received: batch.len(),
            ..IngestSummary::default()
        };

        let portal_id = match self.credentials.get_active_connection(tenant_id).await {
            Ok(connection) => Some(connection.external_account_id),
            Err(EngineError::NotFound(_)) => None,
            Err(err) => return Err(err),
        };

        let mut groups: BTreeMap<ObjectType, Vec<(WebhookEventModel, HubSpotEvent)>> =
            BTreeMap::new();

        for raw in batch {
            let parsed = parse_event(&raw);
            let new_event = match &parsed {
                Ok(event) => NewWebhookEvent {
                    tenant_id,
                    event_id: event.event_id.clone(),
                    event_type: Some(event.subscription_type.clone()),
                    object_type: Some(event.object_type),
                    external_id: Some(event.object_id.clone()),
                    external_account_id: event.portal_id.clone(),
                    occurred_at: Some(event.occurred_at),
                    payload: raw.clone(),
                },
                Err(_) => NewWebhookEvent {
                    tenant_id,
                    event_id: fallback_event_id(&raw),
                    event_type: raw
                        .get("subscriptionType")
                        .and_then(JsonValue::as_str)
                        .map(str::to_string),
                    object_type: None,
                    external_id: None,
                    external_account_id: id_string(raw.get("portalId")),
                    occurred_at: None,
                    payload: raw.clone(),
                },
            };

            let logged = match self.events.record(new_event).await? {
                LogOutcome::Inserted(logged) => logged,
                LogOutcome::Unfinished(logged) => {
                    debug!(event_id = %logged.event_id, "Reprocessing unfinished webhook event");
                    logged
                }
                LogOutcome::Duplicate => {
                    summary.duplicates += 1;
                    counter!("crm_webhook_events_total", "outcome" => "duplicate").increment(1);
                    continue;
                }
            };

            let event = match parsed {
                Ok(event) => event,
                Err(reason) => {
                    warn!(event_id = %logged.event_id, reason = %reason, "Malformed webhook event");
                    self.fail_event(&logged, &reason, &mut summary).await?;
                    continue;
                }
            };

            let rejection = match (&portal_id, &event.portal_id) {
                (None, _) => Some("no active connection for tenant".to_string()),
                (Some(expected), Some(got)) if expected != got => {
                    Some(format!("portalId {got} does not match connected account"))
                }
                _ => None,
            };
            if let Some(reason) = rejection {
                warn!(event_id = %event.event_id, reason = %reason, "Rejected webhook event");
                self.fail_event(&logged, &reason, &mut summary).await?;
                continue;
            }

            groups
                .entry(event.object_type)
                .or_default()
                .push((logged, event));
        }

        for (object_type, mut group) in groups {
            group.sort_by_key(|(_, event)| event.occurred_at);
            self.process_group(tenant_id, object_type, group, &mut summary)
                .await?;
        }

        info!(
            received = summary.received,
            duplicates = summary.duplicates,
            applied = summary.applied,
            stale = summary.stale,
            ignored = summary.ignored,
            enqueued = summary.enqueued,
            failed = summary.failed,
            "Webhook batch ingested"
        );
        Ok(summary)
    }

    async fn process_group(
        &self,
        tenant_id: Uuid,
        object_type: ObjectType,
        group: Vec<(WebhookEventModel, HubSpotEvent)>,
        summary: &mut IngestSummary,
    ) -> Result<(), EngineError> {
        let config = match self.configs.get(tenant_id, object_type).await? {
            Some(config) if config.enabled && config.direction.pulls() => config,
            _ => {
                debug!(%object_type, events = group.len(), "No inbound sync config; ignoring events");
                for (logged, _) in &group {
                    self.finish_event(logged, WebhookOutcome::Ignored, summary)
                        .await?;
                }
                return Ok(());
            }
        };

        if group.len() >= self.config.batch_threshold {
            self.enqueue_scoped(&config, group.len()).await?;
            for (logged, _) in &group {
                self.finish_event(logged, WebhookOutcome::Enqueued, summary)
                    .await?;
            }
            return Ok(());
        }

        let ctx = match FieldMapping::from_json(&config.field_mappings) {
            Ok(mapping) => SyncContext::new(tenant_id, object_type, None, mapping),
            Err(err) => {
                for (logged, event) in &group {
                    self.fail_record(logged, event, &err, summary).await?;
                }
                return Ok(());
            }
        };

        let mut pending = group.into_iter();
        while let Some((logged, event)) = pending.next() {
            match self.apply_event(&ctx, &event).await {
                Ok(outcome) => self.finish_event(&logged, outcome, summary).await?,
                Err(EngineError::RateLimited { .. }) => {
                    info!(%object_type, "CRM rate limit during webhook apply; deferring to a job");
                    self.enqueue_scoped(&config, pending.len() + 1).await?;
                    self.finish_event(&logged, WebhookOutcome::Enqueued, summary)
                        .await?;
                    for (rest, _) in pending.by_ref() {
                        self.finish_event(&rest, WebhookOutcome::Enqueued, summary)
                            .await?;
                    }
                }
                Err(err) => self.fail_record(&logged, &event, &err, summary).await?,
            }
        }
        Ok(())
    }

    /// Targeted single-record sync for one event.
    async fn apply_event(
        &self,
        ctx: &SyncContext,
        event: &HubSpotEvent,
    ) -> Result<WebhookOutcome, EngineError> {
        let may_apply = self
            .object_states
            .advance(
                ctx.tenant_id,
                ctx.object_type,
                &event.object_id,
                event.occurred_at,
            )
            .await?;
        if !may_apply {
            return Ok(WebhookOutcome::Stale);
        }

        let outcome = match event.change {
            ChangeKind::Deletion => {
                self.syncer
                    .expire_by_external(ctx, &event.object_id, "deleted_externally")
                    .await?
            }
            ChangeKind::Upsert => match self.syncer.fetch_external(ctx, &event.object_id).await? {
                Some(record) => self.syncer.apply_pull(ctx, &record).await?,
                None => {
                    self.syncer
                        .expire_by_external(ctx, &event.object_id, "missing_externally")
                        .await?
                }
            },
        };

        if outcome.wrote() {
            self.retry
                .record_success(ctx, SyncDirection::FromExternal, None, Some(&event.object_id))
                .await?;
        }

        Ok(match outcome {
            RecordOutcome::Created { .. } | RecordOutcome::Updated { .. } | RecordOutcome::Expired => {
                WebhookOutcome::Applied
            }
            RecordOutcome::Skipped(SkipReason::AlreadySynced | SkipReason::Stale) => {
                WebhookOutcome::Stale
            }
            RecordOutcome::Skipped(SkipReason::Expired | SkipReason::Deleted) => {
                WebhookOutcome::Ignored
            }
        })
    }

    /// Enqueues a webhook-triggered job, or records demand if one is in flight.
    async fn enqueue_scoped(
        &self,
        config: &SyncConfigModel,
        events: usize,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        let outcome = self
            .jobs
            .enqueue(NewJob {
                tenant_id: config.tenant_id,
                object_type: config.object_type,
                direction: config.direction,
                trigger: JobTrigger::Webhook,
                scheduled_at: now,
                metadata: json!({ "reason": "webhook", "events": events }),
            })
            .await?;

        if let EnqueueOutcome::AlreadyPending = outcome {
            debug!(
                tenant_id = %config.tenant_id,
                object_type = %config.object_type,
                "Job already in flight; recording webhook demand"
            );
            self.configs
                .request_demand(config.tenant_id, config.object_type, now)
                .await?;
        }
        Ok(())
    }

    async fn finish_event(
        &self,
        logged: &WebhookEventModel,
        outcome: WebhookOutcome,
        summary: &mut IngestSummary,
    ) -> Result<(), EngineError> {
        self.events.mark_processed(logged.id, outcome).await?;
        summary.count(outcome);
        let label = match outcome {
            WebhookOutcome::Applied => "applied",
            WebhookOutcome::Stale => "stale",
            WebhookOutcome::Ignored => "ignored",
            WebhookOutcome::Enqueued => "enqueued",
        };
        counter!("crm_webhook_events_total", "outcome" => label).increment(1);
        Ok(())
    }

    async fn fail_event(
        &self,
        logged: &WebhookEventModel,
        reason: &str,
        summary: &mut IngestSummary,
    ) -> Result<(), EngineError> {
        self.events.mark_failed(logged.id, reason).await?;
        summary.failed += 1;
        counter!("crm_webhook_events_total", "outcome" => "failed").increment(1);
        Ok(())
    }

    /// A valid event whose record sync failed: logged `failed` and handed to the retry sweep.
    async fn fail_record(
        &self,
        logged: &WebhookEventModel,
        event: &HubSpotEvent,
        err: &EngineError,
        summary: &mut IngestSummary,
    ) -> Result<(), EngineError> {
        self.fail_event(logged, &err.to_string(), summary).await?;
        self.retry
            .record_failure(RecordFailure {
                tenant_id: logged.tenant_id,
                job_id: None,
                object_type: event.object_type,
                direction: SyncDirection::FromExternal,
                local_id: None,
                external_id: Some(event.object_id.clone()),
                error: err,
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(subscription_type: &str) -> JsonValue {
        json!({
            "eventId": 1001,
            "subscriptionId": 55,
            "portalId": 62515,
            "occurredAt": 1_700_000_000_000_i64,
            "subscriptionType": subscription_type,
            "attemptNumber": 0,
            "objectId": 123,
            "propertyName": "email",
            "propertyValue": "a@example.com"
        })
    }

    #[test]
    fn test_parse_property_change() {
        let event = parse_event(&raw("contact.propertyChange")).unwrap();
        assert_eq!(event.event_id, "1001");
        assert_eq!(event.portal_id.as_deref(), Some("62515"));
        assert_eq!(event.object_type, ObjectType::Contact);
        assert_eq!(event.object_id, "123");
        assert_eq!(event.change, ChangeKind::Upsert);
        assert_eq!(event.occurred_at.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_parse_deletion_and_object_types() {
        let event = parse_event(&raw("deal.deletion")).unwrap();
        assert_eq!(event.object_type, ObjectType::Deal);
        assert_eq!(event.change, ChangeKind::Deletion);

        let event = parse_event(&raw("company.creation")).unwrap();
        assert_eq!(event.object_type, ObjectType::Company);
        assert_eq!(event.change, ChangeKind::Upsert);
    }

    #[test]
    fn test_parse_rejects_malformed_events() {
        assert!(parse_event(&json!({})).is_err());
        assert!(parse_event(&raw("ticket.creation")).is_err());
        assert!(parse_event(&raw("contact")).is_err());

        let mut missing_time = raw("contact.creation");
        missing_time["occurredAt"] = json!("yesterday");
        assert!(parse_event(&missing_time).is_err());
    }

    #[test]
    fn test_fallback_event_id_is_stable() {
        let malformed = json!({ "objectId": "x" });
        let a = fallback_event_id(&malformed);
        let b = fallback_event_id(&malformed.clone());
        assert_eq!(a, b);
        assert!(a.starts_with("sha256:"));

        assert_eq!(fallback_event_id(&json!({ "eventId": "e-9" })), "e-9");
    }
}
