mod test_utils;

use chrono::{DateTime, Duration, Utc};
use crm_sync::models::sync_job::{JobStatus, JobTrigger};
use crm_sync::models::webhook_event::{WebhookEventStatus, WebhookOutcome};
use crm_sync::models::{ObjectType, SyncDirection};
use crm_sync::repositories::WebhookEventRepository;
use crm_sync::repositories::webhook_event::{NewWebhookEvent, RecordOutcome};
use serde_json::{Value as JsonValue, json};
use test_utils::{Harness, PORTAL_ID};

fn event(event_id: u64, subscription: &str, object_id: &str, at: DateTime<Utc>) -> JsonValue {
    json!({
        "eventId": event_id,
        "subscriptionId": 4211,
        "portalId": PORTAL_ID.parse::<u64>().unwrap(),
        "appId": 1160452,
        "occurredAt": at.timestamp_millis(),
        "subscriptionType": subscription,
        "attemptNumber": 0,
        "objectId": object_id.parse::<u64>().unwrap(),
        "changeSource": "CRM_UI"
    })
}

async fn inbound_harness() -> Harness {
    let h = Harness::new().await.unwrap();
    h.connect().await.unwrap();
    h.configure(ObjectType::Contact, SyncDirection::FromExternal)
        .await
        .unwrap();
    h
}

#[tokio::test]
async fn test_event_applies_crm_change_locally() {
    let h = inbound_harness().await;
    let at = Utc::now() - Duration::seconds(30);
    h.crm.put(
        ObjectType::Contact,
        "501",
        json!({ "firstname": "Ada", "email": "ada@example.com" }),
        at,
    );

    let summary = h
        .components
        .ingestor
        .ingest(h.tenant_id, vec![event(1, "contact.creation", "501", at)])
        .await
        .unwrap();
    assert_eq!(summary.received, 1);
    assert_eq!(summary.applied, 1);

    assert!(
        h.components
            .identity
            .resolve_reverse(h.tenant_id, ObjectType::Contact, "501")
            .await
            .unwrap()
            .is_some()
    );

    let logged = WebhookEventRepository::new(h.db.clone())
        .find_by_event_id(h.tenant_id, "1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(logged.status, WebhookEventStatus::Processed);
    assert_eq!(logged.outcome, Some(WebhookOutcome::Applied));
    assert_eq!(logged.external_id.as_deref(), Some("501"));
}

#[tokio::test]
async fn test_redelivered_event_is_processed_once() {
    let h = inbound_harness().await;
    let at = Utc::now() - Duration::seconds(30);
    h.crm.put(
        ObjectType::Contact,
        "501",
        json!({ "firstname": "Ada" }),
        at,
    );
    let batch = vec![event(7, "contact.propertyChange", "501", at)];

    let first = h
        .components
        .ingestor
        .ingest(h.tenant_id, batch.clone())
        .await
        .unwrap();
    let second = h
        .components
        .ingestor
        .ingest(h.tenant_id, batch)
        .await
        .unwrap();

    assert_eq!(first.applied, 1);
    assert_eq!(second.duplicates, 1);
    assert_eq!(second.applied, 0);
    assert_eq!(
        WebhookEventRepository::new(h.db.clone())
            .count_for_tenant(h.tenant_id)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_redelivery_finishes_event_left_pending() {
    let h = inbound_harness().await;
    let at = Utc::now() - Duration::seconds(30);
    h.crm.put(
        ObjectType::Contact,
        "501",
        json!({ "firstname": "Ada" }),
        at,
    );
    let raw = event(8, "contact.propertyChange", "501", at);

    // A delivery that logged the event and then died before applying it.
    let repo = WebhookEventRepository::new(h.db.clone());
    let logged = repo
        .record(NewWebhookEvent {
            tenant_id: h.tenant_id,
            event_id: "8".to_string(),
            event_type: Some("contact.propertyChange".to_string()),
            object_type: Some(ObjectType::Contact),
            external_id: Some("501".to_string()),
            external_account_id: Some(PORTAL_ID.to_string()),
            occurred_at: Some(at),
            payload: raw.clone(),
        })
        .await
        .unwrap();
    assert!(matches!(logged, RecordOutcome::Inserted(_)));

    let summary = h
        .components
        .ingestor
        .ingest(h.tenant_id, vec![raw])
        .await
        .unwrap();
    assert_eq!(summary.duplicates, 0);
    assert_eq!(summary.applied, 1);

    let row = repo.find_by_event_id(h.tenant_id, "8").await.unwrap().unwrap();
    assert_eq!(row.status, WebhookEventStatus::Processed);
    assert_eq!(row.outcome, Some(WebhookOutcome::Applied));
    assert_eq!(repo.count_for_tenant(h.tenant_id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_older_event_arriving_late_is_stale() {
    let h = inbound_harness().await;
    let t1 = Utc::now() - Duration::minutes(5);
    let t2 = Utc::now() - Duration::minutes(1);
    h.crm.put(
        ObjectType::Contact,
        "501",
        json!({ "firstname": "Newest" }),
        t2,
    );

    let newer = h
        .components
        .ingestor
        .ingest(h.tenant_id, vec![event(2, "contact.propertyChange", "501", t2)])
        .await
        .unwrap();
    assert_eq!(newer.applied, 1);

    let older = h
        .components
        .ingestor
        .ingest(h.tenant_id, vec![event(1, "contact.propertyChange", "501", t1)])
        .await
        .unwrap();
    assert_eq!(older.stale, 1);
    assert_eq!(older.applied, 0);

    let logged = WebhookEventRepository::new(h.db.clone())
        .find_by_event_id(h.tenant_id, "1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(logged.outcome, Some(WebhookOutcome::Stale));
}

#[tokio::test]
async fn test_foreign_portal_and_malformed_events_fail() {
    let h = inbound_harness().await;
    let at = Utc::now();

    let mut foreign = event(30, "contact.creation", "501", at);
    foreign["portalId"] = json!(999);
    let missing_object = json!({
        "eventId": 31,
        "portalId": 62515,
        "occurredAt": at.timestamp_millis(),
        "subscriptionType": "contact.creation"
    });
    let no_event_id = json!({ "subscriptionType": "contact.creation" });

    let summary = h
        .components
        .ingestor
        .ingest(h.tenant_id, vec![foreign, missing_object, no_event_id])
        .await
        .unwrap();
    assert_eq!(summary.received, 3);
    assert_eq!(summary.failed, 3);
    assert_eq!(h.crm.refreshes(), 0);

    let repo = WebhookEventRepository::new(h.db.clone());
    let rejected = repo.find_by_event_id(h.tenant_id, "30").await.unwrap().unwrap();
    assert_eq!(rejected.status, WebhookEventStatus::Failed);
    assert!(
        rejected
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("portalId")
    );

    let logged = repo.list_for_tenant(h.tenant_id, 10).await.unwrap();
    assert!(logged.iter().any(|e| e.event_id.starts_with("sha256:")));
}

#[tokio::test]
async fn test_events_without_active_connection_fail() {
    let h = Harness::new().await.unwrap();
    h.configure(ObjectType::Contact, SyncDirection::FromExternal)
        .await
        .unwrap();

    let summary = h
        .components
        .ingestor
        .ingest(
            h.tenant_id,
            vec![event(1, "contact.creation", "501", Utc::now())],
        )
        .await
        .unwrap();
    assert_eq!(summary.failed, 1);
}

#[tokio::test]
async fn test_events_without_inbound_config_are_ignored() {
    let h = Harness::new().await.unwrap();
    h.connect().await.unwrap();
    h.configure(ObjectType::Contact, SyncDirection::ToExternal)
        .await
        .unwrap();

    let summary = h
        .components
        .ingestor
        .ingest(
            h.tenant_id,
            vec![
                event(1, "contact.creation", "501", Utc::now()),
                event(2, "deal.creation", "8", Utc::now()),
            ],
        )
        .await
        .unwrap();
    assert_eq!(summary.ignored, 2);
    assert!(
        h.jobs()
            .list_for_tenant(h.tenant_id, 10)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_deletion_expires_mapping() {
    let h = inbound_harness().await;
    let at = Utc::now() - Duration::minutes(2);
    h.crm.put(
        ObjectType::Contact,
        "501",
        json!({ "firstname": "Ada" }),
        at,
    );
    h.components
        .ingestor
        .ingest(h.tenant_id, vec![event(1, "contact.creation", "501", at)])
        .await
        .unwrap();

    h.crm.remove(ObjectType::Contact, "501");
    let summary = h
        .components
        .ingestor
        .ingest(
            h.tenant_id,
            vec![event(2, "contact.deletion", "501", Utc::now())],
        )
        .await
        .unwrap();
    assert_eq!(summary.applied, 1);

    assert!(
        h.components
            .identity
            .resolve_reverse(h.tenant_id, ObjectType::Contact, "501")
            .await
            .unwrap()
            .is_none()
    );
    let mapping = h
        .components
        .identity
        .find_by_external(h.tenant_id, ObjectType::Contact, "501")
        .await
        .unwrap()
        .unwrap();
    assert!(mapping.is_expired());
}

#[tokio::test]
async fn test_large_batch_enqueues_scoped_job() {
    let h = inbound_harness().await;
    let threshold = h.config.webhook.batch_threshold as u64;
    let at = Utc::now();

    let batch: Vec<_> = (0..threshold)
        .map(|n| event(100 + n, "contact.propertyChange", &format!("{}", 600 + n), at))
        .collect();
    let summary = h
        .components
        .ingestor
        .ingest(h.tenant_id, batch)
        .await
        .unwrap();
    assert_eq!(summary.enqueued as u64, threshold);
    assert_eq!(h.crm.creates(), 0);

    let jobs = h.jobs().list_for_tenant(h.tenant_id, 10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].trigger, JobTrigger::Webhook);
    assert_eq!(jobs[0].status, JobStatus::Pending);

    // With a job already pending the next batch only records demand.
    let batch: Vec<_> = (0..threshold)
        .map(|n| event(200 + n, "contact.propertyChange", &format!("{}", 600 + n), at))
        .collect();
    h.components
        .ingestor
        .ingest(h.tenant_id, batch)
        .await
        .unwrap();

    assert_eq!(h.jobs().list_for_tenant(h.tenant_id, 10).await.unwrap().len(), 1);
    let config = h
        .configs()
        .get(h.tenant_id, ObjectType::Contact)
        .await
        .unwrap()
        .unwrap();
    assert!(config.demand_requested_at.is_some());
}

#[tokio::test]
async fn test_rate_limit_during_apply_defers_remaining_events_to_job() {
    let h = inbound_harness().await;
    let at = Utc::now();
    h.crm.put(ObjectType::Contact, "501", json!({}), at);
    h.crm.put(ObjectType::Contact, "502", json!({}), at);
    h.crm.rate_limit_reads(true);

    let summary = h
        .components
        .ingestor
        .ingest(
            h.tenant_id,
            vec![
                event(1, "contact.propertyChange", "501", at),
                event(2, "contact.propertyChange", "502", at),
            ],
        )
        .await
        .unwrap();
    assert_eq!(summary.enqueued, 2);
    assert_eq!(summary.failed, 0);

    let jobs = h.jobs().list_for_tenant(h.tenant_id, 10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].trigger, JobTrigger::Webhook);
}
