mod test_utils;

use chrono::{Duration, Utc};
use crm_sync::models::sync_job::{JobStatus, JobTrigger};
use crm_sync::models::{ObjectType, SyncDirection};
use test_utils::{Harness, test_config};

#[tokio::test]
async fn test_first_tick_enqueues_one_job_per_config() {
    let h = Harness::new().await.unwrap();
    h.connect().await.unwrap();
    h.configure(ObjectType::Contact, SyncDirection::Bidirectional)
        .await
        .unwrap();
    h.configure(ObjectType::Company, SyncDirection::ToExternal)
        .await
        .unwrap();

    let now = Utc::now();
    let stats = h.components.scheduler.tick(now).await.unwrap();
    assert_eq!(stats.configs_polled, 2);
    assert_eq!(stats.jobs_enqueued, 2);

    // Single-flight: a second tick finds both jobs still pending.
    let stats = h.components.scheduler.tick(now).await.unwrap();
    assert_eq!(stats.jobs_enqueued, 0);
    assert_eq!(stats.skipped_pending, 2);

    let jobs = h.jobs().list_for_tenant(h.tenant_id, 10).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|j| j.trigger == JobTrigger::Schedule));
    assert!(jobs.iter().all(|j| j.status == JobStatus::Pending));
}

#[tokio::test]
async fn test_cadence_gates_subsequent_runs() {
    let h = Harness::new().await.unwrap();
    h.connect().await.unwrap();
    h.configure(ObjectType::Contact, SyncDirection::ToExternal)
        .await
        .unwrap();

    let job = h.sync_once(ObjectType::Contact).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let now = Utc::now();
    let stats = h.components.scheduler.tick(now).await.unwrap();
    assert_eq!(stats.skipped_not_due, 1);
    assert_eq!(stats.jobs_enqueued, 0);

    let stats = h
        .components
        .scheduler
        .tick(now + Duration::minutes(16))
        .await
        .unwrap();
    assert_eq!(stats.jobs_enqueued, 1);
}

#[tokio::test]
async fn test_demand_bypasses_cadence_and_is_cleared() {
    let h = Harness::new().await.unwrap();
    h.connect().await.unwrap();
    h.configure(ObjectType::Deal, SyncDirection::FromExternal)
        .await
        .unwrap();
    h.sync_once(ObjectType::Deal).await.unwrap();

    let now = Utc::now();
    h.configs()
        .request_demand(h.tenant_id, ObjectType::Deal, now)
        .await
        .unwrap();
    let stats = h.components.scheduler.tick(now).await.unwrap();
    assert_eq!(stats.jobs_enqueued, 1);

    let jobs = h.jobs().list_for_tenant(h.tenant_id, 10).await.unwrap();
    assert!(
        jobs.iter()
            .any(|j| j.trigger == JobTrigger::Webhook && j.status == JobStatus::Pending)
    );
    let config = h
        .configs()
        .get(h.tenant_id, ObjectType::Deal)
        .await
        .unwrap()
        .unwrap();
    assert!(config.demand_requested_at.is_none());
}

#[tokio::test]
async fn test_skips_suspended_disabled_and_disconnected() {
    let h = Harness::new().await.unwrap();
    h.configure(ObjectType::Contact, SyncDirection::ToExternal)
        .await
        .unwrap();
    h.configure(ObjectType::Company, SyncDirection::ToExternal)
        .await
        .unwrap();
    h.configure(ObjectType::Deal, SyncDirection::ToExternal)
        .await
        .unwrap();

    let now = Utc::now();
    let stats = h.components.scheduler.tick(now).await.unwrap();
    assert_eq!(stats.skipped_no_connection, 3);
    assert_eq!(stats.jobs_enqueued, 0);

    h.connect().await.unwrap();
    h.configs()
        .suspend(h.tenant_id, ObjectType::Company, now)
        .await
        .unwrap();
    h.configs()
        .set_enabled(h.tenant_id, ObjectType::Deal, false)
        .await
        .unwrap();

    let stats = h.components.scheduler.tick(now).await.unwrap();
    assert_eq!(stats.configs_polled, 2);
    assert_eq!(stats.skipped_suspended, 1);
    assert_eq!(stats.jobs_enqueued, 1);

    let jobs = h.jobs().list_for_tenant(h.tenant_id, 10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].object_type, ObjectType::Contact);
}

#[tokio::test]
async fn test_tick_pages_through_every_enabled_config() {
    let mut config = test_config();
    config.scheduler.batch_size = 1;
    let h = Harness::with_config(config).await.unwrap();
    h.connect().await.unwrap();
    for object_type in [ObjectType::Contact, ObjectType::Company, ObjectType::Deal] {
        h.configure(object_type, SyncDirection::ToExternal)
            .await
            .unwrap();
    }
    // One config has a watermark, the others have never run.
    h.sync_once(ObjectType::Contact).await.unwrap();

    let stats = h.components.scheduler.tick(Utc::now()).await.unwrap();
    assert_eq!(stats.configs_polled, 3);
    assert_eq!(stats.skipped_not_due, 1);
    assert_eq!(stats.jobs_enqueued, 2);

    let later = Utc::now() + Duration::minutes(16);
    h.run_executor(Utc::now()).await.unwrap();
    let stats = h.components.scheduler.tick(later).await.unwrap();
    assert_eq!(stats.configs_polled, 3);
    assert_eq!(stats.jobs_enqueued, 3);
}
