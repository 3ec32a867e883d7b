mod test_utils;

use std::sync::Arc;

use chrono::Utc;
use crm_sync::error::EngineError;
use crm_sync::events::TracingEventSink;
use crm_sync::identity::IdentityMapper;
use crm_sync::models::{ObjectType, SyncDirection};
use test_utils::setup_test_db;
use uuid::Uuid;

async fn mapper() -> IdentityMapper {
    let db = setup_test_db().await.expect("Failed to setup test DB");
    IdentityMapper::new(db, Arc::new(TracingEventSink))
}

#[tokio::test]
async fn test_create_and_resolve_both_ways() {
    let mapper = mapper().await;
    let tenant = Uuid::new_v4();

    mapper
        .create_mapping(
            tenant,
            ObjectType::Contact,
            "local-1",
            "hs-1",
            SyncDirection::ToExternal,
            Utc::now(),
        )
        .await
        .unwrap();

    assert_eq!(
        mapper
            .resolve(tenant, ObjectType::Contact, "local-1")
            .await
            .unwrap()
            .as_deref(),
        Some("hs-1")
    );
    assert_eq!(
        mapper
            .resolve_reverse(tenant, ObjectType::Contact, "hs-1")
            .await
            .unwrap()
            .as_deref(),
        Some("local-1")
    );
    // Scoped by object type and tenant.
    assert!(
        mapper
            .resolve(tenant, ObjectType::Company, "local-1")
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        mapper
            .resolve(Uuid::new_v4(), ObjectType::Contact, "local-1")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_conflicting_pairs_are_rejected() {
    let mapper = mapper().await;
    let tenant = Uuid::new_v4();

    mapper
        .create_mapping(
            tenant,
            ObjectType::Contact,
            "local-1",
            "hs-1",
            SyncDirection::ToExternal,
            Utc::now(),
        )
        .await
        .unwrap();

    let same_local = mapper
        .create_mapping(
            tenant,
            ObjectType::Contact,
            "local-1",
            "hs-2",
            SyncDirection::ToExternal,
            Utc::now(),
        )
        .await
        .unwrap_err();
    assert!(matches!(same_local, EngineError::ConflictingMapping { .. }));

    let same_external = mapper
        .create_mapping(
            tenant,
            ObjectType::Contact,
            "local-2",
            "hs-1",
            SyncDirection::ToExternal,
            Utc::now(),
        )
        .await
        .unwrap_err();
    assert!(matches!(same_external, EngineError::ConflictingMapping { .. }));

    // Nothing was written for the rejected pairs.
    assert!(
        mapper
            .resolve_reverse(tenant, ObjectType::Contact, "hs-2")
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        mapper
            .resolve(tenant, ObjectType::Contact, "local-2")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_concurrent_creates_for_same_local_id_yield_one_mapping() {
    let mapper = Arc::new(mapper().await);
    let tenant = Uuid::new_v4();

    let mut handles = Vec::new();
    for n in 0..4 {
        let mapper = mapper.clone();
        handles.push(tokio::spawn(async move {
            mapper
                .create_mapping(
                    tenant,
                    ObjectType::Contact,
                    "local-race",
                    &format!("hs-{n}"),
                    SyncDirection::ToExternal,
                    Utc::now(),
                )
                .await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(EngineError::ConflictingMapping { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(winners, 1);
    assert!(
        mapper
            .resolve(tenant, ObjectType::Contact, "local-race")
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn test_expired_mapping_stops_resolving_but_still_occupies_ids() {
    let mapper = mapper().await;
    let tenant = Uuid::new_v4();

    let mapping = mapper
        .create_mapping(
            tenant,
            ObjectType::Company,
            "c-1",
            "77",
            SyncDirection::ToExternal,
            Utc::now(),
        )
        .await
        .unwrap();

    assert!(mapper.expire(&mapping, "deleted_locally").await.unwrap());
    // Idempotent.
    assert!(!mapper.expire(&mapping, "deleted_locally").await.unwrap());

    assert!(
        mapper
            .resolve(tenant, ObjectType::Company, "c-1")
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        mapper
            .is_mapped(tenant, ObjectType::Company, "c-1")
            .await
            .unwrap()
    );

    let reuse = mapper
        .create_mapping(
            tenant,
            ObjectType::Company,
            "c-2",
            "77",
            SyncDirection::ToExternal,
            Utc::now(),
        )
        .await
        .unwrap_err();
    assert_eq!(reuse.code(), "conflicting_mapping");
}

#[tokio::test]
async fn test_record_sync_never_moves_version_backwards() {
    let mapper = mapper().await;
    let tenant = Uuid::new_v4();
    let newer = Utc::now();
    let older = newer - chrono::Duration::hours(1);

    let mapping = mapper
        .create_mapping(
            tenant,
            ObjectType::Contact,
            "l",
            "e",
            SyncDirection::ToExternal,
            newer,
        )
        .await
        .unwrap();
    mapper
        .record_sync(&mapping, SyncDirection::FromExternal, older)
        .await
        .unwrap();

    let stored = mapper
        .find_by_local(tenant, ObjectType::Contact, "l")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.last_direction, SyncDirection::FromExternal);
    assert_eq!(stored.synced_version_at, mapping.synced_version_at);
}
