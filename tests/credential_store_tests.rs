mod test_utils;

use chrono::{Duration, Utc};
use crm_sync::error::EngineError;
use crm_sync::models::connection::ConnectionStatus;
use crm_sync::repositories::ConnectionRepository;
use test_utils::{Harness, INITIAL_ACCESS_TOKEN, REFRESH_TOKEN};
use tokio::task::JoinSet;

#[tokio::test]
async fn test_tokens_are_encrypted_at_rest() {
    let h = Harness::new().await.unwrap();
    h.connect().await.unwrap();

    let stored = ConnectionRepository::new(h.db.clone())
        .find_active(h.tenant_id)
        .await
        .unwrap()
        .unwrap();
    let access = String::from_utf8_lossy(&stored.access_token_ciphertext);
    assert!(!access.contains(INITIAL_ACCESS_TOKEN));
    let refresh = stored.refresh_token_ciphertext.clone().unwrap();
    assert!(!String::from_utf8_lossy(&refresh).contains(REFRESH_TOKEN));

    let token = h
        .components
        .credentials
        .valid_access_token(h.tenant_id)
        .await
        .unwrap();
    assert_eq!(token.value, INITIAL_ACCESS_TOKEN);
    assert_eq!(h.crm.refreshes(), 0);
    assert!(!format!("{token:?}").contains(INITIAL_ACCESS_TOKEN));
}

#[tokio::test]
async fn test_near_expiry_token_is_refreshed_once_for_concurrent_callers() {
    let h = Harness::new().await.unwrap();
    h.connect_expiring_at(Utc::now() + Duration::seconds(60))
        .await
        .unwrap();
    h.crm.set_refresh_delay(50);

    let mut callers = JoinSet::new();
    for _ in 0..5 {
        let credentials = h.components.credentials.clone();
        let tenant_id = h.tenant_id;
        callers.spawn(async move { credentials.valid_access_token(tenant_id).await });
    }

    let mut tokens = Vec::new();
    while let Some(joined) = callers.join_next().await {
        tokens.push(joined.unwrap().unwrap().value);
    }

    assert_eq!(h.crm.refreshes(), 1);
    assert!(tokens.iter().all(|t| t == "access-1"));

    let stored = ConnectionRepository::new(h.db.clone())
        .find_active(h.tenant_id)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.expires_at.unwrap() > Utc::now() + Duration::minutes(50));
}

#[tokio::test]
async fn test_refresh_with_stale_version_is_coalesced() {
    let h = Harness::new().await.unwrap();
    h.connect().await.unwrap();
    let credentials = &h.components.credentials;

    let before = credentials.valid_access_token(h.tenant_id).await.unwrap();
    credentials
        .refresh_if_stale(h.tenant_id, before.token_version)
        .await
        .unwrap();
    // A caller still holding the old version does not refresh again.
    credentials
        .refresh_if_stale(h.tenant_id, before.token_version)
        .await
        .unwrap();

    assert_eq!(h.crm.refreshes(), 1);
    let after = credentials.valid_access_token(h.tenant_id).await.unwrap();
    assert_eq!(after.value, "access-1");
    assert_eq!(after.token_version, before.token_version + 1);
}

#[tokio::test]
async fn test_revoked_refresh_deactivates_connection() {
    let h = Harness::new().await.unwrap();
    h.connect_expiring_at(Utc::now() - Duration::minutes(1))
        .await
        .unwrap();
    h.crm.revoke_refresh();

    let err = h
        .components
        .credentials
        .valid_access_token(h.tenant_id)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AuthRevoked(_)));

    let repo = ConnectionRepository::new(h.db.clone());
    assert!(repo.find_active(h.tenant_id).await.unwrap().is_none());
    assert!(h.events.kinds().contains(&"connection_deactivated"));

    let err = h
        .components
        .credentials
        .valid_access_token(h.tenant_id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "unauthenticated");
}

#[tokio::test]
async fn test_repeated_auth_failures_deactivate_connection() {
    let h = Harness::new().await.unwrap();
    h.connect().await.unwrap();
    let credentials = &h.components.credentials;
    let max = h.config.token_refresh.max_auth_failures;

    for _ in 1..max {
        assert!(!credentials.record_auth_failure(h.tenant_id).await.unwrap());
    }
    assert!(credentials.record_auth_failure(h.tenant_id).await.unwrap());

    let connection = credentials.get_active_connection(h.tenant_id).await;
    assert!(matches!(connection, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn test_new_connection_replaces_previous() {
    let h = Harness::new().await.unwrap();
    h.connect().await.unwrap();
    let first = h
        .components
        .credentials
        .get_active_connection(h.tenant_id)
        .await
        .unwrap();

    h.connect().await.unwrap();
    let second = h
        .components
        .credentials
        .get_active_connection(h.tenant_id)
        .await
        .unwrap();
    assert_ne!(first.id, second.id);

    let previous = ConnectionRepository::new(h.db.clone())
        .find_by_id(first.id)
        .await
        .unwrap()
        .unwrap();
    assert_ne!(previous.status, ConnectionStatus::Active);
    assert_eq!(previous.deactivation_reason.as_deref(), Some("replaced"));
}
