//! Wiring of the sync components over one database pool.

use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::config::AppConfig;
use crate::credentials::CredentialStore;
use crate::crm::CrmClient;
use crate::crypto::CryptoKey;
use crate::events::SharedEventSink;
use crate::identity::IdentityMapper;
use crate::local::LocalStore;
use crate::record_sync::RecordSyncer;
use crate::repositories::{
    ConnectionRepository, ObjectStateRepository, SyncConfigRepository, SyncErrorRepository,
    SyncJobRepository, WebhookEventRepository,
};
use crate::retry::RetryManager;
use crate::scheduler::SyncScheduler;
use crate::sync_executor::SyncExecutor;
use crate::webhook_ingestor::WebhookIngestor;

/// Every long-lived component of the service.
pub struct Components {
    pub credentials: Arc<CredentialStore>,
    pub identity: Arc<IdentityMapper>,
    pub syncer: Arc<RecordSyncer>,
    pub retry: Arc<RetryManager>,
    pub scheduler: Arc<SyncScheduler>,
    pub executor: Arc<SyncExecutor>,
    pub ingestor: Arc<WebhookIngestor>,
}

impl Components {
    pub fn build(
        config: &AppConfig,
        db: DatabaseConnection,
        crm: Arc<dyn CrmClient>,
        local: Arc<dyn LocalStore>,
        key: CryptoKey,
        events: SharedEventSink,
    ) -> Self {
        let connections = ConnectionRepository::new(db.clone());
        let configs = SyncConfigRepository::new(db.clone());
        let jobs = SyncJobRepository::new(db.clone());

        let credentials = Arc::new(CredentialStore::new(
            connections.clone(),
            crm.clone(),
            key,
            config.token_refresh.clone(),
            events.clone(),
        ));
        let identity = Arc::new(IdentityMapper::new(db.clone(), events.clone()));
        let syncer = Arc::new(RecordSyncer::new(
            crm,
            local,
            identity.clone(),
            credentials.clone(),
            ObjectStateRepository::new(db.clone()),
        ));
        let retry = Arc::new(RetryManager::new(
            SyncErrorRepository::new(db.clone()),
            configs.clone(),
            syncer.clone(),
            config.retry.clone(),
            events.clone(),
        ));
        let scheduler = Arc::new(SyncScheduler::new(
            configs.clone(),
            jobs.clone(),
            connections,
            config.scheduler.clone(),
        ));
        let executor = Arc::new(SyncExecutor::new(
            jobs.clone(),
            configs.clone(),
            credentials.clone(),
            identity.clone(),
            syncer.clone(),
            retry.clone(),
            events,
            config.executor.clone(),
            config.rate_limit_policy.clone(),
        ));
        let ingestor = Arc::new(WebhookIngestor::new(
            WebhookEventRepository::new(db.clone()),
            configs,
            jobs,
            ObjectStateRepository::new(db),
            credentials.clone(),
            syncer.clone(),
            retry.clone(),
            config.webhook.clone(),
        ));

        Self {
            credentials,
            identity,
            syncer,
            retry,
            scheduler,
            executor,
            ingestor,
        }
    }
}
