//! # CRM Sync Main Entry Point

use std::sync::Arc;

use anyhow::Context;
use crm_sync::{
    config::ConfigLoader,
    crm::HubSpotClient,
    crypto::CryptoKey,
    db,
    events::TracingEventSink,
    local::DbLocalStore,
    migration::{Migrator, MigratorTrait},
    runtime::Components,
    server::{AppState, run_server},
    telemetry,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from layered env files and variables
    let config = ConfigLoader::new().load()?;
    telemetry::init_tracing(&config)?;

    info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        info!(config = %redacted_json, "Effective configuration");
    }

    let db = db::init_pool(&config).await?;
    Migrator::up(&db, None)
        .await
        .context("Failed to run database migrations")?;

    let key_bytes = config
        .crypto_key
        .clone()
        .context("CRMSYNC_CRYPTO_KEY is required")?;
    let key = CryptoKey::new(key_bytes)?;
    let crm = Arc::new(HubSpotClient::new(&config.hubspot)?);
    let local = Arc::new(DbLocalStore::new(db.clone()));

    let components = Components::build(
        &config,
        db.clone(),
        crm,
        local,
        key,
        Arc::new(TracingEventSink),
    );

    let shutdown = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn(components.scheduler.clone().run(shutdown.clone()));
    tasks.spawn(components.executor.clone().run(shutdown.clone()));
    tasks.spawn(components.retry.clone().run(shutdown.clone()));

    let state = AppState {
        config: Arc::new(config),
        db,
        ingestor: components.ingestor.clone(),
    };
    let server = tokio::spawn(run_server(state, shutdown.clone()));

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = %err, "Server exited with error"),
        Err(err) => error!(error = %err, "Server task panicked"),
    }
    shutdown.cancel();
    while tasks.join_next().await.is_some() {}

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
