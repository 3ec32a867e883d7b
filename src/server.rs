//! # Server Configuration
//!
//! Router assembly and HTTP serving for the CRM sync service.

use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::AppConfig;
use crate::handlers;
use crate::telemetry;
use crate::webhook_ingestor::WebhookIngestor;
use crate::webhook_verification;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub ingestor: Arc<WebhookIngestor>,
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let webhooks = Router::new()
        .route(
            "/webhooks/hubspot/{tenant_id}",
            post(handlers::webhooks::ingest_hubspot_webhook),
        )
        .route_layer(middleware::from_fn_with_state(
            state.config.clone(),
            webhook_verification::webhook_verification_middleware,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .merge(webhooks)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(telemetry::trace_id_middleware))
        .layer(TraceLayer::new_for_http())
}

/// Serves the API until `shutdown` fires.
pub async fn run_server(state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = state
        .config
        .bind_addr()
        .map_err(|e| anyhow::anyhow!("Invalid server address: {e}"))?;
    let profile = state.config.profile.clone();
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, %profile, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::webhooks::ingest_hubspot_webhook,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::handlers::HealthResponse,
            crate::handlers::webhooks::WebhookAcceptResponse,
            crate::webhook_ingestor::IngestSummary,
            crate::error::ApiError,
        )
    ),
    tags(
        (name = "root", description = "Service information and health"),
        (name = "webhooks", description = "Inbound CRM webhooks")
    ),
    info(
        title = "CRM Sync API",
        description = "Bidirectional CRM synchronization service",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
