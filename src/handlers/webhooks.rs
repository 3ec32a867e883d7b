//! # Webhook Handlers
//!
//! Public HubSpot webhook endpoint. Signatures are checked by
//! [`crate::webhook_verification::webhook_verification_middleware`] before
//! the handler runs.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::error::ApiError;
use crate::server::AppState;
use crate::webhook_ingestor::IngestSummary;

/// HubSpot v3 signature headers
#[derive(Debug, Serialize, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Header)]
pub struct HubSpotSignatureHeaders {
    /// Base64 HMAC-SHA256 of method, URI, body and timestamp
    #[serde(rename = "X-HubSpot-Signature-v3")]
    #[param(rename = "X-HubSpot-Signature-v3", value_type = String)]
    pub signature: String,
    /// Epoch milliseconds when the request was signed
    #[serde(rename = "X-HubSpot-Request-Timestamp")]
    #[param(rename = "X-HubSpot-Request-Timestamp", value_type = String)]
    pub timestamp: String,
}

/// Webhook accept response
#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookAcceptResponse {
    #[schema(example = "accepted")]
    pub status: String,
    pub summary: IngestSummary,
}

/// Splits a delivered body into individual events.
fn parse_batch(body: &[u8]) -> Result<Vec<JsonValue>, ApiError> {
    let value: JsonValue = serde_json::from_slice(body).map_err(|err| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_FAILED",
            format!("body is not valid JSON: {err}"),
        )
    })?;

    match value {
        JsonValue::Array(events) => Ok(events),
        JsonValue::Object(_) => Ok(vec![value]),
        _ => Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_FAILED",
            "expected a JSON array of events",
        )),
    }
}

/// Receive a HubSpot webhook batch for a tenant
#[utoipa::path(
    post,
    path = "/webhooks/hubspot/{tenant_id}",
    params(
        ("tenant_id" = Uuid, Path, description = "Tenant the HubSpot app installation belongs to"),
        HubSpotSignatureHeaders
    ),
    request_body(content = Vec<Object>, description = "HubSpot webhook events", content_type = "application/json"),
    responses(
        (status = 202, description = "Batch accepted", body = WebhookAcceptResponse),
        (status = 400, description = "Body is not a JSON event batch", body = ApiError),
        (status = 401, description = "Missing or invalid signature", body = ApiError),
        (status = 413, description = "Batch exceeds the configured maximum size", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn ingest_hubspot_webhook(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookAcceptResponse>), ApiError> {
    let events = parse_batch(&body)?;

    let max_batch_size = state.config.webhook.max_batch_size;
    if events.len() > max_batch_size {
        return Err(ApiError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "PAYLOAD_TOO_LARGE",
            format!("batch of {} events exceeds limit of {max_batch_size}", events.len()),
        ));
    }

    debug!(tenant_id = %tenant_id, events = events.len(), "Received HubSpot webhook batch");
    let summary = state.ingestor.ingest(tenant_id, events).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookAcceptResponse {
            status: "accepted".to_string(),
            summary,
        }),
    ))
}
