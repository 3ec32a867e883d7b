//! # Webhook Signature Verification
//!
//! Verifies HubSpot `X-HubSpot-Signature-v3` signatures: a base64 HMAC-SHA256,
//! keyed with the app's client secret, over
//! `method + uri + body + timestamp`. The millisecond timestamp from
//! `X-HubSpot-Request-Timestamp` must fall within the configured tolerance.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::config::{AppConfig, HubSpotConfig};
use crate::error::ApiError;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hubspot-signature-v3";
pub const TIMESTAMP_HEADER: &str = "x-hubspot-request-timestamp";

/// Errors that can occur during webhook signature verification
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("Missing required signature header: {header}")]
    MissingSignature { header: String },

    #[error("Invalid signature format: {header}")]
    InvalidSignatureFormat { header: String },

    #[error("Signature verification failed")]
    VerificationFailed,

    #[error("Missing required timestamp header: {header}")]
    MissingTimestamp { header: String },

    #[error("Invalid timestamp format: {header}")]
    InvalidTimestamp { header: String },

    #[error("Timestamp too old: {seconds}s old, max allowed: {max_seconds}s")]
    TimestampTooOld { seconds: u64, max_seconds: u64 },

    #[error("Timestamp too far in future: {seconds}s in future, max allowed: {max_seconds}s")]
    TimestampTooFuture { seconds: u64, max_seconds: u64 },

    #[error("Webhook verification not configured: client secret missing")]
    NotConfigured,
}

impl VerificationError {
    /// Returns the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        StatusCode::UNAUTHORIZED
    }

    fn code(&self) -> &'static str {
        match self {
            VerificationError::MissingSignature { .. }
            | VerificationError::MissingTimestamp { .. } => "MISSING_SIGNATURE",
            VerificationError::TimestampTooOld { .. }
            | VerificationError::TimestampTooFuture { .. } => "STALE_SIGNATURE",
            VerificationError::NotConfigured => "WEBHOOK_NOT_CONFIGURED",
            _ => "INVALID_SIGNATURE",
        }
    }
}

/// Result type for webhook verification
pub type VerificationResult<T> = Result<T, VerificationError>;

/// Computes the base64 v3 signature for a request.
pub fn sign_v3(secret: &str, method: &str, uri: &str, body: &[u8], timestamp: &str) -> String {
    // HMAC-SHA256 accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(method.as_bytes());
    mac.update(uri.as_bytes());
    mac.update(body);
    mac.update(timestamp.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// Verifies a HubSpot v3 signature against the current time.
pub fn verify_hubspot_signature(
    method: &str,
    uri: &str,
    body: &[u8],
    signature_header: &str,
    timestamp_header: &str,
    secret: &str,
    tolerance_seconds: u64,
) -> VerificationResult<()> {
    verify_hubspot_signature_at(
        method,
        uri,
        body,
        signature_header,
        timestamp_header,
        secret,
        tolerance_seconds,
        Utc::now().timestamp_millis(),
    )
}

#[allow(clippy::too_many_arguments)]
fn verify_hubspot_signature_at(
    method: &str,
    uri: &str,
    body: &[u8],
    signature_header: &str,
    timestamp_header: &str,
    secret: &str,
    tolerance_seconds: u64,
    now_ms: i64,
) -> VerificationResult<()> {
    debug!(body_size = body.len(), "Starting HubSpot signature verification");

    if signature_header.is_empty() {
        return Err(VerificationError::MissingSignature {
            header: "X-HubSpot-Signature-v3".to_string(),
        });
    }
    if timestamp_header.is_empty() {
        return Err(VerificationError::MissingTimestamp {
            header: "X-HubSpot-Request-Timestamp".to_string(),
        });
    }

    let timestamp_ms =
        timestamp_header
            .parse::<i64>()
            .map_err(|_| VerificationError::InvalidTimestamp {
                header: "X-HubSpot-Request-Timestamp must be epoch milliseconds".to_string(),
            })?;

    let diff_seconds = now_ms.abs_diff(timestamp_ms) / 1_000;
    if diff_seconds > tolerance_seconds {
        return Err(if now_ms > timestamp_ms {
            VerificationError::TimestampTooOld {
                seconds: diff_seconds,
                max_seconds: tolerance_seconds,
            }
        } else {
            VerificationError::TimestampTooFuture {
                seconds: diff_seconds,
                max_seconds: tolerance_seconds,
            }
        });
    }

    let provided_bytes =
        BASE64
            .decode(signature_header)
            .map_err(|_| VerificationError::InvalidSignatureFormat {
                header: "X-HubSpot-Signature-v3 contains invalid base64".to_string(),
            })?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| VerificationError::VerificationFailed)?;
    mac.update(method.as_bytes());
    mac.update(uri.as_bytes());
    mac.update(body);
    mac.update(timestamp_header.as_bytes());
    let expected_bytes = mac.finalize().into_bytes();

    // Constant-time comparison
    let expected_bytes_array: &[u8] = expected_bytes.as_ref();
    if subtle::ConstantTimeEq::ct_eq(expected_bytes_array, &provided_bytes[..]).into() {
        Ok(())
    } else {
        Err(VerificationError::VerificationFailed)
    }
}

/// Reconstructs the externally visible URI HubSpot signed.
///
/// Uses `X-Forwarded-Proto` (default `https`) and `X-Forwarded-Host` or `Host`.
pub fn signed_uri(headers: &HeaderMap, path_and_query: &str) -> String {
    let header = |name: &str| headers.get(name).and_then(|h| h.to_str().ok());
    let scheme = header("x-forwarded-proto").unwrap_or("https");
    match header("x-forwarded-host").or_else(|| header("host")) {
        Some(host) => format!("{scheme}://{host}{path_and_query}"),
        None => path_and_query.to_string(),
    }
}

/// Verifies the signature of a buffered request.
pub fn verify_request(
    method: &str,
    path_and_query: &str,
    headers: &HeaderMap,
    body: &[u8],
    config: &HubSpotConfig,
) -> VerificationResult<()> {
    let secret = config
        .client_secret
        .as_deref()
        .ok_or(VerificationError::NotConfigured)?;

    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
    };

    verify_hubspot_signature(
        method,
        &signed_uri(headers, path_and_query),
        body,
        header(SIGNATURE_HEADER),
        header(TIMESTAMP_HEADER),
        secret,
        config.webhook_tolerance_seconds,
    )
}

/// Middleware for webhook signature verification on the public webhook routes
pub async fn webhook_verification_middleware(
    State(config): State<Arc<AppConfig>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().as_str().to_string();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let (parts, body) = request.into_parts();
    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = ?e, "Failed to read request body for webhook verification");
            return ApiError::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", "Unreadable body")
                .into_response();
        }
    };

    match verify_request(
        &method,
        &path_and_query,
        &parts.headers,
        &body_bytes,
        &config.hubspot,
    ) {
        Ok(()) => {
            debug!(body_size = body_bytes.len(), "Webhook signature verified");
            let request = Request::from_parts(parts, axum::body::Body::from(body_bytes));
            next.run(request).await
        }
        Err(e) => {
            warn!(path = %path_and_query, error = %e, "Webhook signature verification failed");
            ApiError::new(e.status_code(), e.code(), e.to_string()).into_response()
        }
    }
}
