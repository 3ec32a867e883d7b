//! # Error Handling
//!
//! [`EngineError`] is the domain taxonomy shared by every sync component.
//! [`ApiError`] renders failures at the HTTP edge as `application/problem+json`.

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use sea_orm::DbErr;
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use crate::db::is_unique_violation;
use crate::telemetry;

/// Failures raised by the sync core.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No usable credentials: missing connection, undecryptable tokens, or a
    /// 401 that survived one refresh.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    /// The CRM rejected the refresh grant; the connection has been deactivated.
    #[error("authorization revoked: {0}")]
    AuthRevoked(String),
    #[error(
        "conflicting mapping for {object_type}: local '{local_id}' / external '{external_id}' ({detail})"
    )]
    ConflictingMapping {
        object_type: String,
        local_id: String,
        external_id: String,
        detail: String,
    },
    #[error("rate limited by CRM (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("transient network failure: {0}")]
    TransientNetwork(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("field mapping failed: {0}")]
    FieldMapping(String),
    /// Permanent validation failure reported by the remote side.
    #[error("rejected by CRM (status {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] DbErr),
}

impl EngineError {
    /// Stable identifier persisted in `sync_errors.error_code` and logged as `error_code`.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Unauthenticated(_) => "unauthenticated",
            EngineError::AuthRevoked(_) => "auth_revoked",
            EngineError::ConflictingMapping { .. } => "conflicting_mapping",
            EngineError::RateLimited { .. } => "rate_limited",
            EngineError::TransientNetwork(_) => "transient_network",
            EngineError::MalformedPayload(_) => "malformed_payload",
            EngineError::Timeout(_) => "timeout",
            EngineError::FieldMapping(_) => "field_mapping",
            EngineError::Rejected { .. } => "rejected",
            EngineError::NotFound(_) => "not_found",
            EngineError::Database(_) => "database",
        }
    }

    /// Whether a record-level failure of this kind may be re-attempted by the retry sweep.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            EngineError::ConflictingMapping { .. }
                | EngineError::FieldMapping(_)
                | EngineError::Rejected { .. }
                | EngineError::MalformedPayload(_)
                | EngineError::NotFound(_)
        )
    }

    /// Whether this failure terminates the whole job rather than a single record.
    pub fn is_job_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Unauthenticated(_) | EngineError::AuthRevoked(_) | EngineError::Timeout(_)
        )
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            EngineError::RateLimited { retry_after_secs } => *retry_after_secs,
            _ => None,
        }
    }
}

/// Problem+json error body returned by the HTTP layer.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    #[serde(skip_serializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    pub message: Box<str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: telemetry::current_trace_id().map(String::into_boxed_str),
        }
    }

    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}

impl From<DbErr> for ApiError {
    fn from(error: DbErr) -> Self {
        if is_unique_violation(&error) {
            tracing::debug!(?error, "Unique constraint violation detected");
            return Self::new(StatusCode::CONFLICT, "CONFLICT", "Resource already exists");
        }

        match error {
            DbErr::RecordNotFound(record) => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Record not found: {}", record),
            ),
            DbErr::Conn(connection_err) => {
                tracing::error!("Database connection error: {:?}", connection_err);
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Database service unavailable",
                )
            }
            other => {
                tracing::error!("Database error: {:?}", other);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Database error occurred",
                )
            }
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        let code = error.code().to_ascii_uppercase();
        match error {
            EngineError::Database(db_err) => db_err.into(),
            EngineError::NotFound(msg) => Self::new(StatusCode::NOT_FOUND, code, msg),
            EngineError::ConflictingMapping { .. } => {
                Self::new(StatusCode::CONFLICT, code, error.to_string())
            }
            EngineError::MalformedPayload(msg) | EngineError::FieldMapping(msg) => {
                Self::new(StatusCode::BAD_REQUEST, code, msg)
            }
            EngineError::RateLimited { retry_after_secs } => {
                let err = Self::new(
                    StatusCode::TOO_MANY_REQUESTS,
                    code,
                    "CRM rate limit reached",
                );
                match retry_after_secs {
                    Some(secs) => err.with_retry_after(secs),
                    None => err,
                }
            }
            EngineError::Timeout(msg) => Self::new(StatusCode::GATEWAY_TIMEOUT, code, msg),
            EngineError::Unauthenticated(_)
            | EngineError::AuthRevoked(_)
            | EngineError::TransientNetwork(_)
            | EngineError::Rejected { .. } => {
                tracing::warn!(error = %error, "CRM call failed while serving request");
                Self::new(StatusCode::BAD_GATEWAY, code, error.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[test]
    fn test_engine_error_codes_are_stable() {
        assert_eq!(
            EngineError::RateLimited {
                retry_after_secs: Some(10)
            }
            .code(),
            "rate_limited"
        );
        assert_eq!(
            EngineError::FieldMapping("x".into()).code(),
            "field_mapping"
        );
        assert_eq!(
            EngineError::Database(DbErr::Custom("boom".into())).code(),
            "database"
        );
    }

    #[test]
    fn test_retry_classification() {
        assert!(EngineError::TransientNetwork("reset".into()).is_retryable());
        assert!(EngineError::Timeout("slow".into()).is_retryable());
        assert!(
            EngineError::RateLimited {
                retry_after_secs: None
            }
            .is_retryable()
        );
        assert!(
            !EngineError::ConflictingMapping {
                object_type: "contact".into(),
                local_id: "l".into(),
                external_id: "e".into(),
                detail: "taken".into(),
            }
            .is_retryable()
        );
        assert!(
            !EngineError::Rejected {
                status: 400,
                message: "bad".into()
            }
            .is_retryable()
        );
        assert!(!EngineError::FieldMapping("missing".into()).is_retryable());
    }

    #[test]
    fn test_job_fatal_classification() {
        assert!(EngineError::Unauthenticated("none".into()).is_job_fatal());
        assert!(EngineError::AuthRevoked("revoked".into()).is_job_fatal());
        assert!(!EngineError::TransientNetwork("x".into()).is_job_fatal());
        assert!(
            !EngineError::RateLimited {
                retry_after_secs: None
            }
            .is_job_fatal()
        );
    }

    #[test]
    fn test_rate_limited_maps_to_429_with_retry_after() {
        let api: ApiError = EngineError::RateLimited {
            retry_after_secs: Some(30),
        }
        .into();
        assert_eq!(api.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(api.code, Box::from("RATE_LIMITED"));
        assert_eq!(api.retry_after, Some(30));
    }

    #[tokio::test]
    async fn test_problem_json_response() {
        let response = ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "missing")
            .with_retry_after(5)
            .into_response();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/problem+json"
        );
        assert_eq!(response.headers().get("retry-after").unwrap(), "5");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "NOT_FOUND");
        assert_eq!(json["message"], "missing");
    }

    #[test]
    fn test_db_not_found_maps_to_404() {
        let api: ApiError = DbErr::RecordNotFound("sync_job".into()).into();
        assert_eq!(api.status, StatusCode::NOT_FOUND);
    }
}
