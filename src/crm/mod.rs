//! External CRM capability.
//!
//! The sync core talks to the CRM only through [`CrmClient`]. Every failure is
//! classified into a [`CrmError`] so rate limits stay distinguishable from
//! permanent rejections.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use crate::error::EngineError;
use crate::models::ObjectType;

pub mod hubspot;

pub use hubspot::HubSpotClient;

/// Property bag keyed by CRM property name.
pub type Properties = Map<String, JsonValue>;

/// One CRM object as returned by reads and searches.
#[derive(Debug, Clone, PartialEq)]
pub struct CrmRecord {
    pub id: String,
    pub properties: Properties,
    /// `hs_lastmodifieddate` of the returned version
    pub updated_at: DateTime<Utc>,
    pub archived: bool,
}

/// Acknowledgement of a create or update.
#[derive(Debug, Clone, PartialEq)]
pub struct CrmWriteAck {
    pub id: String,
    /// Modification timestamp of the version just written
    pub updated_at: DateTime<Utc>,
}

/// Tokens returned by a refresh grant.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    /// Present when the CRM rotated the refresh token
    pub refresh_token: Option<String>,
    pub expires_in_secs: Option<i64>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CrmError {
    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("access token rejected")]
    Unauthorized,
    #[error("refresh grant revoked: {0}")]
    AuthRevoked(String),
    #[error("transient CRM failure: {0}")]
    Transient(String),
    #[error("CRM request timed out")]
    Timeout,
    #[error("CRM rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("malformed CRM response: {0}")]
    Malformed(String),
    #[error("CRM object not found: {0}")]
    NotFound(String),
}

impl From<CrmError> for EngineError {
    fn from(err: CrmError) -> Self {
        match err {
            CrmError::RateLimited { retry_after_secs } => {
                EngineError::RateLimited { retry_after_secs }
            }
            CrmError::Unauthorized => {
                EngineError::Unauthenticated("CRM rejected the access token".to_string())
            }
            CrmError::AuthRevoked(msg) => EngineError::AuthRevoked(msg),
            CrmError::Transient(msg) => EngineError::TransientNetwork(msg),
            CrmError::Timeout => EngineError::TransientNetwork("CRM request timed out".to_string()),
            CrmError::Rejected { status, message } => EngineError::Rejected { status, message },
            CrmError::Malformed(msg) => EngineError::TransientNetwork(format!(
                "malformed CRM response: {msg}"
            )),
            CrmError::NotFound(msg) => EngineError::NotFound(msg),
        }
    }
}

#[async_trait]
pub trait CrmClient: Send + Sync {
    /// Records of `object_type` modified at or after `since`, oldest first.
    async fn fetch_changed(
        &self,
        access_token: &str,
        object_type: ObjectType,
        since: Option<DateTime<Utc>>,
        properties: &[String],
    ) -> Result<Vec<CrmRecord>, CrmError>;

    async fn fetch_record(
        &self,
        access_token: &str,
        object_type: ObjectType,
        external_id: &str,
        properties: &[String],
    ) -> Result<CrmRecord, CrmError>;

    async fn create_record(
        &self,
        access_token: &str,
        object_type: ObjectType,
        properties: Properties,
    ) -> Result<CrmWriteAck, CrmError>;

    async fn update_record(
        &self,
        access_token: &str,
        object_type: ObjectType,
        external_id: &str,
        properties: Properties,
    ) -> Result<CrmWriteAck, CrmError>;

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, CrmError>;
}
