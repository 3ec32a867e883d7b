//! HubSpot CRM v3 client.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, warn};

use super::{CrmClient, CrmError, CrmRecord, CrmWriteAck, Properties, TokenGrant};
use crate::config::HubSpotConfig;
use crate::models::ObjectType;

const SEARCH_PAGE_SIZE: u32 = 100;

pub struct HubSpotClient {
    http: reqwest::Client,
    api_base: String,
    oauth_base: String,
    client_id: String,
    client_secret: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectBody {
    id: String,
    #[serde(default)]
    properties: Properties,
    updated_at: Option<String>,
    #[serde(default)]
    archived: bool,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<ObjectBody>,
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    next: Option<NextPage>,
}

#[derive(Debug, Deserialize)]
struct NextPage {
    after: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

impl HubSpotClient {
    pub fn new(config: &HubSpotConfig) -> Result<Self, CrmError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| CrmError::Transient(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            oauth_base: config.oauth_base.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone().unwrap_or_default(),
            client_secret: config.client_secret.clone().unwrap_or_default(),
        })
    }

    fn objects_url(&self, object_type: ObjectType) -> String {
        format!("{}/crm/v3/objects/{}", self.api_base, object_path(object_type))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response, CrmError> {
        let response = request.send().await.map_err(map_transport_error)?;
        check_status(response).await
    }
}

/// Path segment HubSpot uses for each object type.
pub fn object_path(object_type: ObjectType) -> &'static str {
    match object_type {
        ObjectType::Contact => "contacts",
        ObjectType::Company => "companies",
        ObjectType::Deal => "deals",
        ObjectType::Activity => "notes",
    }
}

/// Property carrying the last-modified timestamp; contacts use the legacy name.
fn modified_property(object_type: ObjectType) -> &'static str {
    match object_type {
        ObjectType::Contact => "lastmodifieddate",
        _ => "hs_lastmodifieddate",
    }
}

fn map_transport_error(err: reqwest::Error) -> CrmError {
    if err.is_timeout() {
        CrmError::Timeout
    } else {
        CrmError::Transient(err.to_string())
    }
}

async fn check_status(response: Response) -> Result<Response, CrmError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get("Retry-After")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();

    Err(match status {
        StatusCode::TOO_MANY_REQUESTS => {
            warn!(retry_after, "HubSpot rate limit hit");
            CrmError::RateLimited {
                retry_after_secs: retry_after,
            }
        }
        StatusCode::UNAUTHORIZED => CrmError::Unauthorized,
        StatusCode::NOT_FOUND => CrmError::NotFound(error_message(&body)),
        status if status.is_client_error() => CrmError::Rejected {
            status: status.as_u16(),
            message: error_message(&body),
        },
        status => CrmError::Transient(format!("HubSpot returned {}: {}", status, error_message(&body))),
    })
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<JsonValue>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(512).collect())
}

/// Parses either an RFC3339 string or epoch milliseconds.
fn parse_hubspot_time(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| s.parse::<i64>().ok().and_then(|ms| Utc.timestamp_millis_opt(ms).single())),
        JsonValue::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

fn into_record(object_type: ObjectType, body: ObjectBody) -> Result<CrmRecord, CrmError> {
    let updated_at = body
        .updated_at
        .as_deref()
        .and_then(|s| parse_hubspot_time(&JsonValue::String(s.to_string())))
        .or_else(|| {
            body.properties
                .get(modified_property(object_type))
                .and_then(parse_hubspot_time)
        })
        .ok_or_else(|| {
            CrmError::Malformed(format!("object {} has no modification timestamp", body.id))
        })?;

    Ok(CrmRecord {
        id: body.id,
        properties: body.properties,
        updated_at,
        archived: body.archived,
    })
}

#[async_trait]
impl CrmClient for HubSpotClient {
    async fn fetch_changed(
        &self,
        access_token: &str,
        object_type: ObjectType,
        since: Option<DateTime<Utc>>,
        properties: &[String],
    ) -> Result<Vec<CrmRecord>, CrmError> {
        let url = format!("{}/search", self.objects_url(object_type));
        let modified = modified_property(object_type);
        let filter_groups = match since {
            Some(since) => json!([{
                "filters": [{
                    "propertyName": modified,
                    "operator": "GTE",
                    "value": since.timestamp_millis().to_string(),
                }]
            }]),
            None => json!([]),
        };

        let mut records = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let mut body = json!({
                "filterGroups": filter_groups,
                "sorts": [{ "propertyName": modified, "direction": "ASCENDING" }],
                "properties": properties,
                "limit": SEARCH_PAGE_SIZE,
            });
            if let Some(after) = &after {
                body["after"] = JsonValue::String(after.clone());
            }

            let response = self
                .send(self.http.post(&url).bearer_auth(access_token).json(&body))
                .await?;
            let page: SearchResponse = response
                .json()
                .await
                .map_err(|e| CrmError::Malformed(e.to_string()))?;

            for result in page.results {
                records.push(into_record(object_type, result)?);
            }

            match page.paging.and_then(|p| p.next) {
                Some(next) => after = Some(next.after),
                None => break,
            }
        }

        debug!(
            object_type = %object_type,
            count = records.len(),
            "Fetched changed HubSpot records"
        );
        Ok(records)
    }

    async fn fetch_record(
        &self,
        access_token: &str,
        object_type: ObjectType,
        external_id: &str,
        properties: &[String],
    ) -> Result<CrmRecord, CrmError> {
        let url = format!("{}/{}", self.objects_url(object_type), external_id);
        let mut request = self.http.get(&url).bearer_auth(access_token);
        if !properties.is_empty() {
            request = request.query(&[("properties", properties.join(","))]);
        }

        let response = self.send(request).await?;
        let body: ObjectBody = response
            .json()
            .await
            .map_err(|e| CrmError::Malformed(e.to_string()))?;
        into_record(object_type, body)
    }

    async fn create_record(
        &self,
        access_token: &str,
        object_type: ObjectType,
        properties: Properties,
    ) -> Result<CrmWriteAck, CrmError> {
        let response = self
            .send(
                self.http
                    .post(self.objects_url(object_type))
                    .bearer_auth(access_token)
                    .json(&json!({ "properties": properties })),
            )
            .await?;
        let body: ObjectBody = response
            .json()
            .await
            .map_err(|e| CrmError::Malformed(e.to_string()))?;
        let record = into_record(object_type, body)?;
        Ok(CrmWriteAck {
            id: record.id,
            updated_at: record.updated_at,
        })
    }

    async fn update_record(
        &self,
        access_token: &str,
        object_type: ObjectType,
        external_id: &str,
        properties: Properties,
    ) -> Result<CrmWriteAck, CrmError> {
        let url = format!("{}/{}", self.objects_url(object_type), external_id);
        let response = self
            .send(
                self.http
                    .patch(&url)
                    .bearer_auth(access_token)
                    .json(&json!({ "properties": properties })),
            )
            .await?;
        let body: ObjectBody = response
            .json()
            .await
            .map_err(|e| CrmError::Malformed(e.to_string()))?;
        let record = into_record(object_type, body)?;
        Ok(CrmWriteAck {
            id: record.id,
            updated_at: record.updated_at,
        })
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, CrmError> {
        let url = format!("{}/oauth/v1/token", self.oauth_base);
        let response = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            let parsed: JsonValue = serde_json::from_str(&body).unwrap_or(JsonValue::Null);
            let code = parsed
                .get("error")
                .or_else(|| parsed.get("status"))
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if matches!(code, "invalid_grant" | "BAD_REFRESH_TOKEN") {
                return Err(CrmError::AuthRevoked(error_message(&body)));
            }
            return Err(CrmError::Rejected {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }

        let response = check_status(response).await?;
        let grant: TokenResponse = response
            .json()
            .await
            .map_err(|e| CrmError::Malformed(e.to_string()))?;

        Ok(TokenGrant {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_in_secs: grant.expires_in,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339_and_epoch_millis() {
        let rfc = parse_hubspot_time(&json!("2025-01-01T10:00:00.000Z")).unwrap();
        let millis = parse_hubspot_time(&json!(1_735_725_600_000i64)).unwrap();
        let millis_str = parse_hubspot_time(&json!("1735725600000")).unwrap();
        assert_eq!(rfc, millis);
        assert_eq!(millis, millis_str);
        assert!(parse_hubspot_time(&json!(true)).is_none());
    }

    #[test]
    fn record_timestamp_falls_back_to_modified_property() {
        let mut properties = Properties::new();
        properties.insert(
            "hs_lastmodifieddate".into(),
            json!("2025-01-01T10:00:00Z"),
        );
        let record = into_record(
            ObjectType::Deal,
            ObjectBody {
                id: "9".into(),
                properties,
                updated_at: None,
                archived: false,
            },
        )
        .unwrap();
        assert_eq!(record.updated_at.to_rfc3339(), "2025-01-01T10:00:00+00:00");

        let missing = into_record(
            ObjectType::Deal,
            ObjectBody {
                id: "10".into(),
                properties: Properties::new(),
                updated_at: None,
                archived: false,
            },
        );
        assert!(matches!(missing, Err(CrmError::Malformed(_))));
    }

    #[test]
    fn activity_maps_to_notes() {
        assert_eq!(object_path(ObjectType::Activity), "notes");
        assert_eq!(object_path(ObjectType::Company), "companies");
    }
}
