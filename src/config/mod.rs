//! Configuration loading for the CRM sync service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `CRMSYNC_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

const ENV_PREFIX: &str = "CRMSYNC_";

/// Application configuration derived from `CRMSYNC_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_key: Option<Vec<u8>>,
    #[serde(default)]
    pub hubspot: HubSpotConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub rate_limit_policy: RateLimitPolicyConfig,
    #[serde(default)]
    pub token_refresh: TokenRefreshConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

/// HubSpot API and OAuth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct HubSpotConfig {
    #[serde(default = "default_hubspot_api_base")]
    pub api_base: String,
    #[serde(default = "default_hubspot_api_base")]
    pub oauth_base: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Also the HMAC key for `X-HubSpot-Signature-v3`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default = "default_hubspot_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_webhook_tolerance_seconds")]
    pub webhook_tolerance_seconds: u64,
}

/// Job scheduler configuration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_tick_interval_seconds")]
    pub tick_interval_seconds: u64,
    /// Maximum configs inspected per tick.
    #[serde(default = "default_scheduler_batch_size")]
    pub batch_size: u64,
}

/// Sync executor worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ExecutorConfig {
    #[serde(default = "default_executor_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_executor_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_executor_claim_batch")]
    pub claim_batch: u64,
    /// Wall-clock limit for a single job; exceeding it fails the job with `timeout`.
    #[serde(default = "default_executor_max_run_seconds")]
    pub max_run_seconds: u64,
    /// Immediate in-job retries for transient record failures before a SyncError is recorded.
    #[serde(default = "default_executor_inline_retries")]
    pub inline_retries: u32,
}

/// Record-level retry policy and sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RetryConfig {
    #[serde(default = "default_retry_base_seconds")]
    pub base_seconds: u64,
    #[serde(default = "default_retry_max_seconds")]
    pub max_seconds: u64,
    #[serde(default = "default_retry_max_retries")]
    pub max_retries: i32,
    #[serde(default = "default_retry_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
    #[serde(default = "default_retry_sweep_batch")]
    pub sweep_batch: u64,
    /// How far `next_retry_at` is pushed while a sweeper holds an error.
    #[serde(default = "default_retry_claim_lease_seconds")]
    pub claim_lease_seconds: u64,
}

/// Rate limit policy configuration for rescheduling rate-limited jobs.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RateLimitPolicyConfig {
    /// Base retry interval in seconds (default: 5)
    ///
    /// Subsequent pauses use exponential backoff: base_seconds * 2^attempts.
    ///
    /// Environment variable: `CRMSYNC_RATE_LIMIT_BASE_SECONDS`
    #[serde(default = "default_rate_limit_base_seconds")]
    #[schema(example = 5)]
    pub base_seconds: u64,

    /// Maximum retry interval in seconds (default: 900)
    ///
    /// Environment variable: `CRMSYNC_RATE_LIMIT_MAX_SECONDS`
    #[serde(default = "default_rate_limit_max_seconds")]
    #[schema(example = 900)]
    pub max_seconds: u64,

    /// Jitter factor (default: 0.1, range: 0.0-1.0)
    ///
    /// Environment variable: `CRMSYNC_RATE_LIMIT_JITTER_FACTOR`
    #[serde(default = "default_rate_limit_jitter_factor")]
    #[schema(example = 0.1, minimum = 0.0, maximum = 1.0)]
    pub jitter_factor: f64,
}

/// Credential refresh configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct TokenRefreshConfig {
    /// Lead time before expiry to trigger refresh in seconds (default: 300)
    #[serde(default = "default_token_refresh_lead_time_seconds")]
    pub lead_time_seconds: u64,

    /// Consecutive post-refresh 401s before the connection is deactivated (default: 3)
    #[serde(default = "default_token_refresh_max_auth_failures")]
    pub max_auth_failures: i32,
}

/// Webhook ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct WebhookConfig {
    /// Events per object type at or above which a scoped job is enqueued instead of
    /// applying records inline.
    #[serde(default = "default_webhook_batch_threshold")]
    pub batch_threshold: usize,
    #[serde(default = "default_webhook_max_batch_size")]
    pub max_batch_size: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: None,
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            crypto_key: None,
            hubspot: HubSpotConfig::default(),
            scheduler: SchedulerConfig::default(),
            executor: ExecutorConfig::default(),
            retry: RetryConfig::default(),
            rate_limit_policy: RateLimitPolicyConfig::default(),
            token_refresh: TokenRefreshConfig::default(),
            webhook: WebhookConfig::default(),
        }
    }
}

impl Default for HubSpotConfig {
    fn default() -> Self {
        Self {
            api_base: default_hubspot_api_base(),
            oauth_base: default_hubspot_api_base(),
            client_id: None,
            client_secret: None,
            request_timeout_ms: default_hubspot_request_timeout_ms(),
            webhook_tolerance_seconds: default_webhook_tolerance_seconds(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: default_scheduler_tick_interval_seconds(),
            batch_size: default_scheduler_batch_size(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_executor_tick_ms(),
            concurrency: default_executor_concurrency(),
            claim_batch: default_executor_claim_batch(),
            max_run_seconds: default_executor_max_run_seconds(),
            inline_retries: default_executor_inline_retries(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_seconds: default_retry_base_seconds(),
            max_seconds: default_retry_max_seconds(),
            max_retries: default_retry_max_retries(),
            sweep_interval_seconds: default_retry_sweep_interval_seconds(),
            sweep_batch: default_retry_sweep_batch(),
            claim_lease_seconds: default_retry_claim_lease_seconds(),
        }
    }
}

impl Default for RateLimitPolicyConfig {
    fn default() -> Self {
        Self {
            base_seconds: default_rate_limit_base_seconds(),
            max_seconds: default_rate_limit_max_seconds(),
            jitter_factor: default_rate_limit_jitter_factor(),
        }
    }
}

impl Default for TokenRefreshConfig {
    fn default() -> Self {
        Self {
            lead_time_seconds: default_token_refresh_lead_time_seconds(),
            max_auth_failures: default_token_refresh_max_auth_failures(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            batch_threshold: default_webhook_batch_threshold(),
            max_batch_size: default_webhook_max_batch_size(),
        }
    }
}

impl HubSpotConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [("api_base", &self.api_base), ("oauth_base", &self.oauth_base)] {
            if url::Url::parse(value).is_err() {
                return Err(ConfigError::InvalidUrl {
                    field: field.to_string(),
                    value: value.clone(),
                });
            }
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidRequestTimeout {
                value: self.request_timeout_ms,
            });
        }
        if self.webhook_tolerance_seconds == 0 {
            return Err(ConfigError::InvalidWebhookTolerance {
                value: self.webhook_tolerance_seconds,
            });
        }
        Ok(())
    }
}

impl SchedulerConfig {
    /// Validate scheduler configuration bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_seconds < 1 || self.tick_interval_seconds > 3600 {
            return Err(ConfigError::InvalidSchedulerTickInterval {
                value: self.tick_interval_seconds,
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize {
                field: "scheduler.batch_size".to_string(),
            });
        }
        Ok(())
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 || self.concurrency > 256 {
            return Err(ConfigError::InvalidExecutorConcurrency {
                value: self.concurrency,
            });
        }
        if self.claim_batch == 0 {
            return Err(ConfigError::InvalidBatchSize {
                field: "executor.claim_batch".to_string(),
            });
        }
        if self.max_run_seconds < 10 {
            return Err(ConfigError::InvalidExecutorMaxRun {
                value: self.max_run_seconds,
            });
        }
        Ok(())
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_seconds == 0 || self.base_seconds > self.max_seconds {
            return Err(ConfigError::InvalidRetryBounds {
                base: self.base_seconds,
                max: self.max_seconds,
            });
        }
        if self.max_retries < 0 {
            return Err(ConfigError::InvalidMaxRetries {
                value: self.max_retries,
            });
        }
        if self.sweep_batch == 0 {
            return Err(ConfigError::InvalidBatchSize {
                field: "retry.sweep_batch".to_string(),
            });
        }
        Ok(())
    }
}

impl RateLimitPolicyConfig {
    /// Validate rate limit policy configuration bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_seconds > self.max_seconds {
            return Err(ConfigError::InvalidRateLimitBounds {
                base: self.base_seconds,
                max: self.max_seconds,
            });
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::InvalidRateLimitJitter {
                value: self.jitter_factor,
            });
        }

        Ok(())
    }
}

impl TokenRefreshConfig {
    /// Validate token refresh configuration bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lead_time_seconds > 86400 {
            return Err(ConfigError::InvalidTokenRefreshLeadTime {
                value: self.lead_time_seconds,
            });
        }
        if self.max_auth_failures < 1 {
            return Err(ConfigError::InvalidMaxAuthFailures {
                value: self.max_auth_failures,
            });
        }
        Ok(())
    }
}

impl WebhookConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_threshold == 0 || self.max_batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize {
                field: "webhook".to_string(),
            });
        }
        Ok(())
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if config.crypto_key.is_some() {
            config.crypto_key = Some(b"[REDACTED]".to_vec());
        }
        if config.database_url.is_some() {
            config.database_url = Some("[REDACTED]".to_string());
        }
        if config.hubspot.client_id.is_some() {
            config.hubspot.client_id = Some("[REDACTED]".to_string());
        }
        if config.hubspot.client_secret.is_some() {
            config.hubspot.client_secret = Some("[REDACTED]".to_string());
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.crypto_key {
            Some(ref key) if key.len() != 32 => {
                return Err(ConfigError::InvalidCryptoKeyLength { length: key.len() });
            }
            Some(_) => {}
            None => return Err(ConfigError::MissingCryptoKey),
        }

        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }

        // Outside local/test the OAuth app must be configured.
        if !matches!(self.profile.as_str(), "local" | "test") {
            if self.hubspot.client_id.is_none() {
                return Err(ConfigError::MissingHubSpotClientId);
            }
            if self.hubspot.client_secret.is_none() {
                return Err(ConfigError::MissingHubSpotClientSecret);
            }
        }

        self.hubspot.validate()?;
        self.scheduler.validate()?;
        self.executor.validate()?;
        self.retry.validate()?;
        self.rate_limit_policy.validate()?;
        self.token_refresh.validate()?;
        self.webhook.validate()?;

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_hubspot_api_base() -> String {
    "https://api.hubapi.com".to_string()
}

fn default_hubspot_request_timeout_ms() -> u64 {
    10_000
}

fn default_webhook_tolerance_seconds() -> u64 {
    300 // 5 minutes
}

fn default_scheduler_tick_interval_seconds() -> u64 {
    60
}

fn default_scheduler_batch_size() -> u64 {
    500
}

fn default_executor_tick_ms() -> u64 {
    5000
}

fn default_executor_concurrency() -> usize {
    10
}

fn default_executor_claim_batch() -> u64 {
    50
}

fn default_executor_max_run_seconds() -> u64 {
    900 // 15 minutes
}

fn default_executor_inline_retries() -> u32 {
    1
}

fn default_retry_base_seconds() -> u64 {
    30
}

fn default_retry_max_seconds() -> u64 {
    3600 // 1 hour
}

fn default_retry_max_retries() -> i32 {
    5
}

fn default_retry_sweep_interval_seconds() -> u64 {
    30
}

fn default_retry_sweep_batch() -> u64 {
    100
}

fn default_retry_claim_lease_seconds() -> u64 {
    300
}

fn default_rate_limit_base_seconds() -> u64 {
    5
}

fn default_rate_limit_max_seconds() -> u64 {
    900 // 15 minutes
}

fn default_rate_limit_jitter_factor() -> f64 {
    0.1 // 10% jitter
}

fn default_token_refresh_lead_time_seconds() -> u64 {
    300 // 5 minutes
}

fn default_token_refresh_max_auth_failures() -> i32 {
    3
}

fn default_webhook_batch_threshold() -> usize {
    25
}

fn default_webhook_max_batch_size() -> usize {
    100
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("crypto key is missing; set CRMSYNC_CRYPTO_KEY environment variable")]
    MissingCryptoKey,
    #[error("crypto key is invalid base64: {error}")]
    InvalidCryptoKeyBase64 { error: String },
    #[error("crypto key must decode to exactly 32 bytes, got {length} bytes")]
    InvalidCryptoKeyLength { length: usize },
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("HubSpot client ID is missing; set CRMSYNC_HUBSPOT_CLIENT_ID")]
    MissingHubSpotClientId,
    #[error("HubSpot client secret is missing; set CRMSYNC_HUBSPOT_CLIENT_SECRET")]
    MissingHubSpotClientSecret,
    #[error("{field} is not a valid URL: '{value}'")]
    InvalidUrl { field: String, value: String },
    #[error("HubSpot request timeout must be positive, got {value}")]
    InvalidRequestTimeout { value: u64 },
    #[error("webhook signature tolerance must be positive, got {value}")]
    InvalidWebhookTolerance { value: u64 },
    #[error("scheduler tick interval must be between 1 and 3600 seconds, got {value}")]
    InvalidSchedulerTickInterval { value: u64 },
    #[error("{field} must be positive")]
    InvalidBatchSize { field: String },
    #[error("executor concurrency must be between 1 and 256, got {value}")]
    InvalidExecutorConcurrency { value: usize },
    #[error("executor max run must be at least 10 seconds, got {value}")]
    InvalidExecutorMaxRun { value: u64 },
    #[error("retry base seconds ({base}) must be positive and not exceed max seconds ({max})")]
    InvalidRetryBounds { base: u64, max: u64 },
    #[error("retry max retries cannot be negative, got {value}")]
    InvalidMaxRetries { value: i32 },
    #[error("rate limit base seconds ({base}) cannot be greater than max seconds ({max})")]
    InvalidRateLimitBounds { base: u64, max: u64 },
    #[error("rate limit jitter factor must be between 0.0 and 1.0, got {value}")]
    InvalidRateLimitJitter { value: f64 },
    #[error("token refresh lead time must not exceed 86400 seconds, got {value}")]
    InvalidTokenRefreshLeadTime { value: u64 },
    #[error("token refresh max auth failures must be at least 1, got {value}")]
    InvalidMaxAuthFailures { value: i32 },
}

/// Loads configuration using layered `.env` files and `CRMSYNC_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads and validates configuration.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let api_bind_addr = layered
            .remove("API_BIND_ADDR")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_api_bind_addr);
        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let log_format = layered
            .remove("LOG_FORMAT")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_format);
        let database_url = non_empty(layered.remove("DATABASE_URL"));

        let crypto_key = match layered.remove("CRYPTO_KEY").filter(|v| !v.is_empty()) {
            Some(key_str) => {
                use base64::{Engine as _, engine::general_purpose};
                Some(general_purpose::STANDARD.decode(key_str.trim()).map_err(|e| {
                    ConfigError::InvalidCryptoKeyBase64 {
                        error: e.to_string(),
                    }
                })?)
            }
            None => None,
        };

        let hubspot = HubSpotConfig {
            api_base: layered
                .remove("HUBSPOT_API_BASE")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(default_hubspot_api_base),
            oauth_base: layered
                .remove("HUBSPOT_OAUTH_BASE")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(default_hubspot_api_base),
            client_id: non_empty(layered.remove("HUBSPOT_CLIENT_ID")),
            client_secret: non_empty(layered.remove("HUBSPOT_CLIENT_SECRET")),
            request_timeout_ms: take_parsed(
                &mut layered,
                "HUBSPOT_REQUEST_TIMEOUT_MS",
                default_hubspot_request_timeout_ms,
            ),
            webhook_tolerance_seconds: take_parsed(
                &mut layered,
                "HUBSPOT_WEBHOOK_TOLERANCE_SECONDS",
                default_webhook_tolerance_seconds,
            ),
        };

        let scheduler = SchedulerConfig {
            tick_interval_seconds: take_parsed(
                &mut layered,
                "SCHEDULER_TICK_INTERVAL_SECONDS",
                default_scheduler_tick_interval_seconds,
            ),
            batch_size: take_parsed(
                &mut layered,
                "SCHEDULER_BATCH_SIZE",
                default_scheduler_batch_size,
            ),
        };

        let executor = ExecutorConfig {
            tick_ms: take_parsed(&mut layered, "EXECUTOR_TICK_MS", default_executor_tick_ms),
            concurrency: take_parsed(
                &mut layered,
                "EXECUTOR_CONCURRENCY",
                default_executor_concurrency,
            ),
            claim_batch: take_parsed(
                &mut layered,
                "EXECUTOR_CLAIM_BATCH",
                default_executor_claim_batch,
            ),
            max_run_seconds: take_parsed(
                &mut layered,
                "EXECUTOR_MAX_RUN_SECONDS",
                default_executor_max_run_seconds,
            ),
            inline_retries: take_parsed(
                &mut layered,
                "EXECUTOR_INLINE_RETRIES",
                default_executor_inline_retries,
            ),
        };

        let retry = RetryConfig {
            base_seconds: take_parsed(&mut layered, "RETRY_BASE_SECONDS", default_retry_base_seconds),
            max_seconds: take_parsed(&mut layered, "RETRY_MAX_SECONDS", default_retry_max_seconds),
            max_retries: take_parsed(&mut layered, "RETRY_MAX_RETRIES", default_retry_max_retries),
            sweep_interval_seconds: take_parsed(
                &mut layered,
                "RETRY_SWEEP_INTERVAL_SECONDS",
                default_retry_sweep_interval_seconds,
            ),
            sweep_batch: take_parsed(&mut layered, "RETRY_SWEEP_BATCH", default_retry_sweep_batch),
            claim_lease_seconds: take_parsed(
                &mut layered,
                "RETRY_CLAIM_LEASE_SECONDS",
                default_retry_claim_lease_seconds,
            ),
        };

        let rate_limit_policy = RateLimitPolicyConfig {
            base_seconds: take_parsed(
                &mut layered,
                "RATE_LIMIT_BASE_SECONDS",
                default_rate_limit_base_seconds,
            ),
            max_seconds: take_parsed(
                &mut layered,
                "RATE_LIMIT_MAX_SECONDS",
                default_rate_limit_max_seconds,
            ),
            jitter_factor: take_parsed(
                &mut layered,
                "RATE_LIMIT_JITTER_FACTOR",
                default_rate_limit_jitter_factor,
            ),
        };

        let token_refresh = TokenRefreshConfig {
            lead_time_seconds: take_parsed(
                &mut layered,
                "TOKEN_REFRESH_LEAD_TIME_SECONDS",
                default_token_refresh_lead_time_seconds,
            ),
            max_auth_failures: take_parsed(
                &mut layered,
                "TOKEN_REFRESH_MAX_AUTH_FAILURES",
                default_token_refresh_max_auth_failures,
            ),
        };

        let webhook = WebhookConfig {
            batch_threshold: take_parsed(
                &mut layered,
                "WEBHOOK_BATCH_THRESHOLD",
                default_webhook_batch_threshold,
            ),
            max_batch_size: take_parsed(
                &mut layered,
                "WEBHOOK_MAX_BATCH_SIZE",
                default_webhook_max_batch_size,
            ),
        };

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections: take_parsed(
                &mut layered,
                "DB_MAX_CONNECTIONS",
                default_db_max_connections,
            ),
            db_acquire_timeout_ms: take_parsed(
                &mut layered,
                "DB_ACQUIRE_TIMEOUT_MS",
                default_db_acquire_timeout_ms,
            ),
            crypto_key,
            hubspot,
            scheduler,
            executor,
            retry,
            rate_limit_policy,
            token_refresh,
            webhook,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes `key` and parses it, falling back to `default` when absent or unparsable.
fn take_parsed<T: FromStr>(
    layered: &mut BTreeMap<String, String>,
    key: &str,
    default: fn() -> T,
) -> T {
    layered
        .remove(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or_else(default)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|val| {
        let trimmed = val.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        AppConfig {
            crypto_key: Some(vec![7u8; 32]),
            ..AppConfig::default()
        }
    }

    #[test]
    fn test_defaults_validate_with_crypto_key() {
        assert!(valid_config().validate().is_ok());
        assert!(matches!(
            AppConfig::default().validate(),
            Err(ConfigError::MissingCryptoKey)
        ));
    }

    #[test]
    fn test_crypto_key_length_is_checked() {
        let config = AppConfig {
            crypto_key: Some(vec![1u8; 16]),
            ..AppConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidCryptoKeyLength { length: 16 })
        ));
    }

    #[test]
    fn test_rate_limit_policy_validation() {
        let valid_config = RateLimitPolicyConfig {
            base_seconds: 5,
            max_seconds: 900,
            jitter_factor: 0.1,
        };
        assert!(valid_config.validate().is_ok());

        let invalid_bounds = RateLimitPolicyConfig {
            base_seconds: 1000,
            max_seconds: 500,
            jitter_factor: 0.1,
        };
        assert!(invalid_bounds.validate().is_err());

        let invalid_jitter = RateLimitPolicyConfig {
            base_seconds: 5,
            max_seconds: 900,
            jitter_factor: 1.5,
        };
        assert!(invalid_jitter.validate().is_err());
    }

    #[test]
    fn test_retry_bounds_validation() {
        let mut config = valid_config();
        config.retry.base_seconds = 7200;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRetryBounds { .. })
        ));
    }

    #[test]
    fn test_production_requires_hubspot_credentials() {
        let mut config = valid_config();
        config.profile = "production".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingHubSpotClientId)
        ));

        config.hubspot.client_id = Some("client".to_string());
        config.hubspot.client_secret = Some("secret".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_redacted_json_hides_secrets() {
        let mut config = valid_config();
        config.hubspot.client_secret = Some("super-secret".to_string());
        config.database_url = Some("postgres://user:pw@db/crm".to_string());

        let json = config.redacted_json().unwrap();
        assert!(!json.contains("super-secret"));
        assert!(!json.contains("user:pw"));
        assert!(json.contains("[REDACTED]"));
    }
}
