//! # Retry/Error Manager
//!
//! Owns record-level failure history. Retryable failures are re-attempted by
//! a background sweep with capped exponential backoff:
//! `next_retry_at = now + min(max, base * 2^retry_count)`. An error whose
//! `retry_count` reaches `max_retries` is dead-lettered and kept for manual
//! intervention.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, histogram};
use tokio::time::{Duration as TokioDuration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::RetryConfig;
use crate::error::EngineError;
use crate::events::{SharedEventSink, SyncEvent};
use crate::field_mapping::FieldMapping;
use crate::models::sync_error::{Model as SyncErrorModel, SyncErrorStatus};
use crate::models::{ObjectType, SyncDirection};
use crate::record_sync::{RecordSyncer, SyncContext};
use crate::repositories::sync_error::NewSyncError;
use crate::repositories::{SyncConfigRepository, SyncErrorRepository};

/// Delay before the next attempt of an error that has failed `retry_count` retries.
pub fn next_retry_delay(config: &RetryConfig, retry_count: i32) -> Duration {
    let exponent = retry_count.clamp(0, 62) as u32;
    let delay = 2u64
        .checked_pow(exponent)
        .and_then(|factor| config.base_seconds.checked_mul(factor))
        .unwrap_or(u64::MAX)
        .min(config.max_seconds);
    Duration::seconds(delay.min(i64::MAX as u64) as i64)
}

/// A record operation that failed inside a job or webhook.
#[derive(Debug)]
pub struct RecordFailure<'a> {
    pub tenant_id: Uuid,
    pub job_id: Option<Uuid>,
    pub object_type: ObjectType,
    /// `ToExternal` for a push, `FromExternal` for a pull
    pub direction: SyncDirection,
    pub local_id: Option<String>,
    pub external_id: Option<String>,
    pub error: &'a EngineError,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub due: usize,
    pub claimed: usize,
    pub resolved: usize,
    pub failed: usize,
    pub rescheduled: usize,
    pub exhausted: usize,
}

pub struct RetryManager {
    errors: SyncErrorRepository,
    configs: SyncConfigRepository,
    syncer: Arc<RecordSyncer>,
    config: RetryConfig,
    events: SharedEventSink,
}

impl RetryManager {
    pub fn new(
        errors: SyncErrorRepository,
        configs: SyncConfigRepository,
        syncer: Arc<RecordSyncer>,
        config: RetryConfig,
        events: SharedEventSink,
    ) -> Self {
        Self {
            errors,
            configs,
            syncer,
            config,
            events,
        }
    }

    /// Persists a failed record operation. Non-retryable failures go
    /// straight to the dead-letter state.
    ///
    /// A record operation keeps at most one open error: a repeat failure
    /// counts as another attempt on the existing row.
    pub async fn record_failure(
        &self,
        failure: RecordFailure<'_>,
    ) -> Result<SyncErrorModel, EngineError> {
        let open = self
            .errors
            .find_open(
                failure.tenant_id,
                failure.object_type,
                failure.direction,
                failure.local_id.as_deref(),
                failure.external_id.as_deref(),
            )
            .await?;
        if let Some(open) = open {
            debug!(
                error_id = %open.id,
                tenant_id = %open.tenant_id,
                object_type = %open.object_type,
                error_code = failure.error.code(),
                "Record failed again; updating open error"
            );
            self.fail_attempt(&open, failure.error).await?;
            return self
                .errors
                .find_by_id(open.id)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("sync error {}", open.id)));
        }

        let now = Utc::now();
        let retryable = failure.error.is_retryable();
        let next_retry_at = retryable.then(|| {
            let backoff = next_retry_delay(&self.config, 0);
            let hinted = failure
                .error
                .retry_after_secs()
                .map(|secs| Duration::seconds(secs as i64))
                .unwrap_or_else(Duration::zero);
            now + backoff.max(hinted)
        });

        let stored = self
            .errors
            .insert(NewSyncError {
                tenant_id: failure.tenant_id,
                job_id: failure.job_id,
                object_type: failure.object_type,
                direction: failure.direction,
                local_id: failure.local_id,
                external_id: failure.external_id,
                error_code: failure.error.code().to_string(),
                error_message: failure.error.to_string(),
                status: if retryable {
                    SyncErrorStatus::PendingRetry
                } else {
                    SyncErrorStatus::DeadLetter
                },
                max_retries: self.config.max_retries,
                next_retry_at,
            })
            .await?;

        counter!(
            "crm_sync_errors_recorded_total",
            "error_code" => failure.error.code(),
            "dead_letter" => if retryable { "false" } else { "true" }
        )
        .increment(1);
        self.events.emit(SyncEvent::ErrorRecorded {
            tenant_id: stored.tenant_id,
            object_type: stored.object_type,
            error_id: stored.id,
            job_id: stored.job_id,
            error_code: stored.error_code.clone(),
            dead_letter: !retryable,
        });

        Ok(stored)
    }

    /// Resolves open errors for a record that has since synced successfully.
    pub async fn record_success(
        &self,
        ctx: &SyncContext,
        direction: SyncDirection,
        local_id: Option<&str>,
        external_id: Option<&str>,
    ) -> Result<(), EngineError> {
        let resolved = self
            .errors
            .resolve_for_record(
                ctx.tenant_id,
                ctx.object_type,
                direction,
                local_id,
                external_id,
                Utc::now(),
            )
            .await?;
        if resolved > 0 {
            debug!(
                tenant_id = %ctx.tenant_id,
                object_type = %ctx.object_type,
                resolved,
                "Resolved pending errors after successful sync"
            );
        }
        Ok(())
    }

    /// Run the sweep loop until the provided shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Starting retry sweep");
        let interval = TokioDuration::from_secs(self.config.sweep_interval_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Retry sweep shutdown requested");
                    break;
                }
                _ = sleep(interval) => {
                    let started = Instant::now();
                    if let Err(err) = self.sweep(Utc::now()).await {
                        error!(error = %err, error_code = err.code(), "Retry sweep failed");
                    }
                    histogram!("crm_sync_retry_sweep_duration_ms")
                        .record(started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Retry sweep stopped");
    }

    /// Re-attempts every due error that this sweeper manages to lease.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepStats, EngineError> {
        let mut stats = SweepStats::default();
        let due = self.errors.find_due(now, self.config.sweep_batch).await?;
        stats.due = due.len();

        let lease_until = now + Duration::seconds(self.config.claim_lease_seconds as i64);
        for error in due {
            if !self.errors.claim(&error, now, lease_until).await? {
                continue;
            }
            stats.claimed += 1;

            match self.attempt(&error).await {
                Ok(()) => {
                    self.errors.mark_resolved(error.id, Utc::now()).await?;
                    stats.resolved += 1;
                    counter!("crm_sync_retries_total", "outcome" => "resolved").increment(1);
                    info!(
                        error_id = %error.id,
                        tenant_id = %error.tenant_id,
                        retry_count = error.retry_count,
                        "Retry resolved sync error"
                    );
                }
                Err(EngineError::RateLimited { retry_after_secs }) => {
                    let delay = retry_after_secs
                        .map(|secs| Duration::seconds(secs as i64))
                        .unwrap_or_else(|| next_retry_delay(&self.config, error.retry_count));
                    self.errors
                        .reschedule(error.id, Utc::now() + delay, Utc::now())
                        .await?;
                    stats.rescheduled += 1;
                    counter!("crm_sync_retries_total", "outcome" => "rate_limited").increment(1);
                }
                Err(err) => {
                    if self.fail_attempt(&error, &err).await? {
                        stats.exhausted += 1;
                    } else {
                        stats.failed += 1;
                    }
                }
            }
        }

        if stats.claimed > 0 {
            debug!(
                due = stats.due,
                claimed = stats.claimed,
                resolved = stats.resolved,
                failed = stats.failed,
                exhausted = stats.exhausted,
                "Retry sweep completed"
            );
        }
        Ok(stats)
    }

    /// Records a failed attempt. Returns `true` when the error was dead-lettered.
    async fn fail_attempt(
        &self,
        error: &SyncErrorModel,
        err: &EngineError,
    ) -> Result<bool, EngineError> {
        let now = Utc::now();
        let retry_count = error.retry_count + 1;
        let exhausted = !err.is_retryable() || retry_count >= error.max_retries;

        let (status, next_retry_at) = if exhausted {
            (SyncErrorStatus::DeadLetter, None)
        } else {
            (
                SyncErrorStatus::PendingRetry,
                Some(now + next_retry_delay(&self.config, retry_count)),
            )
        };

        self.errors
            .record_attempt_failure(
                error.id,
                retry_count,
                status,
                next_retry_at,
                err.code(),
                &err.to_string(),
                now,
            )
            .await?;

        if exhausted {
            warn!(
                error_id = %error.id,
                tenant_id = %error.tenant_id,
                object_type = %error.object_type,
                retry_count,
                error_code = err.code(),
                "Sync error dead-lettered"
            );
            counter!("crm_sync_retries_total", "outcome" => "exhausted").increment(1);
            self.events.emit(SyncEvent::RetryExhausted {
                tenant_id: error.tenant_id,
                object_type: error.object_type,
                error_id: error.id,
                retry_count,
            });
        } else {
            counter!("crm_sync_retries_total", "outcome" => "failed").increment(1);
        }
        Ok(exhausted)
    }

    /// Re-runs exactly the failed record operation.
    async fn attempt(&self, error: &SyncErrorModel) -> Result<(), EngineError> {
        let config = self
            .configs
            .get(error.tenant_id, error.object_type)
            .await?
            .ok_or_else(|| EngineError::FieldMapping("sync config no longer exists".to_string()))?;
        let mapping = FieldMapping::from_json(&config.field_mappings)?;
        let ctx = SyncContext::new(error.tenant_id, error.object_type, error.job_id, mapping);

        match error.direction {
            SyncDirection::ToExternal => {
                let local_id = error.local_id.as_deref().ok_or_else(|| {
                    EngineError::MalformedPayload("push error without local id".to_string())
                })?;
                self.syncer.push_by_id(&ctx, local_id).await?;
            }
            SyncDirection::FromExternal => {
                let external_id = error.external_id.as_deref().ok_or_else(|| {
                    EngineError::MalformedPayload("pull error without external id".to_string())
                })?;
                self.syncer.pull_by_id(&ctx, external_id).await?;
            }
            SyncDirection::Bidirectional => {
                return Err(EngineError::MalformedPayload(
                    "record error must name a single direction".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Marks an error resolved by an operator. Works on dead letters too.
    pub async fn resolve_manually(&self, error_id: Uuid) -> Result<bool, EngineError> {
        Ok(self.errors.mark_resolved(error_id, Utc::now()).await?)
    }

    pub async fn list_unresolved(&self, tenant_id: Uuid) -> Result<Vec<SyncErrorModel>, EngineError> {
        Ok(self.errors.list_unresolved(tenant_id).await?)
    }

    pub async fn list_dead_letters(
        &self,
        tenant_id: Uuid,
    ) -> Result<Vec<SyncErrorModel>, EngineError> {
        Ok(self.errors.list_dead_letters(tenant_id).await?)
    }
}
