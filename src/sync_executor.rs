//! Sync Executor
//!
//! Background executor responsible for claiming due sync jobs, gathering the
//! change sets for the job's direction, resolving bidirectional conflicts and
//! driving each record through the [`RecordSyncer`].
//!
//! Record-level failures never change the job status; they are handed to the
//! [`RetryManager`]. Job-level failures (credentials, wall-clock timeout) end
//! the job `failed`. A rate-limit response pauses the job and schedules a
//! `resume` job in the same transaction.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use rand::{Rng, thread_rng};
use serde_json::{Value as JsonValue, json};
use tokio::sync::Semaphore;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{ExecutorConfig, RateLimitPolicyConfig};
use crate::credentials::CredentialStore;
use crate::crm::CrmRecord;
use crate::error::EngineError;
use crate::events::{SharedEventSink, SyncEvent};
use crate::field_mapping::FieldMapping;
use crate::identity::IdentityMapper;
use crate::local::LocalRecord;
use crate::models::SyncDirection;
use crate::models::sync_job::{JobStatus, JobTrigger, Model as SyncJobModel};
use crate::reconcile::{self, PlannedOp};
use crate::record_sync::{RecordOutcome, RecordSyncer, SyncContext};
use crate::repositories::sync_job::JobCounts;
use crate::repositories::{SyncConfigRepository, SyncJobRepository};
use crate::retry::{RecordFailure, RetryManager};

/// Records processed between two checks of the config's suspension flag.
const SUSPEND_CHECK_INTERVAL: usize = 20;

/// How a job run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub counts: JobCounts,
    /// Set when the job failed
    pub error_code: Option<&'static str>,
    /// Continuation scheduled for a rate-limited job
    pub resume_job_id: Option<Uuid>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    pub reaped: usize,
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub paused: usize,
}

/// Where processing stopped, for jobs that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Finished { conflicts: usize },
    Suspended,
    RateLimited { retry_after_secs: Option<u64> },
}

/// Delay before a rate-limited job resumes.
///
/// `base * 2^attempt` capped at `max`, plus up to `jitter_factor` of that as
/// jitter, and never shorter than the CRM's Retry-After hint.
pub fn rate_limit_delay(
    policy: &RateLimitPolicyConfig,
    retry_after_secs: Option<u64>,
    attempt: i32,
) -> Duration {
    let base = policy.base_seconds as f64;
    let max = policy.max_seconds as f64;
    let backoff = (base * 2_f64.powi(attempt.clamp(0, 30))).min(max);

    let jitter_span = policy.jitter_factor.clamp(0.0, 1.0) * backoff;
    let jitter = if jitter_span > 0.0 {
        thread_rng().gen_range(0.0..jitter_span)
    } else {
        0.0
    };

    let seconds = (backoff + jitter).max(retry_after_secs.unwrap_or(0) as f64);
    Duration::from_secs_f64(seconds)
}

/// Sync executor responsible for running background sync jobs
pub struct SyncExecutor {
    jobs: SyncJobRepository,
    configs: SyncConfigRepository,
    credentials: Arc<CredentialStore>,
    identity: Arc<IdentityMapper>,
    syncer: Arc<RecordSyncer>,
    retry: Arc<RetryManager>,
    events: SharedEventSink,
    config: ExecutorConfig,
    rate_limit_policy: RateLimitPolicyConfig,
}

impl SyncExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: SyncJobRepository,
        configs: SyncConfigRepository,
        credentials: Arc<CredentialStore>,
        identity: Arc<IdentityMapper>,
        syncer: Arc<RecordSyncer>,
        retry: Arc<RetryManager>,
        events: SharedEventSink,
        config: ExecutorConfig,
        rate_limit_policy: RateLimitPolicyConfig,
    ) -> Self {
        Self {
            jobs,
            configs,
            credentials,
            identity,
            syncer,
            retry,
            events,
            config,
            rate_limit_policy,
        }
    }

    /// Get the executor configuration
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run the executor loop until the provided shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(config = ?self.config, "Starting sync executor");
        let tick_duration = Duration::from_millis(self.config.tick_ms);

        loop {
            let start = Instant::now();

            match self.clone().tick(Utc::now()).await {
                Ok(stats) => {
                    if stats.claimed > 0 || stats.reaped > 0 {
                        debug!(
                            claimed = stats.claimed,
                            completed = stats.completed,
                            failed = stats.failed,
                            paused = stats.paused,
                            reaped = stats.reaped,
                            "Executor tick finished"
                        );
                    }
                }
                Err(err) => {
                    error!(error = %err, error_code = err.code(), "Executor tick failed");
                }
            }

            // Sleep for remaining tick time
            let remaining = tick_duration.saturating_sub(start.elapsed());
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Sync executor shutdown requested");
                    break;
                }
                _ = sleep(remaining) => {}
            }
        }

        info!("Sync executor stopped");
    }

    /// Reaps overdue jobs, then claims and runs due jobs with bounded concurrency.
    pub async fn tick(self: Arc<Self>, now: DateTime<Utc>) -> Result<TickStats, EngineError> {
        let mut stats = TickStats {
            reaped: self.reap_stale(now).await?,
            ..TickStats::default()
        };

        let candidates = self
            .jobs
            .find_claimable(now, self.config.claim_batch)
            .await?;
        if candidates.is_empty() {
            return Ok(stats);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut handles = Vec::new();
        for candidate in candidates {
            // A job is only claimed once it can start; its run clock begins at the claim.
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let Some(job) = self.jobs.claim(candidate.id, Utc::now()).await? else {
                debug!(job_id = %candidate.id, "Job claimed by another worker");
                continue;
            };
            stats.claimed += 1;

            let executor = self.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                executor.execute(job).await
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(Ok(report)) => match report.status {
                    JobStatus::Completed => stats.completed += 1,
                    JobStatus::Failed => stats.failed += 1,
                    JobStatus::Paused => stats.paused += 1,
                    JobStatus::Pending | JobStatus::Running => {}
                },
                Ok(Err(err)) => {
                    stats.failed += 1;
                    error!(error = %err, "Error finalizing sync job");
                }
                Err(join_err) => {
                    stats.failed += 1;
                    error!(error = %join_err, "Sync job task panicked");
                }
            }
        }

        Ok(stats)
    }

    /// Fails `running` jobs that outlived `max_run_seconds`, e.g. after a worker crash.
    async fn reap_stale(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let cutoff = now - chrono::Duration::seconds(self.config.max_run_seconds as i64);
        let stale = self.jobs.find_stale_running(cutoff).await?;

        let mut reaped = 0;
        for job in stale {
            let message = format!("job exceeded {}s and was reaped", self.config.max_run_seconds);
            let metadata = merge_metadata(
                &job.metadata,
                json!({ "error_code": "timeout", "message": message }),
            );
            if self
                .jobs
                .finish(job.id, JobStatus::Failed, JobCounts::default(), metadata, now)
                .await?
            {
                reaped += 1;
                warn!(job_id = %job.id, tenant_id = %job.tenant_id, "Reaped stale running job");
                counter!("sync_executor_jobs_total", "status" => "failed").increment(1);
                self.events.emit(SyncEvent::JobFailed {
                    tenant_id: job.tenant_id,
                    object_type: job.object_type,
                    job_id: job.id,
                    error_code: "timeout".to_string(),
                    message,
                });
            }
        }
        Ok(reaped)
    }

    /// Runs a claimed (`running`) job to a terminal status.
    #[instrument(skip(self, job), fields(job_id = %job.id, tenant_id = %job.tenant_id, object_type = %job.object_type))]
    pub async fn execute(&self, job: SyncJobModel) -> Result<JobReport, EngineError> {
        let timer = Instant::now();
        let started_at = job
            .started_at
            .map(|at| at.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        info!(direction = job.direction.as_str(), trigger = job.trigger.as_str(), "Starting sync job");
        self.events.emit(SyncEvent::JobStarted {
            tenant_id: job.tenant_id,
            object_type: job.object_type,
            job_id: job.id,
            direction: job.direction,
        });

        let mut counts = JobCounts::default();
        let result = tokio::time::timeout(
            Duration::from_secs(self.config.max_run_seconds),
            self.process(&job, &mut counts),
        )
        .await
        .unwrap_or_else(|_| {
            Err(EngineError::Timeout(format!(
                "job exceeded {}s",
                self.config.max_run_seconds
            )))
        });

        let report = match result {
            Ok(Flow::Finished { conflicts }) => {
                self.complete(&job, counts, conflicts, started_at).await?
            }
            Ok(Flow::Suspended) => self.pause_suspended(&job, counts).await?,
            Ok(Flow::RateLimited { retry_after_secs }) => {
                self.pause_rate_limited(&job, counts, retry_after_secs).await?
            }
            Err(err) => self.fail(&job, counts, &err).await?,
        };

        let status_label = match report.status {
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Paused => "paused",
            JobStatus::Pending | JobStatus::Running => "unknown",
        };
        counter!("sync_executor_jobs_total", "status" => status_label).increment(1);
        histogram!("sync_executor_job_duration_ms", "status" => status_label)
            .record(timer.elapsed().as_secs_f64() * 1_000.0);

        Ok(report)
    }

    async fn process(&self, job: &SyncJobModel, counts: &mut JobCounts) -> Result<Flow, EngineError> {
        let config = self
            .configs
            .get(job.tenant_id, job.object_type)
            .await?
            .ok_or_else(|| EngineError::FieldMapping("sync config no longer exists".to_string()))?;
        let mapping = FieldMapping::from_json(&config.field_mappings)?;
        let ctx = SyncContext::new(job.tenant_id, job.object_type, Some(job.id), mapping);

        // Fails fast without an active connection or a refreshable token.
        self.credentials.valid_access_token(job.tenant_id).await?;

        let since = config.last_run_at.map(|at| at.with_timezone(&Utc));

        let local_changes = if job.direction.pushes() {
            self.syncer
                .local()
                .fetch_changed(job.tenant_id, job.object_type, since)
                .await?
        } else {
            Vec::new()
        };

        let external_changes = if job.direction.pulls() {
            match self.fetch_external_changes(&ctx, since).await {
                Ok(records) => records,
                Err(EngineError::RateLimited { retry_after_secs }) => {
                    return Ok(Flow::RateLimited { retry_after_secs });
                }
                Err(err) => return Err(err),
            }
        } else {
            Vec::new()
        };

        let mapped = if job.direction == SyncDirection::Bidirectional && !external_changes.is_empty() {
            self.live_mappings(&ctx, &local_changes).await?
        } else {
            Default::default()
        };

        let plan = reconcile::plan(local_changes, external_changes, &mapped);
        debug!(
            operations = plan.ops.len(),
            conflicts = plan.conflicts,
            "Change sets reconciled"
        );

        for (index, op) in plan.ops.iter().enumerate() {
            if index % SUSPEND_CHECK_INTERVAL == 0
                && self.configs.is_suspended(job.tenant_id, job.object_type).await?
            {
                info!(processed = counts.processed, "Sync config suspended; pausing job");
                return Ok(Flow::Suspended);
            }

            match self.sync_op(&ctx, op).await {
                Ok(_) => {
                    counts.processed += 1;
                    counts.succeeded += 1;
                    let (direction, local_id, external_id) = op_identity(op);
                    self.retry
                        .record_success(&ctx, direction, local_id, external_id)
                        .await?;
                }
                Err(EngineError::RateLimited { retry_after_secs }) => {
                    info!(
                        processed = counts.processed,
                        remaining = plan.ops.len() - index,
                        "CRM rate limit reached; pausing job"
                    );
                    return Ok(Flow::RateLimited { retry_after_secs });
                }
                Err(err) if err.is_job_fatal() => return Err(err),
                Err(err) => {
                    counts.processed += 1;
                    counts.failed += 1;
                    let (direction, local_id, external_id) = op_identity(op);
                    self.retry
                        .record_failure(RecordFailure {
                            tenant_id: job.tenant_id,
                            job_id: Some(job.id),
                            object_type: job.object_type,
                            direction,
                            local_id: local_id.map(str::to_string),
                            external_id: external_id.map(str::to_string),
                            error: &err,
                        })
                        .await?;
                }
            }
        }

        Ok(Flow::Finished {
            conflicts: plan.conflicts,
        })
    }

    /// One record operation with up to `inline_retries` immediate retries
    /// for retryable failures.
    async fn sync_op(&self, ctx: &SyncContext, op: &PlannedOp) -> Result<RecordOutcome, EngineError> {
        let mut attempt = 0;
        loop {
            let result = match op {
                PlannedOp::Push(record) => self.syncer.push(ctx, record).await,
                PlannedOp::Pull(record) => self.syncer.pull(ctx, record).await,
            };
            match result {
                Err(err)
                    if attempt < self.config.inline_retries
                        && err.is_retryable()
                        && !err.is_job_fatal()
                        && !matches!(err, EngineError::RateLimited { .. }) =>
                {
                    attempt += 1;
                    debug!(attempt, error_code = err.code(), "Retrying record inline");
                }
                other => return other,
            }
        }
    }

    async fn fetch_external_changes(
        &self,
        ctx: &SyncContext,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CrmRecord>, EngineError> {
        let crm = self.syncer.crm().clone();
        let object_type = ctx.object_type;
        let properties = ctx.properties.clone();
        self.syncer
            .call_crm(ctx.tenant_id, |token| {
                let crm = crm.clone();
                let properties = properties.clone();
                async move {
                    crm.fetch_changed(&token, object_type, since, &properties)
                        .await
                }
            })
            .await
    }

    /// Live local-to-external pairs for the local change set.
    async fn live_mappings(
        &self,
        ctx: &SyncContext,
        local_changes: &[LocalRecord],
    ) -> Result<std::collections::HashMap<String, String>, EngineError> {
        let mut mapped = std::collections::HashMap::new();
        for record in local_changes {
            if let Some(external_id) = self
                .identity
                .resolve(ctx.tenant_id, ctx.object_type, &record.id)
                .await?
            {
                mapped.insert(record.id.clone(), external_id);
            }
        }
        Ok(mapped)
    }

    async fn complete(
        &self,
        job: &SyncJobModel,
        counts: JobCounts,
        conflicts: usize,
        started_at: DateTime<Utc>,
    ) -> Result<JobReport, EngineError> {
        let now = Utc::now();
        let metadata = merge_metadata(&job.metadata, json!({ "conflicts": conflicts }));
        if !self
            .jobs
            .finish(job.id, JobStatus::Completed, counts, metadata, now)
            .await?
        {
            warn!(job_id = %job.id, "Job was no longer running at completion");
            return Ok(self.report(job, JobStatus::Failed, counts, Some("timeout"), None));
        }

        self.configs
            .advance_last_run(job.tenant_id, job.object_type, started_at)
            .await?;
        self.credentials.touch_last_sync(job.tenant_id, now).await?;

        info!(
            processed = counts.processed,
            succeeded = counts.succeeded,
            failed = counts.failed,
            conflicts,
            "Sync job completed"
        );
        self.events.emit(SyncEvent::JobCompleted {
            tenant_id: job.tenant_id,
            object_type: job.object_type,
            job_id: job.id,
            processed: counts.processed,
            succeeded: counts.succeeded,
            failed: counts.failed,
        });
        Ok(self.report(job, JobStatus::Completed, counts, None, None))
    }

    async fn pause_suspended(
        &self,
        job: &SyncJobModel,
        counts: JobCounts,
    ) -> Result<JobReport, EngineError> {
        let metadata = merge_metadata(&job.metadata, json!({ "reason": "suspended" }));
        self.jobs
            .finish(job.id, JobStatus::Paused, counts, metadata, Utc::now())
            .await?;
        self.events.emit(SyncEvent::JobPaused {
            tenant_id: job.tenant_id,
            object_type: job.object_type,
            job_id: job.id,
            reason: "suspended".to_string(),
            resume_job_id: None,
        });
        Ok(self.report(job, JobStatus::Paused, counts, None, None))
    }

    async fn pause_rate_limited(
        &self,
        job: &SyncJobModel,
        counts: JobCounts,
        retry_after_secs: Option<u64>,
    ) -> Result<JobReport, EngineError> {
        let attempt = if job.trigger == JobTrigger::Resume {
            job.metadata
                .get("rate_limit_attempt")
                .and_then(JsonValue::as_i64)
                .unwrap_or(0) as i32
                + 1
        } else {
            0
        };
        let delay = rate_limit_delay(&self.rate_limit_policy, retry_after_secs, attempt);
        let now = Utc::now();
        let resume_at = now + chrono::Duration::milliseconds(delay.as_millis() as i64);

        let metadata = merge_metadata(
            &job.metadata,
            json!({
                "reason": "rate_limited",
                "retry_after_secs": retry_after_secs,
                "resume_at": resume_at.to_rfc3339(),
            }),
        );
        let resume_metadata = json!({
            "resumes_job_id": job.id,
            "rate_limit_attempt": attempt,
        });

        let resume = self
            .jobs
            .pause_with_resume(job, counts, metadata, resume_at, resume_metadata, now)
            .await?;
        let resume_job_id = resume.map(|r| r.id);

        counter!("rate_limited_total", "object_type" => job.object_type.as_str()).increment(1);
        histogram!("rate_limited_backoff_seconds").record(delay.as_secs_f64());
        warn!(
            attempt,
            backoff_seconds = delay.as_secs_f64(),
            resume_job_id = ?resume_job_id,
            "Sync job rate limited; resume scheduled"
        );
        self.events.emit(SyncEvent::JobPaused {
            tenant_id: job.tenant_id,
            object_type: job.object_type,
            job_id: job.id,
            reason: "rate_limited".to_string(),
            resume_job_id,
        });
        Ok(self.report(job, JobStatus::Paused, counts, None, resume_job_id))
    }

    async fn fail(
        &self,
        job: &SyncJobModel,
        counts: JobCounts,
        err: &EngineError,
    ) -> Result<JobReport, EngineError> {
        let metadata = merge_metadata(
            &job.metadata,
            json!({ "error_code": err.code(), "message": err.to_string() }),
        );
        self.jobs
            .finish(job.id, JobStatus::Failed, counts, metadata, Utc::now())
            .await?;

        warn!(error_code = err.code(), error = %err, "Sync job failed");
        self.events.emit(SyncEvent::JobFailed {
            tenant_id: job.tenant_id,
            object_type: job.object_type,
            job_id: job.id,
            error_code: err.code().to_string(),
            message: err.to_string(),
        });
        Ok(self.report(job, JobStatus::Failed, counts, Some(err.code()), None))
    }

    fn report(
        &self,
        job: &SyncJobModel,
        status: JobStatus,
        counts: JobCounts,
        error_code: Option<&'static str>,
        resume_job_id: Option<Uuid>,
    ) -> JobReport {
        JobReport {
            job_id: job.id,
            status,
            counts,
            error_code,
            resume_job_id,
        }
    }
}

/// Direction and identifiers of the record touched by an operation.
fn op_identity(op: &PlannedOp) -> (SyncDirection, Option<&str>, Option<&str>) {
    match op {
        PlannedOp::Push(record) => (SyncDirection::ToExternal, Some(record.id.as_str()), None),
        PlannedOp::Pull(record) => (SyncDirection::FromExternal, None, Some(record.id.as_str())),
    }
}

fn merge_metadata(existing: &JsonValue, extra: JsonValue) -> JsonValue {
    let mut merged = existing.as_object().cloned().unwrap_or_default();
    if let JsonValue::Object(extra) = extra {
        merged.extend(extra);
    }
    JsonValue::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter_factor: f64) -> RateLimitPolicyConfig {
        RateLimitPolicyConfig {
            base_seconds: 5,
            max_seconds: 900,
            jitter_factor,
        }
    }

    #[test]
    fn test_rate_limit_delay_doubles_without_jitter() {
        let policy = policy(0.0);
        let delays: Vec<u64> = (0..4)
            .map(|attempt| rate_limit_delay(&policy, None, attempt).as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40]);
    }

    #[test]
    fn test_rate_limit_delay_retry_after_precedence() {
        let policy = policy(0.0);
        assert_eq!(rate_limit_delay(&policy, Some(120), 0).as_secs(), 120);
        // Backoff larger than the hint wins.
        assert_eq!(rate_limit_delay(&policy, Some(2), 3).as_secs(), 40);
    }

    #[test]
    fn test_rate_limit_delay_max_capping() {
        let policy = policy(0.0);
        assert_eq!(rate_limit_delay(&policy, None, 20).as_secs(), 900);
        assert_eq!(rate_limit_delay(&policy, None, i32::MAX).as_secs(), 900);
    }

    #[test]
    fn test_rate_limit_delay_jitter_bounds() {
        let policy = policy(0.1);
        for _ in 0..50 {
            let delay = rate_limit_delay(&policy, None, 2).as_secs_f64();
            assert!((20.0..22.0).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_merge_metadata_keeps_existing_keys() {
        let merged = merge_metadata(
            &json!({ "reason": "cadence" }),
            json!({ "conflicts": 2 }),
        );
        assert_eq!(merged, json!({ "reason": "cadence", "conflicts": 2 }));

        let from_null = merge_metadata(&JsonValue::Null, json!({ "conflicts": 0 }));
        assert_eq!(from_null, json!({ "conflicts": 0 }));
    }
}
