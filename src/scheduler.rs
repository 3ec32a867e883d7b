//! # Sync Scheduler
//!
//! Background task that walks enabled sync configs and enqueues a job for
//! every (tenant, object type) whose cadence has elapsed or that has
//! outstanding webhook demand. The single-flight index on `sync_jobs` makes
//! enqueueing idempotent, so multiple scheduler instances may run safely.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, gauge, histogram};
use serde_json::json;
use tokio::time::{Duration as TokioDuration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::config::SchedulerConfig;
use crate::error::EngineError;
use crate::models::sync_config::Model as SyncConfigModel;
use crate::models::sync_job::JobTrigger;
use crate::repositories::sync_job::{EnqueueOutcome, NewJob};
use crate::repositories::{ConnectionRepository, SyncConfigRepository, SyncJobRepository};

/// Background scheduler service.
pub struct SyncScheduler {
    configs: SyncConfigRepository,
    jobs: SyncJobRepository,
    connections: ConnectionRepository,
    config: SchedulerConfig,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    pub configs_polled: u64,
    pub jobs_enqueued: u64,
    pub skipped_pending: u64,
    pub skipped_not_due: u64,
    pub skipped_suspended: u64,
    pub skipped_no_connection: u64,
    pub errors: u64,
}

/// Why a config is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueReason {
    FirstRun,
    Cadence,
    Demand,
}

impl DueReason {
    fn as_str(self) -> &'static str {
        match self {
            DueReason::FirstRun => "first_run",
            DueReason::Cadence => "cadence",
            DueReason::Demand => "demand",
        }
    }

    fn trigger(self) -> JobTrigger {
        match self {
            DueReason::Demand => JobTrigger::Webhook,
            DueReason::FirstRun | DueReason::Cadence => JobTrigger::Schedule,
        }
    }
}

/// `Some` when a config with this state should get a job at `now`.
pub fn due_reason(
    last_run_at: Option<DateTime<Utc>>,
    cadence_minutes: i32,
    demand_requested_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DueReason> {
    if demand_requested_at.is_some() {
        return Some(DueReason::Demand);
    }

    let cadence = Duration::minutes(i64::from(cadence_minutes.max(1)));
    match last_run_at {
        None => Some(DueReason::FirstRun),
        Some(last) if now - last >= cadence => Some(DueReason::Cadence),
        Some(_) => None,
    }
}

impl SyncScheduler {
    pub fn new(
        configs: SyncConfigRepository,
        jobs: SyncJobRepository,
        connections: ConnectionRepository,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            configs,
            jobs,
            connections,
            config,
        }
    }

    /// Run the scheduler loop until the provided shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Starting sync scheduler");
        let tick_interval = TokioDuration::from_secs(self.config.tick_interval_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Sync scheduler shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = Instant::now();
                    if let Err(err) = self.tick(Utc::now()).await {
                        error!(error = %err, error_code = err.code(), "Scheduler tick failed");
                    }
                    histogram!("sync_scheduler_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    /// Evaluates every enabled config once, `batch_size` configs per page.
    /// A failure on one config is logged and does not stop the others.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickStats, EngineError> {
        let mut stats = TickStats::default();
        let page_size = self.config.batch_size.max(1);
        let mut after = None;

        loop {
            let page = self.configs.list_enabled(after, page_size).await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id);
            let full = page.len() as u64 == page_size;

            for config in &page {
                stats.configs_polled += 1;
                if let Err(err) = self.process_config(config, now, &mut stats).await {
                    stats.errors += 1;
                    error!(
                        error = %err,
                        error_code = err.code(),
                        tenant_id = %config.tenant_id,
                        object_type = %config.object_type,
                        "Failed to schedule sync config"
                    );
                }
            }

            if !full {
                break;
            }
        }

        gauge!("sync_scheduler_configs_polled").set(stats.configs_polled as f64);
        debug!(
            polled = stats.configs_polled,
            enqueued = stats.jobs_enqueued,
            skipped_pending = stats.skipped_pending,
            skipped_not_due = stats.skipped_not_due,
            skipped_suspended = stats.skipped_suspended,
            skipped_no_connection = stats.skipped_no_connection,
            errors = stats.errors,
            "Scheduler tick completed"
        );
        Ok(stats)
    }

    async fn process_config(
        &self,
        config: &SyncConfigModel,
        now: DateTime<Utc>,
        stats: &mut TickStats,
    ) -> Result<(), EngineError> {
        if config.suspended_at.is_some() {
            stats.skipped_suspended += 1;
            return Ok(());
        }

        let Some(reason) = due_reason(
            config.last_run_at.map(|t| t.with_timezone(&Utc)),
            config.cadence_minutes,
            config.demand_requested_at.map(|t| t.with_timezone(&Utc)),
            now,
        ) else {
            stats.skipped_not_due += 1;
            return Ok(());
        };

        if self.connections.find_active(config.tenant_id).await?.is_none() {
            stats.skipped_no_connection += 1;
            debug!(
                tenant_id = %config.tenant_id,
                object_type = %config.object_type,
                "Skipping scheduling; tenant has no active connection"
            );
            return Ok(());
        }

        if self
            .jobs
            .has_inflight(config.tenant_id, config.object_type)
            .await?
        {
            stats.skipped_pending += 1;
            return Ok(());
        }

        let outcome = self
            .jobs
            .enqueue(NewJob {
                tenant_id: config.tenant_id,
                object_type: config.object_type,
                direction: config.direction,
                trigger: reason.trigger(),
                scheduled_at: now,
                metadata: json!({ "reason": reason.as_str() }),
            })
            .await?;

        match outcome {
            EnqueueOutcome::Enqueued(job) => {
                stats.jobs_enqueued += 1;
                if reason == DueReason::Demand {
                    self.configs
                        .clear_demand(config.tenant_id, config.object_type, now)
                        .await?;
                }
                counter!(
                    "sync_scheduler_jobs_scheduled_total",
                    "object_type" => config.object_type.as_str(),
                    "reason" => reason.as_str()
                )
                .increment(1);
                info!(
                    tenant_id = %config.tenant_id,
                    object_type = %config.object_type,
                    job_id = %job.id,
                    reason = reason.as_str(),
                    "Scheduled sync job"
                );
            }
            EnqueueOutcome::AlreadyPending => {
                stats.skipped_pending += 1;
                debug!(
                    tenant_id = %config.tenant_id,
                    object_type = %config.object_type,
                    "Job already pending; skipping enqueue"
                );
            }
        }

        Ok(())
    }
}
