//! Recurring jobs.
//!
//! The cron jobs only decide *when* work happens: each one enqueues jobs or
//! runs a cheap bookkeeping pass, and the worker pools do the rest.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use voc_pipeline::{CrawlScheduler, JobContext};

const CRAWL_TICK_CRON: &str = "0 * * * * *";
const PENDING_SWEEP_CRON: &str = "30 */5 * * * *";
const FAILED_RESET_CRON: &str = "0 0 3 * * *";
const SWEEP_LIMIT: i64 = 500;

/// Builds and starts the cron scheduler.
///
/// The returned handle must be kept alive for the lifetime of the process;
/// dropping it stops every job.
///
/// # Errors
///
/// Returns [`JobSchedulerError`] if the scheduler cannot be created, a cron
/// expression is rejected, or the scheduler fails to start.
pub async fn build_scheduler(
    crawls: Arc<CrawlScheduler>,
    ctx: Arc<JobContext>,
    alert_eval_cron: &str,
    sweep_idle: Duration,
) -> Result<JobScheduler, JobSchedulerError> {
    let scheduler = JobScheduler::new().await?;

    register_crawl_tick(&scheduler, crawls).await?;
    register_pending_sweep(&scheduler, Arc::clone(&ctx), sweep_idle).await?;
    register_failed_reset(&scheduler, Arc::clone(&ctx)).await?;
    register_alert_evaluation(&scheduler, ctx, alert_eval_cron).await?;

    scheduler.start().await?;
    Ok(scheduler)
}

/// Enqueue crawls for due sources, once a minute.
async fn register_crawl_tick(
    scheduler: &JobScheduler,
    crawls: Arc<CrawlScheduler>,
) -> Result<(), JobSchedulerError> {
    let job = Job::new_async(CRAWL_TICK_CRON, move |_uuid, _lock| {
        let crawls = Arc::clone(&crawls);
        Box::pin(async move {
            if let Err(e) = crawls.tick(Utc::now()).await {
                tracing::error!(error = %e, "scheduler: crawl tick failed");
            }
        })
    })?;
    scheduler.add(job).await?;
    Ok(())
}

/// Re-enqueue extraction for pending feedback idle for longer than
/// `sweep_idle`.
async fn register_pending_sweep(
    scheduler: &JobScheduler,
    ctx: Arc<JobContext>,
    sweep_idle: Duration,
) -> Result<(), JobSchedulerError> {
    let job = Job::new_async(PENDING_SWEEP_CRON, move |_uuid, _lock| {
        let ctx = Arc::clone(&ctx);
        Box::pin(async move {
            if let Err(e) = ctx.sweep_pending(Utc::now() - sweep_idle, SWEEP_LIMIT).await {
                tracing::error!(error = %e, "scheduler: pending feedback sweep failed");
            }
        })
    })?;
    scheduler.add(job).await?;
    Ok(())
}

/// Give failed extractions a fresh budget nightly; the sweep picks them up.
async fn register_failed_reset(
    scheduler: &JobScheduler,
    ctx: Arc<JobContext>,
) -> Result<(), JobSchedulerError> {
    let job = Job::new_async(FAILED_RESET_CRON, move |_uuid, _lock| {
        let ctx = Arc::clone(&ctx);
        Box::pin(async move {
            match ctx.extractor.retry_failed_extractions(SWEEP_LIMIT).await {
                Ok(ids) => tracing::info!(count = ids.len(), "scheduler: failed extractions reset"),
                Err(e) => tracing::error!(error = %e, "scheduler: failed extraction reset failed"),
            }
        })
    })?;
    scheduler.add(job).await?;
    Ok(())
}

async fn register_alert_evaluation(
    scheduler: &JobScheduler,
    ctx: Arc<JobContext>,
    cron: &str,
) -> Result<(), JobSchedulerError> {
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let ctx = Arc::clone(&ctx);
        Box::pin(async move {
            if let Err(e) = ctx.schedule_alert_evaluation().await {
                tracing::error!(error = %e, "scheduler: failed to enqueue alert evaluation");
            }
        })
    })?;
    scheduler.add(job).await?;
    Ok(())
}
