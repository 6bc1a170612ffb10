//! Worker pools consuming the job queues.
//!
//! A job that outlives the visibility window is abandoned and handed back to
//! the queue; the next delivery counts as a fresh attempt. Once a job has
//! been delivered more than `max_attempts` times its owning entity is moved
//! to a terminal state and the job is buried.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use voc_core::AppConfig;
use voc_db::{QueueError, QueueName};

use crate::jobs::{Job, JobContext, JobOutcome};

const IDLE_POLL: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    pub visibility: Duration,
    pub max_attempts: i32,
    pub retry_base: Duration,
    pub idle_poll: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            visibility: Duration::from_secs(300),
            max_attempts: 5,
            retry_base: Duration::from_secs(5),
            idle_poll: IDLE_POLL,
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            visibility: Duration::from_secs(config.job_visibility_secs.max(1)),
            max_attempts: config.job_max_attempts.max(1),
            ..Self::default()
        }
    }

    fn retry_delay(&self, attempts: i32) -> Duration {
        let exp = u32::try_from(attempts.saturating_sub(1).clamp(0, 10)).unwrap_or(0);
        self.retry_base.saturating_mul(1 << exp).min(MAX_RETRY_DELAY)
    }
}

/// What [`process_next`] did with the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    Empty,
    Acked,
    Retried,
    Buried,
}

/// Take one job from `queue` and run it.
///
/// # Errors
///
/// Returns [`QueueError`] only if the queue itself fails.
pub async fn process_next(
    ctx: &JobContext,
    queue: QueueName,
    config: &WorkerConfig,
) -> Result<Processed, QueueError> {
    let Some(delivery) = ctx.queue.dequeue(queue, config.visibility).await? else {
        return Ok(Processed::Empty);
    };

    let job = match Job::from_payload(&delivery.payload) {
        Ok(job) => job,
        Err(e) => {
            tracing::error!(job_id = delivery.id, %queue, error = %e, "worker: malformed job, burying");
            ctx.queue
                .bury(delivery.id, &format!("malformed payload: {e}"))
                .await?;
            return Ok(Processed::Buried);
        }
    };

    if delivery.attempts > config.max_attempts {
        let reason = format!("gave up after {} deliveries", config.max_attempts);
        if let Err(e) = ctx.exhausted(&job, &reason).await {
            tracing::error!(job_id = delivery.id, error = %e, "worker: failed to record exhausted job");
        }
        tracing::warn!(job_id = delivery.id, %queue, attempts = delivery.attempts, "worker: attempts exhausted, burying");
        ctx.queue.bury(delivery.id, &reason).await?;
        return Ok(Processed::Buried);
    }

    match tokio::time::timeout(config.visibility, ctx.handle(&job, Utc::now())).await {
        Ok(Ok(JobOutcome::Done)) => {
            ctx.queue.ack(delivery.id).await?;
            Ok(Processed::Acked)
        }
        Ok(Ok(JobOutcome::RetryAfter(delay))) => {
            ctx.queue.retry(delivery.id, delay, "deferred by handler").await?;
            Ok(Processed::Retried)
        }
        Ok(Err(e)) => {
            let delay = config.retry_delay(delivery.attempts);
            tracing::warn!(
                job_id = delivery.id,
                %queue,
                attempts = delivery.attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %e,
                "worker: job failed, will retry"
            );
            ctx.queue.retry(delivery.id, delay, &e.to_string()).await?;
            Ok(Processed::Retried)
        }
        Err(_) => {
            tracing::warn!(
                job_id = delivery.id,
                %queue,
                timeout_secs = config.visibility.as_secs(),
                "worker: job exceeded visibility window, abandoning"
            );
            ctx.queue
                .retry(delivery.id, Duration::ZERO, "visibility window exceeded")
                .await?;
            Ok(Processed::Retried)
        }
    }
}

/// Spawn `workers` tasks draining `queue` until `shutdown` flips to `true`.
#[must_use]
pub fn spawn_pool(
    ctx: Arc<JobContext>,
    queue: QueueName,
    workers: usize,
    config: WorkerConfig,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..workers.max(1))
        .map(|worker| {
            let ctx = Arc::clone(&ctx);
            let shutdown = shutdown.clone();
            tokio::spawn(run_worker(ctx, queue, worker, config, shutdown))
        })
        .collect()
}

async fn run_worker(
    ctx: Arc<JobContext>,
    queue: QueueName,
    worker: usize,
    config: WorkerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(%queue, worker, "worker: started");
    while !*shutdown.borrow() {
        let idle = match process_next(&ctx, queue, &config).await {
            Ok(Processed::Empty) => true,
            Ok(_) => false,
            Err(e) => {
                tracing::error!(%queue, worker, error = %e, "worker: queue error");
                true
            }
        };
        if idle {
            tokio::select! {
                () = tokio::time::sleep(config.idle_poll) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
    tracing::info!(%queue, worker, "worker: stopped");
}
