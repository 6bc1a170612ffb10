//! Crawl scheduling.
//!
//! A crawl run row in `pending` or `running` state is the per-source lock:
//! [`Store::claim_crawl_run`] only inserts one when the source has none. A
//! claim whose job cannot be enqueued is released again, so a failed tick
//! never leaves a source locked.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use voc_core::{AppConfig, CrawlRun, PipelineStats, Source};
use voc_db::{DbError, JobQueue, QueueName, Store};

use crate::error::SchedulerError;
use crate::jobs::Job;

const STALE_RUN_REASON: &str = "abandoned: crawl run exceeded its time limit";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    /// Maximum outstanding crawl runs across all sources.
    pub concurrency: usize,
    /// Outstanding runs older than this are failed by the next tick.
    pub run_ttl: chrono::Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            run_ttl: chrono::Duration::hours(1),
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            concurrency: config.crawl_concurrency.max(1),
            run_ttl: chrono::Duration::seconds(
                i64::try_from(config.crawl_run_ttl_secs).unwrap_or(i64::MAX / 1_000),
            ),
        }
    }
}

/// What one [`CrawlScheduler::tick`] did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    /// Stale runs failed before scheduling.
    pub reaped: u64,
    /// Active sources whose cadence had elapsed.
    pub due: usize,
    /// Runs created and enqueued.
    pub enqueued: Vec<CrawlRun>,
    /// Due sources that already had an outstanding run.
    pub locked: usize,
    /// Due sources left for a later tick by the global cap.
    pub deferred: usize,
    /// Due sources whose job could not be enqueued.
    pub failed: usize,
}

/// Result of a manual crawl request.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggeredCrawl {
    pub run: CrawlRun,
    /// `true` when an outstanding run was returned instead of a new one.
    pub already_outstanding: bool,
}

pub struct CrawlScheduler {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    config: SchedulerConfig,
}

impl CrawlScheduler {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn JobQueue>, config: SchedulerConfig) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    /// Enqueue one crawl for every due source that is not already being
    /// crawled, up to the global cap.
    ///
    /// Safe to call concurrently and repeatedly: a source never gets a
    /// second outstanding run.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Store`] if the sources cannot be listed.
    /// Per-source enqueue failures are counted in [`TickReport::failed`].
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, SchedulerError> {
        let mut report = TickReport {
            reaped: self
                .store
                .fail_stale_crawl_runs(now - self.config.run_ttl, STALE_RUN_REASON)
                .await?,
            ..TickReport::default()
        };
        if report.reaped > 0 {
            tracing::warn!(reaped = report.reaped, "scheduler: failed stale crawl runs");
        }

        let mut due: Vec<Source> = self
            .store
            .list_active_sources()
            .await?
            .into_iter()
            .filter(|s| s.is_due(now))
            .collect();
        due.sort_by_key(|s| (s.last_run_at, s.id));
        report.due = due.len();

        let outstanding = usize::try_from(self.store.count_outstanding_crawl_runs().await?).unwrap_or(0);
        let mut capacity = self.config.concurrency.saturating_sub(outstanding);

        for source in &due {
            if capacity == 0 {
                report.deferred += 1;
                continue;
            }
            match self.enqueue_for(source, None, now).await {
                Ok(Some(run)) => {
                    capacity -= 1;
                    report.enqueued.push(run);
                }
                Ok(None) => report.locked += 1,
                Err(e) => {
                    tracing::error!(source_id = source.id, error = %e, "scheduler: failed to enqueue crawl");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            due = report.due,
            enqueued = report.enqueued.len(),
            locked = report.locked,
            deferred = report.deferred,
            failed = report.failed,
            "scheduler: tick complete"
        );
        Ok(report)
    }

    /// Crawl `source_id` now, regardless of cadence.
    ///
    /// When the source already has an outstanding run, that run is returned.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::SourceInactive`] for an inactive source,
    /// [`SchedulerError::InvalidConfig`] when the override does not apply to
    /// the source's platform, and store or queue errors otherwise.
    pub async fn trigger_crawl(
        &self,
        source_id: i64,
        query_override: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TriggeredCrawl, SchedulerError> {
        let source = self.store.get_source(source_id).await?;
        if !source.is_active {
            return Err(SchedulerError::SourceInactive(source_id));
        }
        let query_override = query_override.map(str::trim).filter(|q| !q.is_empty());
        if let Some(query) = query_override {
            source.config.with_query_override(query)?;
        }

        if let Some(run) = self.enqueue_for(&source, query_override, now).await? {
            tracing::info!(source_id, run_id = run.id, "scheduler: manual crawl enqueued");
            return Ok(TriggeredCrawl {
                run,
                already_outstanding: false,
            });
        }
        let run = self
            .store
            .outstanding_crawl_run(source_id)
            .await?
            .ok_or(DbError::NotFound)?;
        Ok(TriggeredCrawl {
            run,
            already_outstanding: true,
        })
    }

    /// Recent runs, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Store`] if the query fails.
    pub async fn crawl_status(
        &self,
        source_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<CrawlRun>, SchedulerError> {
        Ok(self.store.list_crawl_runs(source_id, limit.clamp(1, 500)).await?)
    }

    /// # Errors
    ///
    /// Returns [`SchedulerError::Store`] if the query fails.
    pub async fn pipeline_stats(&self) -> Result<PipelineStats, SchedulerError> {
        Ok(self.store.pipeline_stats().await?)
    }

    async fn enqueue_for(
        &self,
        source: &Source,
        query_override: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<CrawlRun>, SchedulerError> {
        let Some(run) = self.store.claim_crawl_run(source.id, query_override).await? else {
            tracing::debug!(source_id = source.id, "scheduler: source already has an outstanding run");
            return Ok(None);
        };

        let payload = Job::Crawl {
            crawl_run_id: run.id,
        }
        .to_payload()?;
        if let Err(e) = self
            .queue
            .enqueue(QueueName::Crawl, payload, Duration::ZERO)
            .await
        {
            if let Err(release) = self.store.release_crawl_run(run.id).await {
                tracing::error!(
                    run_id = run.id,
                    error = %release,
                    "scheduler: failed to release claim after enqueue failure"
                );
            }
            return Err(e.into());
        }

        self.store.mark_source_run(source.id, now).await?;
        tracing::debug!(source_id = source.id, run_id = run.id, "scheduler: crawl enqueued");
        Ok(Some(run))
    }
}

#[cfg(test)]
mod tests {
    use voc_core::{CrawlStatus, NewSource, RedditConfig, RedditSort, RedditTimeFilter, SourceConfig};
    use voc_db::{MemoryJobQueue, MemoryStore};

    use super::*;

    fn reddit(name: &str) -> NewSource {
        NewSource {
            name: name.to_string(),
            config: SourceConfig::Reddit(RedditConfig {
                subreddit: "saas".to_string(),
                query: None,
                sort: RedditSort::New,
                time_filter: RedditTimeFilter::Day,
            }),
            cadence_minutes: None,
            is_active: true,
        }
    }

    fn scheduler(store: &Arc<MemoryStore>, queue: &Arc<MemoryJobQueue>, concurrency: usize) -> CrawlScheduler {
        CrawlScheduler::new(
            Arc::clone(store) as Arc<dyn Store>,
            Arc::clone(queue) as Arc<dyn JobQueue>,
            SchedulerConfig {
                concurrency,
                ..SchedulerConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn due_sources_get_one_run_and_one_job() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let source = store.insert_source(&reddit("r/saas")).await.unwrap();
        let s = scheduler(&store, &queue, 4);
        let now = Utc::now();

        let first = s.tick(now).await.unwrap();
        let second = s.tick(now).await.unwrap();

        assert_eq!(first.enqueued.len(), 1);
        assert_eq!(first.enqueued[0].status, CrawlStatus::Pending);
        assert!(second.enqueued.is_empty());
        assert_eq!(queue.pending(QueueName::Crawl).len(), 1);
        let source = store.get_source(source.id).await.unwrap();
        assert_eq!(source.last_run_at, Some(now));
    }

    #[tokio::test]
    async fn global_cap_defers_extra_sources() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        for n in 0..3 {
            store.insert_source(&reddit(&format!("source {n}"))).await.unwrap();
        }

        let report = scheduler(&store, &queue, 2).tick(Utc::now()).await.unwrap();

        assert_eq!(report.due, 3);
        assert_eq!(report.enqueued.len(), 2);
        assert_eq!(report.deferred, 1);
    }

    #[tokio::test]
    async fn stale_runs_are_reaped_and_source_rescheduled() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        store.insert_source(&reddit("r/saas")).await.unwrap();
        let s = scheduler(&store, &queue, 4);
        let start = Utc::now();

        let first = s.tick(start).await.unwrap();
        let later = start + chrono::Duration::hours(2);
        let second = s.tick(later).await.unwrap();

        assert_eq!(second.reaped, 1);
        assert_eq!(second.enqueued.len(), 1);
        let old = store.get_crawl_run(first.enqueued[0].id).await.unwrap();
        assert_eq!(old.status, CrawlStatus::Failed);
    }

    #[tokio::test]
    async fn trigger_returns_outstanding_run() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let source = store.insert_source(&reddit("r/saas")).await.unwrap();
        let s = scheduler(&store, &queue, 4);

        let first = s.trigger_crawl(source.id, Some("pricing"), Utc::now()).await.unwrap();
        let second = s.trigger_crawl(source.id, None, Utc::now()).await.unwrap();

        assert!(!first.already_outstanding);
        assert_eq!(first.run.query_override.as_deref(), Some("pricing"));
        assert!(second.already_outstanding);
        assert_eq!(second.run.id, first.run.id);
    }

    #[tokio::test]
    async fn trigger_rejects_inactive_source() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let mut new = reddit("r/saas");
        new.is_active = false;
        let source = store.insert_source(&new).await.unwrap();

        let err = scheduler(&store, &queue, 4)
            .trigger_crawl(source.id, None, Utc::now())
            .await
            .unwrap_err();

        assert!(matches!(err, SchedulerError::SourceInactive(id) if id == source.id));
    }
}
