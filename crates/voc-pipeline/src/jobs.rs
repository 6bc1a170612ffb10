//! Typed jobs and their handlers.
//!
//! Delivery is at-least-once, so every handler tolerates running twice for
//! the same job: crawl runs refuse to restart once terminal, extraction skips
//! feedback that is no longer pending and classifies any of its insights
//! still lacking themes, alert events are deduplicated by the cooldown and
//! dispatch skips delivered targets.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use voc_core::{CrawlStats, CrawlStatus, Insight};
use voc_crawler::{AdapterRegistry, CrawlError};
use voc_db::{DbError, JobQueue, QueueName, Store};

use crate::alerts::AlertEvaluator;
use crate::classifier::ThemeClassifier;
use crate::cleaner::Cleaner;
use crate::error::JobError;
use crate::extractor::InsightExtractor;
use crate::ingest::ingest_records;
use crate::notify::NotificationDispatcher;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Job {
    Crawl { crawl_run_id: i64 },
    Extract { feedback_ids: Vec<i64> },
    EvaluateAlerts,
    DispatchAlert { alert_event_id: i64 },
}

impl Job {
    #[must_use]
    pub fn queue(&self) -> QueueName {
        match self {
            Job::Crawl { .. } => QueueName::Crawl,
            Job::Extract { .. } => QueueName::Processing,
            Job::EvaluateAlerts | Job::DispatchAlert { .. } => QueueName::Alert,
        }
    }

    /// # Errors
    ///
    /// Returns [`serde_json::Error`] if serialization fails.
    pub fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// # Errors
    ///
    /// Returns [`serde_json::Error`] for a payload that is not a known job.
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Done,
    /// Put the job back and deliver it again after the delay.
    RetryAfter(Duration),
}

/// Shared dependencies of every handler.
pub struct JobContext {
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn JobQueue>,
    pub registry: Arc<AdapterRegistry>,
    pub cleaner: Cleaner,
    pub extractor: Arc<InsightExtractor>,
    pub classifier: Arc<ThemeClassifier>,
    pub evaluator: Arc<AlertEvaluator>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub fetch_limit: usize,
}

impl JobContext {
    /// Run one job to completion.
    ///
    /// # Errors
    ///
    /// Returns [`JobError`] for failures worth redelivering the job for.
    pub async fn handle(&self, job: &Job, now: DateTime<Utc>) -> Result<JobOutcome, JobError> {
        match job {
            Job::Crawl { crawl_run_id } => self.crawl(*crawl_run_id).await,
            Job::Extract { feedback_ids } => {
                self.extract(feedback_ids).await?;
                Ok(JobOutcome::Done)
            }
            Job::EvaluateAlerts => {
                self.evaluate_alerts(now).await?;
                Ok(JobOutcome::Done)
            }
            Job::DispatchAlert { alert_event_id } => {
                self.dispatcher.dispatch(*alert_event_id).await?;
                Ok(JobOutcome::Done)
            }
        }
    }

    /// Write the terminal state owned by a job that will not be delivered
    /// again.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Store`] if the store fails.
    pub async fn exhausted(&self, job: &Job, reason: &str) -> Result<(), JobError> {
        match job {
            Job::Crawl { crawl_run_id } => {
                let run = self.store.get_crawl_run(*crawl_run_id).await?;
                if run.status.is_outstanding() {
                    self.store
                        .finish_crawl_run(run.id, CrawlStatus::Failed, &run.stats, Some(reason))
                        .await?;
                }
            }
            Job::Extract { feedback_ids } => {
                for id in feedback_ids {
                    self.store.mark_extraction_failed(*id, reason).await?;
                }
            }
            Job::EvaluateAlerts | Job::DispatchAlert { .. } => {}
        }
        Ok(())
    }

    /// Enqueue extraction for pending feedback nothing has touched since
    /// `idle_before`, such as rows whose extract job could not be enqueued
    /// or was buried. Rows with a queued or running job stay untouched
    /// because every attempt refreshes them.
    ///
    /// # Errors
    ///
    /// Returns [`JobError`] if the store or queue fails.
    pub async fn sweep_pending(
        &self,
        idle_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<usize, JobError> {
        let ids = self
            .store
            .claim_idle_pending_feedback(idle_before, limit)
            .await?;
        let jobs = self.enqueue_extraction(&ids).await?;
        if jobs > 0 {
            tracing::info!(feedback = ids.len(), jobs, "worker: swept idle pending feedback");
        }
        Ok(jobs)
    }

    /// Queue an alert evaluation pass.
    ///
    /// # Errors
    ///
    /// Returns [`JobError`] if the queue fails.
    pub async fn schedule_alert_evaluation(&self) -> Result<(), JobError> {
        let job = Job::EvaluateAlerts;
        self.queue
            .enqueue(job.queue(), job.to_payload()?, Duration::ZERO)
            .await?;
        Ok(())
    }

    async fn crawl(&self, crawl_run_id: i64) -> Result<JobOutcome, JobError> {
        let run = match self.store.start_crawl_run(crawl_run_id).await {
            Ok(run) => run,
            Err(DbError::InvalidCrawlRunTransition { .. } | DbError::NotFound) => {
                tracing::info!(crawl_run_id, "worker: crawl run already finished, skipping");
                return Ok(JobOutcome::Done);
            }
            Err(e) => return Err(e.into()),
        };
        let source = self.store.get_source(run.source_id).await?;

        let config = match run.query_override.as_deref() {
            Some(query) => source.config.with_query_override(query),
            None => Ok(source.config.clone()),
        };
        let config = match config {
            Ok(config) => config,
            Err(e) => {
                let message = CrawlError::InvalidConfig(e.to_string()).to_string();
                self.store
                    .finish_crawl_run(run.id, CrawlStatus::Failed, &CrawlStats::default(), Some(&message))
                    .await?;
                return Ok(JobOutcome::Done);
            }
        };
        let Some(adapter) = self.registry.get(source.platform()) else {
            let message = format!("no crawler registered for {}", source.platform());
            self.store
                .finish_crawl_run(run.id, CrawlStatus::Failed, &CrawlStats::default(), Some(&message))
                .await?;
            return Ok(JobOutcome::Done);
        };

        tracing::info!(run_id = run.id, source_id = source.id, platform = %source.platform(), "worker: crawl started");
        let outcome = adapter.fetch(&config, self.fetch_limit).await;

        if let (Some(CrawlError::RateLimited { retry_after_secs }), true) =
            (&outcome.error, outcome.records.is_empty())
        {
            tracing::warn!(run_id = run.id, retry_after_secs, "worker: crawl rate limited, requeueing");
            return Ok(JobOutcome::RetryAfter(Duration::from_secs(*retry_after_secs)));
        }

        let ingested =
            ingest_records(self.store.as_ref(), &self.cleaner, &source, Some(run.id), &outcome.records)
                .await?;
        let status = match &outcome.error {
            None => CrawlStatus::Succeeded,
            Some(_) if !outcome.records.is_empty() => CrawlStatus::Partial,
            Some(_) => CrawlStatus::Failed,
        };
        let message = outcome.error.as_ref().map(ToString::to_string);
        self.store
            .finish_crawl_run(run.id, status, &ingested.stats, message.as_deref())
            .await?;
        tracing::info!(
            run_id = run.id,
            status = %status,
            fetched = ingested.stats.fetched,
            stored = ingested.stats.stored,
            duplicates = ingested.stats.duplicates,
            discarded = ingested.stats.discarded,
            "worker: crawl finished"
        );

        if let Err(e) = self.enqueue_extraction(&ingested.feedback_ids).await {
            tracing::warn!(run_id = run.id, error = %e, "worker: extraction enqueue failed, leaving rows for the sweep");
        }
        Ok(JobOutcome::Done)
    }

    async fn enqueue_extraction(&self, feedback_ids: &[i64]) -> Result<usize, JobError> {
        let batch_size = self.extractor.config().batch_size.max(1);
        let mut jobs = 0;
        for chunk in feedback_ids.chunks(batch_size) {
            let job = Job::Extract {
                feedback_ids: chunk.to_vec(),
            };
            self.queue
                .enqueue(job.queue(), job.to_payload()?, Duration::ZERO)
                .await?;
            jobs += 1;
        }
        Ok(jobs)
    }

    async fn extract(&self, feedback_ids: &[i64]) -> Result<(), JobError> {
        let extracted = self.extractor.extract(feedback_ids).await;
        // Also covers insights an earlier delivery stored but never themed.
        let unthemed = self.store.list_unthemed_insights(feedback_ids).await?;
        let failures = self.classify_all(&unthemed).await;
        let report = extracted?;
        self.dispatcher.publish_insights(&report.insights).await;
        if failures > 0 {
            return Err(JobError::Unclassified(failures));
        }
        Ok(())
    }

    async fn classify_all(&self, insights: &[Insight]) -> usize {
        let mut failures = 0;
        for insight in insights {
            match self.classifier.classify(insight).await {
                Ok(result) => tracing::debug!(
                    insight_id = insight.id,
                    themes = result.assignments.len(),
                    emerging = result.emerging_theme.is_some(),
                    "worker: insight classified"
                ),
                Err(e) => {
                    tracing::error!(insight_id = insight.id, error = %e, "worker: classification failed");
                    failures += 1;
                }
            }
        }
        failures
    }

    async fn evaluate_alerts(&self, now: DateTime<Utc>) -> Result<(), JobError> {
        let report = self.evaluator.run_cycle(now).await?;
        for event in &report.events {
            let job = Job::DispatchAlert {
                alert_event_id: event.id,
            };
            let queued = match job.to_payload() {
                Ok(payload) => self
                    .queue
                    .enqueue(job.queue(), payload, Duration::ZERO)
                    .await
                    .map_err(JobError::from),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = queued {
                tracing::warn!(event_id = event.id, error = %e, "worker: dispatch enqueue failed, dispatching inline");
                self.dispatcher.dispatch(event.id).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn jobs_use_type_tag() {
        let payload = Job::Extract {
            feedback_ids: vec![3, 4],
        }
        .to_payload()
        .unwrap();
        assert_eq!(payload, json!({ "type": "extract", "feedback_ids": [3, 4] }));

        let job = Job::from_payload(&json!({ "type": "evaluate_alerts" })).unwrap();
        assert_eq!(job, Job::EvaluateAlerts);
        assert_eq!(job.queue(), QueueName::Alert);
    }

    #[test]
    fn unknown_job_type_is_an_error() {
        assert!(Job::from_payload(&json!({ "type": "reindex" })).is_err());
        assert!(Job::from_payload(&json!({ "type": "crawl" })).is_err());
    }
}
