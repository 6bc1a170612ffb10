//! [`Store`] backed by a Postgres pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use voc_core::{
    AlertDelivery, AlertEvent, AlertRule, AlertStatus, CrawlRun, CrawlStats, CrawlStatus,
    Feedback, Insight, InsightTheme, NewAlertEvent, NewAlertRule, NewDelivery, NewDiscard,
    NewExtractionBatch, NewFeedback, NewInsight, NewSource, PipelineStats, Source, Theme,
    ThemeCentroid, WindowInsight,
};

use crate::{alerts, crawl_runs, feedback, insights, sources, stats, themes, DbError, Store};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_source(&self, new: &NewSource) -> Result<Source, DbError> {
        sources::insert_source(&self.pool, new).await
    }

    async fn get_source(&self, id: i64) -> Result<Source, DbError> {
        sources::get_source(&self.pool, id).await
    }

    async fn list_active_sources(&self) -> Result<Vec<Source>, DbError> {
        sources::list_active_sources(&self.pool).await
    }

    async fn mark_source_run(&self, id: i64, at: DateTime<Utc>) -> Result<(), DbError> {
        sources::mark_source_run(&self.pool, id, at).await
    }

    async fn claim_crawl_run(
        &self,
        source_id: i64,
        query_override: Option<&str>,
    ) -> Result<Option<CrawlRun>, DbError> {
        crawl_runs::claim_crawl_run(&self.pool, source_id, query_override).await
    }

    async fn release_crawl_run(&self, run_id: i64) -> Result<(), DbError> {
        crawl_runs::release_crawl_run(&self.pool, run_id).await
    }

    async fn start_crawl_run(&self, run_id: i64) -> Result<CrawlRun, DbError> {
        crawl_runs::start_crawl_run(&self.pool, run_id).await
    }

    async fn finish_crawl_run(
        &self,
        run_id: i64,
        status: CrawlStatus,
        stats: &CrawlStats,
        error_message: Option<&str>,
    ) -> Result<(), DbError> {
        crawl_runs::finish_crawl_run(&self.pool, run_id, status, stats, error_message).await
    }

    async fn get_crawl_run(&self, id: i64) -> Result<CrawlRun, DbError> {
        crawl_runs::get_crawl_run(&self.pool, id).await
    }

    async fn outstanding_crawl_run(&self, source_id: i64) -> Result<Option<CrawlRun>, DbError> {
        crawl_runs::outstanding_crawl_run(&self.pool, source_id).await
    }

    async fn count_outstanding_crawl_runs(&self) -> Result<i64, DbError> {
        crawl_runs::count_outstanding_crawl_runs(&self.pool).await
    }

    async fn list_crawl_runs(
        &self,
        source_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<CrawlRun>, DbError> {
        crawl_runs::list_crawl_runs(&self.pool, source_id, limit).await
    }

    async fn fail_stale_crawl_runs(
        &self,
        created_before: DateTime<Utc>,
        reason: &str,
    ) -> Result<u64, DbError> {
        crawl_runs::fail_stale_crawl_runs(&self.pool, created_before, reason).await
    }

    async fn insert_feedback(&self, new: &NewFeedback) -> Result<Option<i64>, DbError> {
        feedback::insert_feedback(&self.pool, new).await
    }

    async fn record_discard(&self, discard: &NewDiscard) -> Result<(), DbError> {
        feedback::record_discard(&self.pool, discard).await
    }

    async fn get_feedback(&self, ids: &[i64]) -> Result<Vec<Feedback>, DbError> {
        feedback::get_feedback(&self.pool, ids).await
    }

    async fn list_pending_feedback(&self, limit: i64) -> Result<Vec<Feedback>, DbError> {
        feedback::list_pending_feedback(&self.pool, limit).await
    }

    async fn claim_extraction_attempt(
        &self,
        ids: &[i64],
        max_attempts: i32,
    ) -> Result<Vec<i64>, DbError> {
        feedback::claim_extraction_attempt(&self.pool, ids, max_attempts).await
    }

    async fn claim_idle_pending_feedback(
        &self,
        idle_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<i64>, DbError> {
        feedback::claim_idle_pending_feedback(&self.pool, idle_before, limit).await
    }

    async fn mark_extraction_failed(&self, id: i64, error: &str) -> Result<bool, DbError> {
        feedback::mark_extraction_failed(&self.pool, id, error).await
    }

    async fn reset_failed_extractions(&self, limit: i64) -> Result<Vec<i64>, DbError> {
        feedback::reset_failed_extractions(&self.pool, limit).await
    }

    async fn insert_insight(&self, new: &NewInsight) -> Result<Option<Insight>, DbError> {
        insights::insert_insight(&self.pool, new).await
    }

    async fn get_insight(&self, id: i64) -> Result<Insight, DbError> {
        insights::get_insight(&self.pool, id).await
    }

    async fn list_unthemed_insights(&self, feedback_ids: &[i64]) -> Result<Vec<Insight>, DbError> {
        insights::list_unthemed_insights(&self.pool, feedback_ids).await
    }

    async fn list_insights_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<WindowInsight>, DbError> {
        insights::list_insights_since(&self.pool, since).await
    }

    async fn record_extraction_batch(&self, batch: &NewExtractionBatch) -> Result<(), DbError> {
        insights::record_extraction_batch(&self.pool, batch).await
    }

    async fn upsert_theme(
        &self,
        name: &str,
        description: Option<&str>,
        is_system: bool,
    ) -> Result<Theme, DbError> {
        themes::upsert_theme(&self.pool, name, description, is_system).await
    }

    async fn create_emerging_theme(
        &self,
        name: &str,
        description: &str,
        centroid: &[f32],
    ) -> Result<Option<Theme>, DbError> {
        themes::create_emerging_theme(&self.pool, name, description, centroid).await
    }

    async fn list_themes(&self) -> Result<Vec<Theme>, DbError> {
        themes::list_themes(&self.pool).await
    }

    async fn list_theme_centroids(&self) -> Result<Vec<ThemeCentroid>, DbError> {
        themes::list_theme_centroids(&self.pool).await
    }

    async fn assign_theme(
        &self,
        link: &InsightTheme,
        member_embedding: Option<&[f32]>,
    ) -> Result<bool, DbError> {
        themes::assign_theme(&self.pool, link, member_embedding).await
    }

    async fn list_insight_themes(&self, insight_id: i64) -> Result<Vec<InsightTheme>, DbError> {
        themes::list_insight_themes(&self.pool, insight_id).await
    }

    async fn insert_alert_rule(&self, new: &NewAlertRule) -> Result<AlertRule, DbError> {
        alerts::insert_alert_rule(&self.pool, new).await
    }

    async fn get_alert_rule(&self, id: i64) -> Result<AlertRule, DbError> {
        alerts::get_alert_rule(&self.pool, id).await
    }

    async fn list_enabled_alert_rules(&self) -> Result<Vec<AlertRule>, DbError> {
        alerts::list_enabled_alert_rules(&self.pool).await
    }

    async fn create_alert_event(
        &self,
        event: &NewAlertEvent,
        cooldown_since: DateTime<Utc>,
    ) -> Result<Option<AlertEvent>, DbError> {
        alerts::create_alert_event(&self.pool, event, cooldown_since).await
    }

    async fn get_alert_event(&self, id: i64) -> Result<AlertEvent, DbError> {
        alerts::get_alert_event(&self.pool, id).await
    }

    async fn list_alert_events(&self, rule_id: i64) -> Result<Vec<AlertEvent>, DbError> {
        alerts::list_alert_events(&self.pool, rule_id).await
    }

    async fn update_alert_status(
        &self,
        id: i64,
        status: AlertStatus,
    ) -> Result<AlertEvent, DbError> {
        alerts::update_alert_status(&self.pool, id, status).await
    }

    async fn list_deliveries(&self, alert_event_id: i64) -> Result<Vec<AlertDelivery>, DbError> {
        alerts::list_deliveries(&self.pool, alert_event_id).await
    }

    async fn upsert_delivery(&self, delivery: &NewDelivery) -> Result<(), DbError> {
        alerts::upsert_delivery(&self.pool, delivery).await
    }

    async fn pipeline_stats(&self) -> Result<PipelineStats, DbError> {
        stats::pipeline_stats(&self.pool).await
    }
}
