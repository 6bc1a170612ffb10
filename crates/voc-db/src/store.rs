//! The persistence seam used by every pipeline component.
//!
//! [`crate::PgStore`] is the production implementation; [`crate::MemoryStore`]
//! keeps the same uniqueness and serialization guarantees in process memory.
//! The store is the single linearization point for dedup, the per-source
//! crawl lock, and alert cooldown state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use voc_core::{
    AlertDelivery, AlertEvent, AlertRule, AlertStatus, CrawlRun, CrawlStats, CrawlStatus,
    Feedback, Insight, InsightTheme, NewAlertEvent, NewAlertRule, NewDelivery, NewDiscard,
    NewExtractionBatch, NewFeedback, NewInsight, NewSource, PipelineStats, Source, Theme,
    ThemeCentroid, WindowInsight,
};

use crate::DbError;

#[async_trait]
pub trait Store: Send + Sync {
    // -----------------------------------------------------------------------
    // Sources
    // -----------------------------------------------------------------------

    async fn insert_source(&self, new: &NewSource) -> Result<Source, DbError>;

    async fn get_source(&self, id: i64) -> Result<Source, DbError>;

    async fn list_active_sources(&self) -> Result<Vec<Source>, DbError>;

    /// Record that a crawl for the source was enqueued at `at`.
    async fn mark_source_run(&self, id: i64, at: DateTime<Utc>) -> Result<(), DbError>;

    // -----------------------------------------------------------------------
    // Crawl runs
    // -----------------------------------------------------------------------

    /// Conditionally insert a `pending` run for the source.
    ///
    /// Returns `None` when the source already has an outstanding
    /// (`pending` or `running`) run; this is the per-source crawl lock.
    async fn claim_crawl_run(
        &self,
        source_id: i64,
        query_override: Option<&str>,
    ) -> Result<Option<CrawlRun>, DbError>;

    /// Delete a `pending` run whose job could not be enqueued.
    async fn release_crawl_run(&self, run_id: i64) -> Result<(), DbError>;

    /// Move a run from `pending` to `running`.
    ///
    /// A run that is already `running` (queue redelivery) is returned as is.
    /// Terminal runs yield [`DbError::InvalidCrawlRunTransition`].
    async fn start_crawl_run(&self, run_id: i64) -> Result<CrawlRun, DbError>;

    /// Write the terminal status of an outstanding run.
    async fn finish_crawl_run(
        &self,
        run_id: i64,
        status: CrawlStatus,
        stats: &CrawlStats,
        error_message: Option<&str>,
    ) -> Result<(), DbError>;

    async fn get_crawl_run(&self, id: i64) -> Result<CrawlRun, DbError>;

    async fn outstanding_crawl_run(&self, source_id: i64) -> Result<Option<CrawlRun>, DbError>;

    async fn count_outstanding_crawl_runs(&self) -> Result<i64, DbError>;

    /// Most recent runs first, optionally for one source.
    async fn list_crawl_runs(
        &self,
        source_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<CrawlRun>, DbError>;

    /// Fail outstanding runs created before `created_before`, releasing their
    /// source locks. Returns the number of runs reaped.
    async fn fail_stale_crawl_runs(
        &self,
        created_before: DateTime<Utc>,
        reason: &str,
    ) -> Result<u64, DbError>;

    // -----------------------------------------------------------------------
    // Feedback
    // -----------------------------------------------------------------------

    /// Insert feedback keyed on `(source_id, fingerprint)`.
    ///
    /// Returns the new id, or `None` when an identical row already exists.
    async fn insert_feedback(&self, new: &NewFeedback) -> Result<Option<i64>, DbError>;

    async fn record_discard(&self, discard: &NewDiscard) -> Result<(), DbError>;

    async fn get_feedback(&self, ids: &[i64]) -> Result<Vec<Feedback>, DbError>;

    /// Oldest `pending` feedback first.
    async fn list_pending_feedback(&self, limit: i64) -> Result<Vec<Feedback>, DbError>;

    /// Charge one extraction attempt to every `pending` row among `ids` that
    /// has fewer than `max_attempts` attempts. Returns the charged ids in id
    /// order; only those may be sent to the model.
    async fn claim_extraction_attempt(
        &self,
        ids: &[i64],
        max_attempts: i32,
    ) -> Result<Vec<i64>, DbError>;

    /// Claim up to `limit` `pending` rows untouched since `idle_before` (no
    /// attempt charged and no sweep since then) and mark them touched now.
    async fn claim_idle_pending_feedback(
        &self,
        idle_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<i64>, DbError>;

    /// Mark `pending` feedback as failed. Returns `false` when the row was
    /// not pending (already extracted or already failed).
    async fn mark_extraction_failed(&self, id: i64, error: &str) -> Result<bool, DbError>;

    /// Return up to `limit` failed feedback rows to `pending` with a fresh
    /// attempt budget.
    async fn reset_failed_extractions(&self, limit: i64) -> Result<Vec<i64>, DbError>;

    // -----------------------------------------------------------------------
    // Insights
    // -----------------------------------------------------------------------

    /// Insert an insight and mark its feedback `succeeded` atomically.
    ///
    /// Returns `None` when the feedback already has an insight.
    async fn insert_insight(&self, new: &NewInsight) -> Result<Option<Insight>, DbError>;

    async fn get_insight(&self, id: i64) -> Result<Insight, DbError>;

    /// Insights of the given feedback rows that have no theme link yet.
    async fn list_unthemed_insights(&self, feedback_ids: &[i64]) -> Result<Vec<Insight>, DbError>;

    /// Insights created at or after `since`, with their feedback text.
    async fn list_insights_since(&self, since: DateTime<Utc>)
        -> Result<Vec<WindowInsight>, DbError>;

    async fn record_extraction_batch(&self, batch: &NewExtractionBatch) -> Result<(), DbError>;

    // -----------------------------------------------------------------------
    // Themes
    // -----------------------------------------------------------------------

    /// Insert a theme by name, or return the existing one.
    async fn upsert_theme(
        &self,
        name: &str,
        description: Option<&str>,
        is_system: bool,
    ) -> Result<Theme, DbError>;

    /// Create a new theme seeded with `centroid`. Returns `None`, touching
    /// nothing, when a theme with that name already exists.
    async fn create_emerging_theme(
        &self,
        name: &str,
        description: &str,
        centroid: &[f32],
    ) -> Result<Option<Theme>, DbError>;

    async fn list_themes(&self) -> Result<Vec<Theme>, DbError>;

    async fn list_theme_centroids(&self) -> Result<Vec<ThemeCentroid>, DbError>;

    /// Link an insight to a theme.
    ///
    /// When the link is new and `member_embedding` is given, the theme's
    /// centroid is folded forward by moving average in the same transaction.
    /// Returns `false` when the link already existed.
    async fn assign_theme(
        &self,
        link: &InsightTheme,
        member_embedding: Option<&[f32]>,
    ) -> Result<bool, DbError>;

    async fn list_insight_themes(&self, insight_id: i64) -> Result<Vec<InsightTheme>, DbError>;

    // -----------------------------------------------------------------------
    // Alerts
    // -----------------------------------------------------------------------

    async fn insert_alert_rule(&self, new: &NewAlertRule) -> Result<AlertRule, DbError>;

    async fn get_alert_rule(&self, id: i64) -> Result<AlertRule, DbError>;

    async fn list_enabled_alert_rules(&self) -> Result<Vec<AlertRule>, DbError>;

    /// Create an alert event unless the rule already has an `open` event with
    /// the same condition key triggered at or after `cooldown_since`.
    ///
    /// Serialized per rule: concurrent callers for one rule observe each
    /// other's inserts.
    async fn create_alert_event(
        &self,
        event: &NewAlertEvent,
        cooldown_since: DateTime<Utc>,
    ) -> Result<Option<AlertEvent>, DbError>;

    async fn get_alert_event(&self, id: i64) -> Result<AlertEvent, DbError>;

    async fn list_alert_events(&self, rule_id: i64) -> Result<Vec<AlertEvent>, DbError>;

    /// Acknowledge or resolve an event; resolving stamps `resolved_at`.
    async fn update_alert_status(
        &self,
        id: i64,
        status: AlertStatus,
    ) -> Result<AlertEvent, DbError>;

    async fn list_deliveries(&self, alert_event_id: i64) -> Result<Vec<AlertDelivery>, DbError>;

    async fn upsert_delivery(&self, delivery: &NewDelivery) -> Result<(), DbError>;

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    async fn pipeline_stats(&self) -> Result<PipelineStats, DbError>;
}
