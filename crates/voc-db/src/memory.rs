//! In-process [`Store`] used by unit and scenario tests.
//!
//! Every operation runs under a single mutex, which gives the same
//! guarantees the Postgres store gets from unique indexes and row locks:
//! one outstanding crawl run per source, one feedback row per
//! `(source_id, fingerprint)`, one insight per feedback and serialized
//! cooldown checks per rule.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use voc_core::{
    moving_average, AlertDelivery, AlertEvent, AlertRule, AlertStatus, CrawlRun, CrawlStats,
    CrawlStatus, DeliveryStatus, ExtractionStatus, Feedback, Insight, InsightTheme,
    NewAlertEvent, NewAlertRule, NewDelivery, NewDiscard, NewExtractionBatch, NewFeedback,
    NewInsight, NewSource, PipelineStats, Source, Theme, ThemeCentroid, WindowInsight,
};

use crate::{DbError, Store};

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    clock: Option<DateTime<Utc>>,
    sources: BTreeMap<i64, Source>,
    runs: BTreeMap<i64, CrawlRun>,
    feedback: BTreeMap<i64, Feedback>,
    /// Last attempt charge or sweep per feedback row.
    touched: BTreeMap<i64, DateTime<Utc>>,
    discards: Vec<NewDiscard>,
    insights: BTreeMap<i64, Insight>,
    batches: Vec<NewExtractionBatch>,
    themes: BTreeMap<i64, Theme>,
    centroids: BTreeMap<i64, ThemeCentroid>,
    insight_themes: Vec<InsightTheme>,
    rules: BTreeMap<i64, AlertRule>,
    events: BTreeMap<i64, AlertEvent>,
    deliveries: Vec<AlertDelivery>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.unwrap_or_else(Utc::now)
    }

    fn outstanding_run(&self, source_id: i64) -> Option<&CrawlRun> {
        self.runs
            .values()
            .find(|run| run.source_id == source_id && run.status.is_outstanding())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pin the timestamp the store stamps on new rows. `None` restores the
    /// wall clock.
    pub fn set_clock(&self, now: Option<DateTime<Utc>>) {
        self.state().clock = now;
    }

    /// Every recorded discard, in insertion order.
    #[must_use]
    pub fn discards(&self) -> Vec<NewDiscard> {
        self.state().discards.clone()
    }

    /// Every feedback row, in id order.
    #[must_use]
    pub fn all_feedback(&self) -> Vec<Feedback> {
        self.state().feedback.values().cloned().collect()
    }

    /// Every extraction batch accounting row, in insertion order.
    #[must_use]
    pub fn extraction_batches(&self) -> Vec<NewExtractionBatch> {
        self.state().batches.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    // -----------------------------------------------------------------------
    // Sources
    // -----------------------------------------------------------------------

    async fn insert_source(&self, new: &NewSource) -> Result<Source, DbError> {
        let mut state = self.state();
        let id = state.next_id();
        let source = Source {
            id,
            name: new.name.clone(),
            config: new.config.clone(),
            cadence_minutes: new.cadence_minutes,
            is_active: new.is_active,
            last_run_at: None,
            created_at: state.now(),
        };
        state.sources.insert(id, source.clone());
        Ok(source)
    }

    async fn get_source(&self, id: i64) -> Result<Source, DbError> {
        self.state().sources.get(&id).cloned().ok_or(DbError::NotFound)
    }

    async fn list_active_sources(&self) -> Result<Vec<Source>, DbError> {
        let mut sources: Vec<Source> = self
            .state()
            .sources
            .values()
            .filter(|s| s.is_active)
            .cloned()
            .collect();
        // NULLS FIRST, then oldest run.
        sources.sort_by_key(|s| (s.last_run_at.is_some(), s.last_run_at, s.id));
        Ok(sources)
    }

    async fn mark_source_run(&self, id: i64, at: DateTime<Utc>) -> Result<(), DbError> {
        let mut state = self.state();
        let source = state.sources.get_mut(&id).ok_or(DbError::NotFound)?;
        source.last_run_at = Some(at);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Crawl runs
    // -----------------------------------------------------------------------

    async fn claim_crawl_run(
        &self,
        source_id: i64,
        query_override: Option<&str>,
    ) -> Result<Option<CrawlRun>, DbError> {
        let mut state = self.state();
        if !state.sources.contains_key(&source_id) {
            return Err(DbError::NotFound);
        }
        if state.outstanding_run(source_id).is_some() {
            return Ok(None);
        }
        let id = state.next_id();
        let run = CrawlRun {
            id,
            source_id,
            status: CrawlStatus::Pending,
            query_override: query_override.map(str::to_string),
            started_at: None,
            finished_at: None,
            stats: CrawlStats::default(),
            error_message: None,
            created_at: state.now(),
        };
        state.runs.insert(id, run.clone());
        Ok(Some(run))
    }

    async fn release_crawl_run(&self, run_id: i64) -> Result<(), DbError> {
        let mut state = self.state();
        if state
            .runs
            .get(&run_id)
            .is_some_and(|run| run.status == CrawlStatus::Pending)
        {
            state.runs.remove(&run_id);
        }
        Ok(())
    }

    async fn start_crawl_run(&self, run_id: i64) -> Result<CrawlRun, DbError> {
        let mut state = self.state();
        let now = state.now();
        let run = state.runs.get_mut(&run_id).ok_or(DbError::NotFound)?;
        match run.status {
            CrawlStatus::Pending => {
                run.status = CrawlStatus::Running;
                run.started_at = Some(now);
                Ok(run.clone())
            }
            CrawlStatus::Running => Ok(run.clone()),
            _ => Err(DbError::InvalidCrawlRunTransition {
                id: run_id,
                expected: "pending",
            }),
        }
    }

    async fn finish_crawl_run(
        &self,
        run_id: i64,
        status: CrawlStatus,
        stats: &CrawlStats,
        error_message: Option<&str>,
    ) -> Result<(), DbError> {
        if status.is_outstanding() {
            return Err(DbError::InvalidData(format!(
                "{status} is not a terminal crawl status"
            )));
        }
        let mut state = self.state();
        let now = state.now();
        let run = state
            .runs
            .get_mut(&run_id)
            .filter(|run| run.status.is_outstanding())
            .ok_or(DbError::InvalidCrawlRunTransition {
                id: run_id,
                expected: "pending or running",
            })?;
        run.status = status;
        run.stats = stats.clone();
        run.error_message = error_message.map(str::to_string);
        run.started_at.get_or_insert(now);
        run.finished_at = Some(now);
        Ok(())
    }

    async fn get_crawl_run(&self, id: i64) -> Result<CrawlRun, DbError> {
        self.state().runs.get(&id).cloned().ok_or(DbError::NotFound)
    }

    async fn outstanding_crawl_run(&self, source_id: i64) -> Result<Option<CrawlRun>, DbError> {
        Ok(self.state().outstanding_run(source_id).cloned())
    }

    async fn count_outstanding_crawl_runs(&self) -> Result<i64, DbError> {
        let count = self
            .state()
            .runs
            .values()
            .filter(|run| run.status.is_outstanding())
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn list_crawl_runs(
        &self,
        source_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<CrawlRun>, DbError> {
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        Ok(self
            .state()
            .runs
            .values()
            .rev()
            .filter(|run| source_id.is_none_or(|id| run.source_id == id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn fail_stale_crawl_runs(
        &self,
        created_before: DateTime<Utc>,
        reason: &str,
    ) -> Result<u64, DbError> {
        let mut state = self.state();
        let now = state.now();
        let mut reaped = 0;
        for run in state.runs.values_mut() {
            if run.status.is_outstanding() && run.created_at < created_before {
                run.status = CrawlStatus::Failed;
                run.error_message = Some(reason.to_string());
                run.finished_at = Some(now);
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    // -----------------------------------------------------------------------
    // Feedback
    // -----------------------------------------------------------------------

    async fn insert_feedback(&self, new: &NewFeedback) -> Result<Option<i64>, DbError> {
        let mut state = self.state();
        let duplicate = state
            .feedback
            .values()
            .any(|f| f.source_id == new.source_id && f.fingerprint == new.fingerprint);
        if duplicate {
            return Ok(None);
        }
        let id = state.next_id();
        let created_at = state.now();
        state.feedback.insert(
            id,
            Feedback {
                id,
                source_id: new.source_id,
                crawl_run_id: new.crawl_run_id,
                external_id: new.external_id.clone(),
                raw_content: new.raw_content.clone(),
                clean_content: new.clean_content.clone(),
                fingerprint: new.fingerprint.clone(),
                posted_at: new.posted_at,
                author_handle: new.author_handle.clone(),
                url: new.url.clone(),
                metadata: new.metadata.clone(),
                extraction_status: ExtractionStatus::Pending,
                extraction_attempts: 0,
                extraction_error: None,
                created_at,
            },
        );
        state.touched.insert(id, created_at);
        Ok(Some(id))
    }

    async fn record_discard(&self, discard: &NewDiscard) -> Result<(), DbError> {
        self.state().discards.push(discard.clone());
        Ok(())
    }

    async fn get_feedback(&self, ids: &[i64]) -> Result<Vec<Feedback>, DbError> {
        Ok(self
            .state()
            .feedback
            .values()
            .filter(|f| ids.contains(&f.id))
            .cloned()
            .collect())
    }

    async fn list_pending_feedback(&self, limit: i64) -> Result<Vec<Feedback>, DbError> {
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        Ok(self
            .state()
            .feedback
            .values()
            .filter(|f| f.extraction_status == ExtractionStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn claim_extraction_attempt(
        &self,
        ids: &[i64],
        max_attempts: i32,
    ) -> Result<Vec<i64>, DbError> {
        let mut state = self.state();
        let now = state.now();
        let mut charged = Vec::new();
        for f in state.feedback.values_mut() {
            if ids.contains(&f.id)
                && f.extraction_status == ExtractionStatus::Pending
                && f.extraction_attempts < max_attempts
            {
                f.extraction_attempts += 1;
                charged.push(f.id);
            }
        }
        for id in &charged {
            state.touched.insert(*id, now);
        }
        Ok(charged)
    }

    async fn claim_idle_pending_feedback(
        &self,
        idle_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<i64>, DbError> {
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        let mut state = self.state();
        let now = state.now();
        let idle: Vec<i64> = state
            .feedback
            .values()
            .filter(|f| f.extraction_status == ExtractionStatus::Pending)
            .filter(|f| state.touched.get(&f.id).is_none_or(|t| *t < idle_before))
            .take(limit)
            .map(|f| f.id)
            .collect();
        for id in &idle {
            state.touched.insert(*id, now);
        }
        Ok(idle)
    }

    async fn mark_extraction_failed(&self, id: i64, error: &str) -> Result<bool, DbError> {
        let mut state = self.state();
        match state.feedback.get_mut(&id) {
            Some(f) if f.extraction_status == ExtractionStatus::Pending => {
                f.extraction_status = ExtractionStatus::Failed;
                f.extraction_error = Some(error.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset_failed_extractions(&self, limit: i64) -> Result<Vec<i64>, DbError> {
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        let mut state = self.state();
        let mut reset = Vec::new();
        for f in state
            .feedback
            .values_mut()
            .filter(|f| f.extraction_status == ExtractionStatus::Failed)
            .take(limit)
        {
            f.extraction_status = ExtractionStatus::Pending;
            f.extraction_attempts = 0;
            f.extraction_error = None;
            reset.push(f.id);
        }
        Ok(reset)
    }

    // -----------------------------------------------------------------------
    // Insights
    // -----------------------------------------------------------------------

    async fn insert_insight(&self, new: &NewInsight) -> Result<Option<Insight>, DbError> {
        let mut state = self.state();
        if !state.feedback.contains_key(&new.feedback_id) {
            return Err(DbError::NotFound);
        }
        if state
            .insights
            .values()
            .any(|i| i.feedback_id == new.feedback_id)
        {
            return Ok(None);
        }
        let id = state.next_id();
        let insight = Insight::from_new(id, new.clone(), state.now());
        state.insights.insert(id, insight.clone());
        if let Some(f) = state.feedback.get_mut(&new.feedback_id) {
            f.extraction_status = ExtractionStatus::Succeeded;
            f.extraction_error = None;
        }
        Ok(Some(insight))
    }

    async fn get_insight(&self, id: i64) -> Result<Insight, DbError> {
        self.state().insights.get(&id).cloned().ok_or(DbError::NotFound)
    }

    async fn list_unthemed_insights(&self, feedback_ids: &[i64]) -> Result<Vec<Insight>, DbError> {
        let state = self.state();
        Ok(state
            .insights
            .values()
            .filter(|i| feedback_ids.contains(&i.feedback_id))
            .filter(|i| !state.insight_themes.iter().any(|t| t.insight_id == i.id))
            .cloned()
            .collect())
    }

    async fn list_insights_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<WindowInsight>, DbError> {
        let state = self.state();
        let mut rows: Vec<WindowInsight> = state
            .insights
            .values()
            .filter(|i| i.created_at >= since)
            .filter_map(|i| {
                state.feedback.get(&i.feedback_id).map(|f| WindowInsight {
                    insight: i.clone(),
                    content: f.clean_content.clone(),
                })
            })
            .collect();
        rows.sort_by_key(|row| (row.insight.created_at, row.insight.id));
        Ok(rows)
    }

    async fn record_extraction_batch(&self, batch: &NewExtractionBatch) -> Result<(), DbError> {
        self.state().batches.push(batch.clone());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Themes
    // -----------------------------------------------------------------------

    async fn upsert_theme(
        &self,
        name: &str,
        description: Option<&str>,
        is_system: bool,
    ) -> Result<Theme, DbError> {
        let mut state = self.state();
        if let Some(existing) = state.themes.values().find(|t| t.name == name) {
            return Ok(existing.clone());
        }
        let id = state.next_id();
        let theme = Theme {
            id,
            name: name.to_string(),
            description: description.map(str::to_string),
            is_system,
            created_at: state.now(),
        };
        state.themes.insert(id, theme.clone());
        Ok(theme)
    }

    async fn create_emerging_theme(
        &self,
        name: &str,
        description: &str,
        centroid: &[f32],
    ) -> Result<Option<Theme>, DbError> {
        let mut state = self.state();
        if state.themes.values().any(|t| t.name == name) {
            return Ok(None);
        }
        let id = state.next_id();
        let theme = Theme {
            id,
            name: name.to_string(),
            description: Some(description.to_string()),
            is_system: false,
            created_at: state.now(),
        };
        state.themes.insert(id, theme.clone());
        state.centroids.insert(
            id,
            ThemeCentroid {
                theme_id: id,
                centroid: centroid.to_vec(),
                member_count: 0,
            },
        );
        Ok(Some(theme))
    }

    async fn list_themes(&self) -> Result<Vec<Theme>, DbError> {
        let mut themes: Vec<Theme> = self.state().themes.values().cloned().collect();
        themes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(themes)
    }

    async fn list_theme_centroids(&self) -> Result<Vec<ThemeCentroid>, DbError> {
        Ok(self.state().centroids.values().cloned().collect())
    }

    async fn assign_theme(
        &self,
        link: &InsightTheme,
        member_embedding: Option<&[f32]>,
    ) -> Result<bool, DbError> {
        let mut state = self.state();
        if state
            .insight_themes
            .iter()
            .any(|t| t.insight_id == link.insight_id && t.theme_id == link.theme_id)
        {
            return Ok(false);
        }
        state.insight_themes.push(InsightTheme {
            weight: link.weight.clamp(0.0, 1.0),
            ..link.clone()
        });

        let Some(embedding) = member_embedding else {
            return Ok(true);
        };
        match state.centroids.get_mut(&link.theme_id) {
            Some(current) => {
                match moving_average(&current.centroid, embedding, current.member_count) {
                    Some(updated) => {
                        current.centroid = updated;
                        current.member_count += 1;
                    }
                    None => tracing::warn!(
                        theme_id = link.theme_id,
                        stored = current.centroid.len(),
                        incoming = embedding.len(),
                        "centroid dimension mismatch; leaving centroid unchanged"
                    ),
                }
            }
            None => {
                state.centroids.insert(
                    link.theme_id,
                    ThemeCentroid {
                        theme_id: link.theme_id,
                        centroid: embedding.to_vec(),
                        member_count: 1,
                    },
                );
            }
        }
        Ok(true)
    }

    async fn list_insight_themes(&self, insight_id: i64) -> Result<Vec<InsightTheme>, DbError> {
        let mut links: Vec<InsightTheme> = self
            .state()
            .insight_themes
            .iter()
            .filter(|t| t.insight_id == insight_id)
            .cloned()
            .collect();
        links.sort_by(|a, b| {
            b.weight
                .total_cmp(&a.weight)
                .then_with(|| a.theme_id.cmp(&b.theme_id))
        });
        Ok(links)
    }

    // -----------------------------------------------------------------------
    // Alerts
    // -----------------------------------------------------------------------

    async fn insert_alert_rule(&self, new: &NewAlertRule) -> Result<AlertRule, DbError> {
        let mut state = self.state();
        let id = state.next_id();
        let rule = AlertRule {
            id,
            name: new.name.clone(),
            rule_type: new.rule_type,
            threshold_value: new.threshold_value,
            keywords: new.keywords.clone(),
            competitor_filters: new.competitor_filters.clone(),
            channels: new.channels.clone(),
            window_minutes: new.window_minutes,
            cooldown_minutes: new.cooldown_minutes,
            enabled: new.enabled,
            created_at: state.now(),
        };
        state.rules.insert(id, rule.clone());
        Ok(rule)
    }

    async fn get_alert_rule(&self, id: i64) -> Result<AlertRule, DbError> {
        self.state().rules.get(&id).cloned().ok_or(DbError::NotFound)
    }

    async fn list_enabled_alert_rules(&self) -> Result<Vec<AlertRule>, DbError> {
        Ok(self
            .state()
            .rules
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect())
    }

    async fn create_alert_event(
        &self,
        event: &NewAlertEvent,
        cooldown_since: DateTime<Utc>,
    ) -> Result<Option<AlertEvent>, DbError> {
        let mut state = self.state();
        if !state.rules.contains_key(&event.alert_rule_id) {
            return Err(DbError::NotFound);
        }
        let cooling = state.events.values().any(|e| {
            e.alert_rule_id == event.alert_rule_id
                && e.condition_key == event.condition_key
                && e.status.is_unresolved()
                && e.triggered_at >= cooldown_since
        });
        if cooling {
            return Ok(None);
        }
        let id = state.next_id();
        let created = AlertEvent {
            id,
            alert_rule_id: event.alert_rule_id,
            primary_insight_id: event.primary_insight_id,
            triggered_at: event.triggered_at,
            severity: event.severity,
            status: AlertStatus::Open,
            condition_key: event.condition_key.clone(),
            payload: event.payload.clone(),
            resolved_at: None,
        };
        state.events.insert(id, created.clone());
        Ok(Some(created))
    }

    async fn get_alert_event(&self, id: i64) -> Result<AlertEvent, DbError> {
        self.state().events.get(&id).cloned().ok_or(DbError::NotFound)
    }

    async fn list_alert_events(&self, rule_id: i64) -> Result<Vec<AlertEvent>, DbError> {
        let mut events: Vec<AlertEvent> = self
            .state()
            .events
            .values()
            .filter(|e| e.alert_rule_id == rule_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at).then(b.id.cmp(&a.id)));
        Ok(events)
    }

    async fn update_alert_status(
        &self,
        id: i64,
        status: AlertStatus,
    ) -> Result<AlertEvent, DbError> {
        let mut state = self.state();
        let now = state.now();
        let event = state.events.get_mut(&id).ok_or(DbError::NotFound)?;
        event.status = status;
        event.resolved_at = match status {
            AlertStatus::Resolved => Some(event.resolved_at.unwrap_or(now)),
            AlertStatus::Open | AlertStatus::Acknowledged => None,
        };
        Ok(event.clone())
    }

    async fn list_deliveries(&self, alert_event_id: i64) -> Result<Vec<AlertDelivery>, DbError> {
        Ok(self
            .state()
            .deliveries
            .iter()
            .filter(|d| d.alert_event_id == alert_event_id)
            .cloned()
            .collect())
    }

    async fn upsert_delivery(&self, delivery: &NewDelivery) -> Result<(), DbError> {
        let mut state = self.state();
        let now = state.now();
        if let Some(existing) = state.deliveries.iter_mut().find(|d| {
            d.alert_event_id == delivery.alert_event_id
                && d.channel == delivery.channel
                && d.target == delivery.target
        }) {
            existing.status = delivery.status;
            existing.attempts += delivery.attempts;
            existing.last_error.clone_from(&delivery.last_error);
            existing.updated_at = now;
            return Ok(());
        }
        let id = state.next_id();
        state.deliveries.push(AlertDelivery {
            id,
            alert_event_id: delivery.alert_event_id,
            channel: delivery.channel,
            target: delivery.target.clone(),
            status: delivery.status,
            attempts: delivery.attempts,
            last_error: delivery.last_error.clone(),
            updated_at: now,
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    async fn pipeline_stats(&self) -> Result<PipelineStats, DbError> {
        let state = self.state();
        let count = |n: usize| i64::try_from(n).unwrap_or(i64::MAX);

        let mut stats = PipelineStats::default();
        for discard in &state.discards {
            *stats
                .discarded
                .entry(discard.reason.as_str().to_string())
                .or_insert(0) += 1;
        }
        stats.duplicates = state
            .runs
            .values()
            .map(|run| i64::from(run.stats.duplicates))
            .sum();
        stats.feedback_total = count(state.feedback.len());
        stats.extraction_pending = count(
            state
                .feedback
                .values()
                .filter(|f| f.extraction_status == ExtractionStatus::Pending)
                .count(),
        );
        stats.extraction_failed = count(
            state
                .feedback
                .values()
                .filter(|f| f.extraction_status == ExtractionStatus::Failed)
                .count(),
        );
        stats.insights_total = count(state.insights.len());
        stats.extraction_batches = count(state.batches.len());
        for batch in &state.batches {
            stats.prompt_tokens += i64::try_from(batch.usage.prompt_tokens).unwrap_or(i64::MAX);
            stats.completion_tokens +=
                i64::try_from(batch.usage.completion_tokens).unwrap_or(i64::MAX);
            stats.cost_usd += batch.usage.cost_usd;
        }
        stats.open_alerts = count(
            state
                .events
                .values()
                .filter(|e| e.status == AlertStatus::Open)
                .count(),
        );
        stats.undelivered_notifications = count(
            state
                .deliveries
                .iter()
                .filter(|d| d.status == DeliveryStatus::Undelivered)
                .count(),
        );
        Ok(stats)
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
