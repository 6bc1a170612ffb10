//! Alert rule evaluation.
//!
//! [`evaluate_rule`] is pure: given a rule and the insights in its current
//! and preceding windows it returns the conditions that hold. The
//! [`AlertEvaluator`] feeds it from the store and hands each firing to
//! [`Store::create_alert_event`], which applies the cooldown atomically per
//! rule.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use voc_core::{AlertEvent, AlertRule, AlertStatus, NewAlertEvent, RuleType, Severity, WindowInsight};
use voc_db::{DbError, Store};

/// Threshold used when a `sentiment_threshold` rule has none: below neutral.
pub const DEFAULT_SENTIMENT_THRESHOLD: f64 = 3.0;
/// Threshold used when an `urgency` rule has none.
pub const DEFAULT_URGENCY_THRESHOLD: f64 = 4.0;
/// Ratio used when a `volume_spike` rule has none.
pub const DEFAULT_SPIKE_RATIO: f64 = 2.0;
/// A spike needs at least this many negative insights in the current window.
pub const MIN_SPIKE_VOLUME: usize = 3;

const MAX_PAYLOAD_IDS: usize = 25;

/// One condition that holds for a rule in the current window.
#[derive(Debug, Clone, PartialEq)]
pub struct Firing {
    /// Stable identifier of the condition; unchanged conditions share a key.
    pub condition_key: String,
    pub severity: Severity,
    pub primary_insight_id: Option<i64>,
    /// Observed value compared against the threshold.
    pub metric: f64,
    pub threshold: f64,
    pub insight_ids: Vec<i64>,
}

/// Evaluate `rule` against the insights of its current window and of the
/// equally long window before it.
#[must_use]
pub fn evaluate_rule(
    rule: &AlertRule,
    current: &[&WindowInsight],
    previous: &[&WindowInsight],
) -> Vec<Firing> {
    match rule.rule_type {
        RuleType::SentimentThreshold => sentiment_firing(rule, current).into_iter().collect(),
        RuleType::VolumeSpike => volume_firing(rule, current, previous).into_iter().collect(),
        RuleType::Urgency => urgency_firing(rule, current).into_iter().collect(),
        RuleType::Keyword => term_firings(rule, current, "keyword", &rule.keywords, |w, term| {
            searchable_text(w).contains(term)
        }),
        RuleType::CompetitorMention => term_firings(
            rule,
            current,
            "competitor",
            &rule.competitor_filters,
            |w, term| {
                w.insight
                    .competitor_mentions
                    .iter()
                    .any(|m| m.competitor_name.to_lowercase() == term)
                    || searchable_text(w).contains(term)
            },
        ),
    }
}

fn sentiment_firing(rule: &AlertRule, current: &[&WindowInsight]) -> Option<Firing> {
    if current.is_empty() {
        return None;
    }
    let threshold = rule.threshold_value.unwrap_or(DEFAULT_SENTIMENT_THRESHOLD);
    #[allow(clippy::cast_precision_loss)]
    let average = current
        .iter()
        .map(|w| w.insight.sentiment_rating())
        .sum::<f64>()
        / current.len() as f64;
    if average >= threshold {
        return None;
    }
    let deficit = threshold - average;
    let severity = if deficit >= 1.0 {
        Severity::Critical
    } else if deficit >= 0.5 {
        Severity::High
    } else if deficit >= 0.2 {
        Severity::Medium
    } else {
        Severity::Low
    };
    Some(Firing {
        condition_key: "sentiment_below".to_string(),
        severity,
        primary_insight_id: most_negative(current),
        metric: average,
        threshold,
        insight_ids: ids(current),
    })
}

fn volume_firing(
    rule: &AlertRule,
    current: &[&WindowInsight],
    previous: &[&WindowInsight],
) -> Option<Firing> {
    let ratio = rule
        .threshold_value
        .filter(|r| *r > 0.0)
        .unwrap_or(DEFAULT_SPIKE_RATIO);
    let negative: Vec<&WindowInsight> = current
        .iter()
        .copied()
        .filter(|w| w.insight.is_negative())
        .collect();
    let prior = previous.iter().filter(|w| w.insight.is_negative()).count();
    #[allow(clippy::cast_precision_loss)]
    let (now_count, prior_count) = (negative.len() as f64, prior as f64);

    if negative.len() < MIN_SPIKE_VOLUME || now_count <= prior_count * ratio {
        return None;
    }
    let observed = now_count / prior_count.max(1.0);
    let over = observed / ratio;
    let severity = if over >= 3.0 {
        Severity::Critical
    } else if over >= 2.0 {
        Severity::High
    } else if over >= 1.5 {
        Severity::Medium
    } else {
        Severity::Low
    };
    Some(Firing {
        condition_key: "volume_spike".to_string(),
        severity,
        primary_insight_id: most_negative(&negative),
        metric: observed,
        threshold: ratio,
        insight_ids: ids(&negative),
    })
}

fn urgency_firing(rule: &AlertRule, current: &[&WindowInsight]) -> Option<Firing> {
    let threshold = rule.threshold_value.unwrap_or(DEFAULT_URGENCY_THRESHOLD);
    let urgent: Vec<&WindowInsight> = current
        .iter()
        .copied()
        .filter(|w| f64::from(w.insight.urgency_level) >= threshold)
        .collect();
    let top = urgent
        .iter()
        .max_by_key(|w| (w.insight.urgency_level, w.insight.created_at))?;
    let level = top.insight.urgency_level;
    let severity = match level {
        5.. => Severity::Critical,
        4 => Severity::High,
        3 => Severity::Medium,
        _ => Severity::Low,
    };
    Some(Firing {
        condition_key: format!("urgency:{level}"),
        severity,
        primary_insight_id: Some(top.insight.id),
        metric: f64::from(level),
        threshold,
        insight_ids: ids(&urgent),
    })
}

/// One firing per configured term present in the window. A rule threshold,
/// when set, is the minimum number of matching insights.
fn term_firings(
    rule: &AlertRule,
    current: &[&WindowInsight],
    prefix: &str,
    terms: &[String],
    matches: impl Fn(&WindowInsight, &str) -> bool,
) -> Vec<Firing> {
    let min_matches = rule.threshold_value.unwrap_or(1.0).max(1.0);
    let mut by_term: BTreeMap<String, Vec<&WindowInsight>> = BTreeMap::new();
    for term in terms {
        let term = term.trim().to_lowercase();
        if term.is_empty() || by_term.contains_key(&term) {
            continue;
        }
        let hits: Vec<&WindowInsight> = current
            .iter()
            .copied()
            .filter(|w: &&WindowInsight| matches(*w, &term))
            .collect();
        by_term.insert(term, hits);
    }

    by_term
        .into_iter()
        .filter_map(|(term, hits)| {
            #[allow(clippy::cast_precision_loss)]
            let count = hits.len() as f64;
            if hits.is_empty() || count < min_matches {
                return None;
            }
            Some(Firing {
                condition_key: format!("{prefix}:{term}"),
                severity: volume_severity(hits.len()),
                primary_insight_id: most_negative(&hits),
                metric: count,
                threshold: min_matches,
                insight_ids: ids(&hits),
            })
        })
        .collect()
}

fn volume_severity(count: usize) -> Severity {
    match count {
        10.. => Severity::High,
        5..=9 => Severity::Medium,
        _ => Severity::Low,
    }
}

fn searchable_text(w: &WindowInsight) -> String {
    let mut text = w.insight.classification_text();
    text.push('\n');
    text.push_str(&w.content);
    text.to_lowercase()
}

/// The lowest-scored insight, latest first on ties.
fn most_negative(window: &[&WindowInsight]) -> Option<i64> {
    window
        .iter()
        .min_by(|a, b| {
            a.insight
                .sentiment_score
                .total_cmp(&b.insight.sentiment_score)
                .then(b.insight.created_at.cmp(&a.insight.created_at))
        })
        .map(|w| w.insight.id)
}

fn urgency_level(condition_key: &str) -> Option<i16> {
    condition_key.strip_prefix("urgency:")?.parse().ok()
}

fn ids(window: &[&WindowInsight]) -> Vec<i64> {
    window.iter().map(|w| w.insight.id).collect()
}

/// Result of one evaluation pass over all enabled rules.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub rules_evaluated: usize,
    /// Events created this cycle.
    pub events: Vec<AlertEvent>,
    /// Firings absorbed by an unresolved event inside the cooldown.
    pub suppressed: usize,
    /// Rules whose evaluation failed; other rules were still evaluated.
    pub failed_rules: Vec<i64>,
}

pub struct AlertEvaluator {
    store: Arc<dyn Store>,
}

impl AlertEvaluator {
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Evaluate every enabled rule as of `now`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] only if the rules or the window cannot be loaded.
    /// Failures for a single rule are logged and reported in
    /// [`CycleReport::failed_rules`].
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport, DbError> {
        let rules = self.store.list_enabled_alert_rules().await?;
        let mut report = CycleReport {
            rules_evaluated: rules.len(),
            ..CycleReport::default()
        };
        if rules.is_empty() {
            tracing::debug!("alerts: no enabled rules");
            return Ok(report);
        }

        let longest = rules
            .iter()
            .map(AlertRule::window)
            .max()
            .unwrap_or_else(|| chrono::Duration::minutes(60));
        let insights = self.store.list_insights_since(now - longest * 2).await?;

        for rule in &rules {
            match self.evaluate_one(rule, &insights, now).await {
                Ok((created, suppressed)) => {
                    report.events.extend(created);
                    report.suppressed += suppressed;
                }
                Err(e) => {
                    tracing::error!(rule_id = rule.id, error = %e, "alerts: rule evaluation failed");
                    report.failed_rules.push(rule.id);
                }
            }
        }

        tracing::info!(
            rules = report.rules_evaluated,
            created = report.events.len(),
            suppressed = report.suppressed,
            failed = report.failed_rules.len(),
            "alerts: cycle complete"
        );
        Ok(report)
    }

    async fn evaluate_one(
        &self,
        rule: &AlertRule,
        insights: &[WindowInsight],
        now: DateTime<Utc>,
    ) -> Result<(Vec<AlertEvent>, usize), DbError> {
        let window = rule.window();
        let current_start = now - window;
        let previous_start = current_start - window;
        let current: Vec<&WindowInsight> = insights
            .iter()
            .filter(|w| w.insight.created_at >= current_start && w.insight.created_at <= now)
            .collect();
        let previous: Vec<&WindowInsight> = insights
            .iter()
            .filter(|w| {
                w.insight.created_at >= previous_start && w.insight.created_at < current_start
            })
            .collect();

        let cooldown_since = now - rule.cooldown();
        let held_urgency = if rule.rule_type == RuleType::Urgency {
            self.held_urgency_level(rule.id, cooldown_since).await?
        } else {
            None
        };

        let mut created = Vec::new();
        let mut suppressed = 0;
        for firing in evaluate_rule(rule, &current, &previous) {
            if let (Some(held), Some(level)) = (held_urgency, urgency_level(&firing.condition_key)) {
                if level < held {
                    tracing::debug!(
                        rule_id = rule.id,
                        level,
                        held,
                        "alerts: higher urgency still unresolved"
                    );
                    suppressed += 1;
                    continue;
                }
            }
            let event = NewAlertEvent {
                alert_rule_id: rule.id,
                primary_insight_id: firing.primary_insight_id,
                triggered_at: now,
                severity: firing.severity,
                condition_key: firing.condition_key.clone(),
                payload: payload(rule, &firing, current.len()),
            };
            match self
                .store
                .create_alert_event(&event, cooldown_since)
                .await?
            {
                Some(event) => {
                    tracing::info!(
                        rule_id = rule.id,
                        event_id = event.id,
                        condition = %event.condition_key,
                        severity = %event.severity,
                        "alerts: event created"
                    );
                    created.push(event);
                }
                None => {
                    tracing::debug!(
                        rule_id = rule.id,
                        condition = %firing.condition_key,
                        "alerts: within cooldown"
                    );
                    suppressed += 1;
                }
            }
        }
        Ok((created, suppressed))
    }

    /// Highest urgency level among the rule's unresolved events inside the
    /// cooldown.
    async fn held_urgency_level(
        &self,
        rule_id: i64,
        cooldown_since: DateTime<Utc>,
    ) -> Result<Option<i16>, DbError> {
        Ok(self
            .store
            .list_alert_events(rule_id)
            .await?
            .iter()
            .filter(|e| e.status.is_unresolved() && e.triggered_at >= cooldown_since)
            .filter_map(|e| urgency_level(&e.condition_key))
            .max())
    }

    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] for an unknown event.
    pub async fn acknowledge(&self, event_id: i64) -> Result<AlertEvent, DbError> {
        self.store
            .update_alert_status(event_id, AlertStatus::Acknowledged)
            .await
    }

    /// Resolve an event. A later breach of the same condition fires again.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] for an unknown event.
    pub async fn resolve(&self, event_id: i64) -> Result<AlertEvent, DbError> {
        self.store
            .update_alert_status(event_id, AlertStatus::Resolved)
            .await
    }
}

fn payload(rule: &AlertRule, firing: &Firing, window_size: usize) -> serde_json::Value {
    let shown: Vec<i64> = firing.insight_ids.iter().take(MAX_PAYLOAD_IDS).copied().collect();
    json!({
        "rule_name": rule.name,
        "rule_type": rule.rule_type.as_str(),
        "condition": firing.condition_key,
        "metric": firing.metric,
        "threshold": firing.threshold,
        "window_minutes": rule.window_minutes,
        "window_insights": window_size,
        "insight_count": firing.insight_ids.len(),
        "insight_ids": shown,
    })
}

#[cfg(test)]
#[path = "alerts_test.rs"]
mod tests;
