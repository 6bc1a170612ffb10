//! Outbound alert notifications.
//!
//! Each [`NotificationChannel`] delivers an [`AlertNotice`] to one
//! [`ChannelTarget`]. The [`NotificationDispatcher`] fans an event out to all
//! of its rule's targets and to `alert.triggered` subscribers, recording the
//! outcome per target. It also posts `insight.created` to subscribers.

pub mod chat;
pub mod dispatcher;
pub mod email;
pub mod webhook;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use voc_core::{
    AlertEvent, AlertRule, ChannelKind, ChannelTarget, Insight, RuleType, Severity,
    SubscriberEvent,
};

use crate::error::DeliveryError;

pub use chat::ChatWebhookChannel;
pub use dispatcher::{DispatchReport, NotificationDispatcher};
pub use email::EmailChannel;
pub use webhook::{sign_payload, verify_signature, WebhookChannel};

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Deliver `notice` to `target`. One call is one attempt.
    async fn send(&self, target: &ChannelTarget, notice: &AlertNotice) -> Result<(), DeliveryError>;
}

/// Body of every webhook post.
#[derive(Debug, Serialize)]
pub struct EventEnvelope<'a, T> {
    pub event_type: SubscriberEvent,
    pub timestamp: DateTime<Utc>,
    pub data: &'a T,
}

/// The insight an alert points at, trimmed for notifications.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoticeInsight {
    pub id: i64,
    pub summary: String,
    pub sentiment_score: f64,
    pub urgency_level: i16,
}

/// Everything a channel needs to describe one alert event.
///
/// Serialized as-is for webhook bodies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertNotice {
    pub event_id: i64,
    pub rule_id: i64,
    pub rule_name: String,
    pub rule_type: RuleType,
    pub severity: Severity,
    pub condition: String,
    pub triggered_at: DateTime<Utc>,
    pub primary_insight: Option<NoticeInsight>,
    pub details: serde_json::Value,
}

impl AlertNotice {
    #[must_use]
    pub fn new(rule: &AlertRule, event: &AlertEvent, primary: Option<&Insight>) -> Self {
        Self {
            event_id: event.id,
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            rule_type: rule.rule_type,
            severity: event.severity,
            condition: event.condition_key.clone(),
            triggered_at: event.triggered_at,
            primary_insight: primary.map(|i| NoticeInsight {
                id: i.id,
                summary: i.summary.clone(),
                sentiment_score: i.sentiment_score,
                urgency_level: i.urgency_level,
            }),
            details: event.payload.clone(),
        }
    }

    #[must_use]
    pub fn subject(&self) -> String {
        format!("[voc][{}] {}", self.severity, self.rule_name)
    }

    /// Plain-text rendering shared by email and chat.
    #[must_use]
    pub fn text_body(&self) -> String {
        let mut lines = vec![
            format!("Rule: {} ({})", self.rule_name, self.rule_type),
            format!("Severity: {}", self.severity),
            format!("Condition: {}", self.condition),
            format!("Triggered: {}", self.triggered_at.to_rfc3339()),
        ];
        if let Some(count) = self.details.get("insight_count").and_then(serde_json::Value::as_u64) {
            lines.push(format!("Matching insights: {count}"));
        }
        if let Some(insight) = &self.primary_insight {
            lines.push(format!("Example (insight {}): {}", insight.id, insight.summary));
        }
        lines.join("\n")
    }
}
