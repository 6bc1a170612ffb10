//! Alert rules, the events they fire, and per-channel delivery records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

text_enum! {
    RuleType {
        SentimentThreshold => "sentiment_threshold",
        Keyword => "keyword",
        CompetitorMention => "competitor_mention",
        Urgency => "urgency",
        VolumeSpike => "volume_spike",
    }
}

text_enum! {
    Severity {
        Low => "low",
        Medium => "medium",
        High => "high",
        Critical => "critical",
    }
}

text_enum! {
    AlertStatus {
        Open => "open",
        Acknowledged => "acknowledged",
        Resolved => "resolved",
    }
}

impl AlertStatus {
    /// Open and acknowledged events both hold their condition's cooldown.
    #[must_use]
    pub fn is_unresolved(self) -> bool {
        !matches!(self, AlertStatus::Resolved)
    }
}

text_enum! {
    ChannelKind {
        Email => "email",
        Webhook => "webhook",
        ChatWebhook => "chat_webhook",
    }
}

text_enum! {
    DeliveryStatus {
        Delivered => "delivered",
        Undelivered => "undelivered",
    }
}

/// One notification destination configured on a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelTarget {
    Email { to: String },
    Webhook { url: String },
    ChatWebhook { url: String },
}

impl ChannelTarget {
    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelTarget::Email { .. } => ChannelKind::Email,
            ChannelTarget::Webhook { .. } => ChannelKind::Webhook,
            ChannelTarget::ChatWebhook { .. } => ChannelKind::ChatWebhook,
        }
    }

    /// The recipient address or URL.
    #[must_use]
    pub fn address(&self) -> &str {
        match self {
            ChannelTarget::Email { to } => to,
            ChannelTarget::Webhook { url } | ChannelTarget::ChatWebhook { url } => url,
        }
    }
}

pub const DEFAULT_WINDOW_MINUTES: i32 = 60;
pub const DEFAULT_COOLDOWN_MINUTES: i32 = 60;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRule {
    pub id: i64,
    pub name: String,
    pub rule_type: RuleType,
    pub threshold_value: Option<f64>,
    pub keywords: Vec<String>,
    pub competitor_filters: Vec<String>,
    pub channels: Vec<ChannelTarget>,
    pub window_minutes: i32,
    pub cooldown_minutes: i32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl AlertRule {
    #[must_use]
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.window_minutes.max(1)))
    }

    #[must_use]
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.cooldown_minutes.max(0)))
    }
}

#[derive(Debug, Clone)]
pub struct NewAlertRule {
    pub name: String,
    pub rule_type: RuleType,
    pub threshold_value: Option<f64>,
    pub keywords: Vec<String>,
    pub competitor_filters: Vec<String>,
    pub channels: Vec<ChannelTarget>,
    pub window_minutes: i32,
    pub cooldown_minutes: i32,
    pub enabled: bool,
}

impl NewAlertRule {
    /// A rule with default window and cooldown and no terms or channels.
    #[must_use]
    pub fn new(name: impl Into<String>, rule_type: RuleType, threshold_value: Option<f64>) -> Self {
        Self {
            name: name.into(),
            rule_type,
            threshold_value,
            keywords: Vec::new(),
            competitor_filters: Vec::new(),
            channels: Vec::new(),
            window_minutes: DEFAULT_WINDOW_MINUTES,
            cooldown_minutes: DEFAULT_COOLDOWN_MINUTES,
            enabled: true,
        }
    }
}

/// A firing produced by the evaluator.
///
/// `condition_key` identifies the triggering condition; two firings with the
/// same key inside the rule's cooldown are the same alert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlertEvent {
    pub alert_rule_id: i64,
    pub primary_insight_id: Option<i64>,
    pub triggered_at: DateTime<Utc>,
    pub severity: Severity,
    pub condition_key: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub id: i64,
    pub alert_rule_id: i64,
    pub primary_insight_id: Option<i64>,
    pub triggered_at: DateTime<Utc>,
    pub severity: Severity,
    pub status: AlertStatus,
    pub condition_key: String,
    pub payload: serde_json::Value,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertDelivery {
    pub id: i64,
    pub alert_event_id: i64,
    pub channel: ChannelKind,
    pub target: String,
    pub status: DeliveryStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewDelivery {
    pub alert_event_id: i64,
    pub channel: ChannelKind,
    pub target: String,
    pub status: DeliveryStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_targets_use_kind_tag() {
        let targets: Vec<ChannelTarget> = serde_json::from_str(
            r#"[
                {"kind": "email", "to": "ops@example.com"},
                {"kind": "chat_webhook", "url": "https://hooks.example.com/T1"}
            ]"#,
        )
        .unwrap();

        assert_eq!(targets[0].kind(), ChannelKind::Email);
        assert_eq!(targets[0].address(), "ops@example.com");
        assert_eq!(targets[1].kind(), ChannelKind::ChatWebhook);
    }

    #[test]
    fn severity_orders_from_low_to_critical() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn rule_type_parses_snake_case() {
        assert_eq!(
            "volume_spike".parse::<RuleType>().unwrap(),
            RuleType::VolumeSpike
        );
    }
}
