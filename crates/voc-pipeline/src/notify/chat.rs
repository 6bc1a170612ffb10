//! Slack-compatible incoming webhooks.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use voc_core::{ChannelKind, ChannelTarget, Severity};

use super::{AlertNotice, NotificationChannel};
use crate::error::DeliveryError;

pub struct ChatWebhookChannel {
    client: reqwest::Client,
}

impl ChatWebhookChannel {
    /// # Errors
    ///
    /// Returns [`DeliveryError::ChannelUnreachable`] if the HTTP client
    /// cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

fn color(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "#d00000",
        Severity::High => "#f2711c",
        Severity::Medium => "#fbbd08",
        Severity::Low => "#2185d0",
    }
}

/// `text` plus one attachment colored by severity.
#[must_use]
pub fn chat_payload(notice: &AlertNotice) -> Value {
    let mut fields = vec![
        json!({ "title": "Severity", "value": notice.severity.as_str(), "short": true }),
        json!({ "title": "Rule type", "value": notice.rule_type.as_str(), "short": true }),
        json!({ "title": "Condition", "value": notice.condition, "short": false }),
    ];
    if let Some(insight) = &notice.primary_insight {
        fields.push(json!({
            "title": format!("Insight {}", insight.id),
            "value": insight.summary,
            "short": false,
        }));
    }
    json!({
        "text": format!(":rotating_light: {}", notice.subject()),
        "attachments": [{
            "color": color(notice.severity),
            "title": notice.rule_name,
            "text": notice.text_body(),
            "fields": fields,
            "ts": notice.triggered_at.timestamp(),
        }],
    })
}

#[async_trait]
impl NotificationChannel for ChatWebhookChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::ChatWebhook
    }

    async fn send(&self, target: &ChannelTarget, notice: &AlertNotice) -> Result<(), DeliveryError> {
        let ChannelTarget::ChatWebhook { url } = target else {
            return Err(DeliveryError::InvalidTarget(format!(
                "chat channel cannot deliver to {}",
                target.kind()
            )));
        };
        let response = self
            .client
            .post(url)
            .json(&chat_payload(notice))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::notify::testing::notice;

    #[test]
    fn attachment_color_follows_severity() {
        let payload = chat_payload(&notice());
        assert_eq!(payload["attachments"][0]["color"], "#f2711c");
        assert!(payload["text"].as_str().unwrap().contains("Checkout sentiment"));
    }

    #[tokio::test]
    async fn posts_payload_to_hook() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "attachments": [{ "title": "Checkout sentiment" }] })))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;
        let channel = ChatWebhookChannel::new(Duration::from_secs(5)).unwrap();

        channel
            .send(&ChannelTarget::ChatWebhook { url: server.uri() }, &notice())
            .await
            .unwrap();
    }
}
