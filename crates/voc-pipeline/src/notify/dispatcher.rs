use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use voc_core::{
    AlertEvent, AppConfig, ChannelKind, ChannelTarget, DeliveryStatus, Insight, NewDelivery,
    SubscriberEvent, WebhookSubscriber,
};
use voc_crawler::{retry_with_backoff, RetryPolicy};
use voc_db::{DbError, Store};

use super::{
    AlertNotice, ChatWebhookChannel, EmailChannel, NotificationChannel, WebhookChannel,
};
use crate::error::DeliveryError;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-target outcome counts for one dispatch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub event_id: i64,
    pub delivered: usize,
    pub undelivered: usize,
    /// Targets already delivered by an earlier dispatch of the same event.
    pub skipped: usize,
}

pub struct NotificationDispatcher {
    store: Arc<dyn Store>,
    channels: HashMap<ChannelKind, Arc<dyn NotificationChannel>>,
    policy: RetryPolicy,
    subscribers: Vec<WebhookSubscriber>,
    subscriber_webhook: Option<Arc<WebhookChannel>>,
}

impl NotificationDispatcher {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, policy: RetryPolicy) -> Self {
        Self {
            store,
            channels: HashMap::new(),
            policy,
            subscribers: Vec::new(),
            subscriber_webhook: None,
        }
    }

    #[must_use]
    pub fn with_channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channels.insert(channel.kind(), channel);
        self
    }

    /// Event subscribers. `alert.triggered` subscribers join every
    /// dispatch as webhook targets; `insight.created` subscribers are posted
    /// through `webhook` by [`Self::publish_insights`].
    #[must_use]
    pub fn with_subscribers(
        mut self,
        webhook: Arc<WebhookChannel>,
        subscribers: Vec<WebhookSubscriber>,
    ) -> Self {
        self.subscribers = subscribers;
        self.subscriber_webhook = Some(webhook);
        self
    }

    /// Dispatcher with the webhook and chat channels, plus email when an
    /// SMTP host is configured.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError`] if a channel cannot be constructed.
    pub fn from_app_config(
        store: Arc<dyn Store>,
        config: &AppConfig,
    ) -> Result<Self, DeliveryError> {
        let policy = RetryPolicy::new(config.notify_max_attempts, config.notify_backoff_base_ms);
        let webhook = Arc::new(WebhookChannel::new(
            config.webhook_secret.clone(),
            SEND_TIMEOUT,
        )?);
        let mut dispatcher = Self::new(store, policy)
            .with_channel(Arc::clone(&webhook) as Arc<dyn NotificationChannel>)
            .with_channel(Arc::new(ChatWebhookChannel::new(SEND_TIMEOUT)?))
            .with_subscribers(webhook, config.webhook_subscribers.clone());
        if let Some(host) = &config.smtp_host {
            dispatcher = dispatcher.with_channel(Arc::new(EmailChannel::new(
                host,
                config.smtp_port,
                config.smtp_username.as_deref(),
                config.smtp_password.as_deref(),
                &config.smtp_from,
                SEND_TIMEOUT,
            )?));
        } else {
            tracing::info!("notify: SMTP host not set, email channel disabled");
        }
        Ok(dispatcher)
    }

    /// Deliver `event_id` to every target on its rule and to every
    /// `alert.triggered` subscriber.
    ///
    /// Targets are attempted concurrently and independently; each outcome is
    /// persisted as a delivery record. Re-dispatching an event only retries
    /// targets that are not yet delivered.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the event or its rule cannot be loaded.
    /// Delivery failures are recorded, not returned.
    pub async fn dispatch(&self, event_id: i64) -> Result<DispatchReport, DbError> {
        let event = self.store.get_alert_event(event_id).await?;
        let rule = self.store.get_alert_rule(event.alert_rule_id).await?;
        let primary = self.primary_insight(&event).await;
        let notice = AlertNotice::new(&rule, &event, primary.as_ref());

        let delivered: HashSet<(ChannelKind, String)> = self
            .store
            .list_deliveries(event_id)
            .await?
            .into_iter()
            .filter(|d| d.status == DeliveryStatus::Delivered)
            .map(|d| (d.channel, d.target))
            .collect();

        let mut report = DispatchReport {
            event_id,
            ..DispatchReport::default()
        };
        let subscribed: Vec<ChannelTarget> = self
            .subscribers
            .iter()
            .filter(|s| s.wants(SubscriberEvent::AlertTriggered))
            .map(|s| ChannelTarget::Webhook { url: s.url.clone() })
            .collect();

        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        for target in rule.channels.iter().chain(&subscribed) {
            let key = (target.kind(), target.address().to_string());
            if !seen.insert(key.clone()) {
                continue;
            }
            if delivered.contains(&key) {
                report.skipped += 1;
            } else {
                pending.push(target);
            }
        }

        let outcomes = join_all(
            pending
                .into_iter()
                .map(|target| self.deliver(event_id, target, &notice)),
        )
        .await;
        for ok in outcomes {
            if ok {
                report.delivered += 1;
            } else {
                report.undelivered += 1;
            }
        }

        tracing::info!(
            event_id,
            delivered = report.delivered,
            undelivered = report.undelivered,
            skipped = report.skipped,
            "notify: dispatch complete"
        );
        Ok(report)
    }

    /// Post `insight.created` for each insight to every subscriber of that
    /// event. Failures are logged, not recorded. Returns the number of posts
    /// delivered.
    pub async fn publish_insights(&self, insights: &[Insight]) -> usize {
        let Some(webhook) = self.subscriber_webhook.as_deref() else {
            return 0;
        };
        let urls: Vec<&str> = self
            .subscribers
            .iter()
            .filter(|s| s.wants(SubscriberEvent::InsightCreated))
            .map(|s| s.url.as_str())
            .collect();
        if urls.is_empty() {
            return 0;
        }

        let posts = insights.iter().flat_map(|insight| {
            urls.iter().map(move |url| async move {
                let (result, attempts) = retry_with_backoff(self.policy, "notify", |_| {
                    webhook.post_event(url, SubscriberEvent::InsightCreated, insight.id, insight)
                })
                .await;
                if let Err(e) = &result {
                    tracing::warn!(
                        insight_id = insight.id,
                        url = %url,
                        attempts,
                        error = %e,
                        "notify: insight.created delivery failed"
                    );
                }
                result.is_ok()
            })
        });
        let delivered = join_all(posts).await.into_iter().filter(|ok| *ok).count();
        tracing::debug!(
            insights = insights.len(),
            subscribers = urls.len(),
            delivered,
            "notify: insight.created published"
        );
        delivered
    }

    async fn primary_insight(&self, event: &AlertEvent) -> Option<voc_core::Insight> {
        let id = event.primary_insight_id?;
        match self.store.get_insight(id).await {
            Ok(insight) => Some(insight),
            Err(e) => {
                tracing::warn!(event_id = event.id, insight_id = id, error = %e, "notify: primary insight unavailable");
                None
            }
        }
    }

    /// Attempt one target and persist the outcome. Attempts accumulate on
    /// the delivery record. Returns whether it was delivered.
    async fn deliver(
        &self,
        event_id: i64,
        target: &ChannelTarget,
        notice: &AlertNotice,
    ) -> bool {
        let (result, attempts) = match self.channels.get(&target.kind()) {
            Some(channel) => {
                retry_with_backoff(self.policy, "notify", move |_| channel.send(target, notice))
                    .await
            }
            None => (Err(DeliveryError::NotConfigured(target.kind())), 0),
        };

        let (status, last_error) = match &result {
            Ok(()) => (DeliveryStatus::Delivered, None),
            Err(e) => {
                tracing::warn!(
                    event_id,
                    channel = %target.kind(),
                    target = target.address(),
                    attempts,
                    error = %e,
                    "notify: delivery failed"
                );
                (DeliveryStatus::Undelivered, Some(e.to_string()))
            }
        };

        let record = NewDelivery {
            alert_event_id: event_id,
            channel: target.kind(),
            target: target.address().to_string(),
            status,
            attempts: i32::try_from(attempts).unwrap_or(i32::MAX),
            last_error,
        };
        if let Err(e) = self.store.upsert_delivery(&record).await {
            tracing::error!(event_id, error = %e, "notify: failed to record delivery");
        }
        status == DeliveryStatus::Delivered
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use voc_core::{
        CustomerContext, NewAlertEvent, NewAlertRule, RuleType, SentimentLabel, Severity,
    };
    use voc_db::MemoryStore;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::notify::webhook::{EVENT_HEADER, EVENT_TYPE_HEADER};

    use super::*;

    struct FakeChannel {
        kind: ChannelKind,
        fail_first: u32,
        calls: AtomicU32,
    }

    impl FakeChannel {
        fn new(kind: ChannelKind, fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                kind,
                fail_first,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl NotificationChannel for FakeChannel {
        fn kind(&self) -> ChannelKind {
            self.kind
        }

        async fn send(&self, _: &ChannelTarget, _: &AlertNotice) -> Result<(), DeliveryError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                Err(DeliveryError::ChannelUnreachable("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    async fn event_with(store: &MemoryStore, channels: Vec<ChannelTarget>) -> i64 {
        let mut rule = NewAlertRule::new("Dip", RuleType::SentimentThreshold, Some(3.0));
        rule.channels = channels;
        let rule = store.insert_alert_rule(&rule).await.unwrap();
        store
            .create_alert_event(
                &NewAlertEvent {
                    alert_rule_id: rule.id,
                    primary_insight_id: None,
                    triggered_at: Utc::now(),
                    severity: Severity::High,
                    condition_key: "sentiment_below".to_string(),
                    payload: json!({}),
                },
                Utc::now(),
            )
            .await
            .unwrap()
            .unwrap()
            .id
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_then_recorded_delivered() {
        let store = Arc::new(MemoryStore::new());
        let event_id = event_with(
            &store,
            vec![ChannelTarget::Webhook {
                url: "https://hooks.example.com/a".to_string(),
            }],
        )
        .await;
        let hook = FakeChannel::new(ChannelKind::Webhook, 1);
        let dispatcher = NotificationDispatcher::new(
            Arc::clone(&store) as Arc<dyn Store>,
            RetryPolicy::new(3, 100),
        )
        .with_channel(hook.clone());

        let report = dispatcher.dispatch(event_id).await.unwrap();

        assert_eq!(report.delivered, 1);
        let deliveries = store.list_deliveries(event_id).await.unwrap();
        assert_eq!(deliveries[0].status, DeliveryStatus::Delivered);
        assert_eq!(deliveries[0].attempts, 2);
    }

    #[tokio::test]
    async fn missing_channel_is_recorded_undelivered() {
        let store = Arc::new(MemoryStore::new());
        let event_id = event_with(
            &store,
            vec![ChannelTarget::Email {
                to: "ops@example.com".to_string(),
            }],
        )
        .await;
        let dispatcher = NotificationDispatcher::new(
            Arc::clone(&store) as Arc<dyn Store>,
            RetryPolicy::new(3, 100),
        );

        let report = dispatcher.dispatch(event_id).await.unwrap();

        assert_eq!(report.undelivered, 1);
        let delivery = &store.list_deliveries(event_id).await.unwrap()[0];
        assert_eq!(delivery.status, DeliveryStatus::Undelivered);
        assert_eq!(delivery.attempts, 0);
        assert_eq!(delivery.last_error.as_deref(), Some("no email channel configured"));
    }

    fn subscriber(url: &str, events: &[SubscriberEvent]) -> WebhookSubscriber {
        WebhookSubscriber {
            url: url.to_string(),
            events: events.to_vec(),
        }
    }

    #[tokio::test]
    async fn alert_subscribers_join_the_rule_targets() {
        let store = Arc::new(MemoryStore::new());
        let event_id = event_with(
            &store,
            vec![ChannelTarget::Webhook {
                url: "https://hooks.example.com/a".to_string(),
            }],
        )
        .await;
        let hook = FakeChannel::new(ChannelKind::Webhook, 0);
        let webhook = Arc::new(WebhookChannel::new(None, SEND_TIMEOUT).unwrap());
        let dispatcher = NotificationDispatcher::new(
            Arc::clone(&store) as Arc<dyn Store>,
            RetryPolicy::new(1, 0),
        )
        .with_channel(hook.clone())
        .with_subscribers(
            webhook,
            vec![
                subscriber("https://ops.example.com/in", &[SubscriberEvent::AlertTriggered]),
                subscriber("https://bi.example.com/in", &[SubscriberEvent::InsightCreated]),
                subscriber("https://hooks.example.com/a", SubscriberEvent::ALL),
            ],
        );

        let report = dispatcher.dispatch(event_id).await.unwrap();

        assert_eq!(report.delivered, 2);
        assert_eq!(hook.calls.load(Ordering::SeqCst), 2);
        let mut targets: Vec<_> = store
            .list_deliveries(event_id)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.target)
            .collect();
        targets.sort();
        assert_eq!(
            targets,
            vec!["https://hooks.example.com/a", "https://ops.example.com/in"]
        );
    }

    #[tokio::test]
    async fn insight_created_goes_only_to_its_subscribers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bi"))
            .and(header(EVENT_TYPE_HEADER, "insight.created"))
            .and(header(EVENT_HEADER, "5"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ops"))
            .respond_with(ResponseTemplate::new(202))
            .expect(0)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let webhook = Arc::new(WebhookChannel::new(None, SEND_TIMEOUT).unwrap());
        let dispatcher = NotificationDispatcher::new(
            Arc::clone(&store) as Arc<dyn Store>,
            RetryPolicy::new(1, 0),
        )
        .with_subscribers(
            webhook,
            vec![
                subscriber(&format!("{}/bi", server.uri()), &[SubscriberEvent::InsightCreated]),
                subscriber(&format!("{}/ops", server.uri()), &[SubscriberEvent::AlertTriggered]),
            ],
        );
        let insight = Insight {
            id: 5,
            feedback_id: 9,
            sentiment_score: -0.4,
            sentiment_label: SentimentLabel::Negative,
            sentiment_confidence: 0.8,
            summary: "Export to CSV drops columns".to_string(),
            pain_points: vec![],
            feature_requests: vec![],
            competitor_mentions: vec![],
            customer_context: CustomerContext::default(),
            journey_stage: None,
            urgency_level: 3,
            themes: vec![],
            created_at: Utc::now(),
        };

        assert_eq!(dispatcher.publish_insights(&[insight]).await, 1);

        let received = &server.received_requests().await.unwrap()[0];
        let json: serde_json::Value = serde_json::from_slice(&received.body).unwrap();
        assert_eq!(json["event_type"], "insight.created");
        assert_eq!(json["data"]["id"], 5);
    }

    #[tokio::test(start_paused = true)]
    async fn redispatch_skips_delivered_targets() {
        let store = Arc::new(MemoryStore::new());
        let event_id = event_with(
            &store,
            vec![
                ChannelTarget::Webhook {
                    url: "https://hooks.example.com/a".to_string(),
                },
                ChannelTarget::ChatWebhook {
                    url: "https://chat.example.com/b".to_string(),
                },
            ],
        )
        .await;
        let hook = FakeChannel::new(ChannelKind::Webhook, 0);
        let chat = FakeChannel::new(ChannelKind::ChatWebhook, 3);
        let dispatcher = NotificationDispatcher::new(
            Arc::clone(&store) as Arc<dyn Store>,
            RetryPolicy::new(3, 100),
        )
        .with_channel(hook.clone())
        .with_channel(chat.clone());

        let first = dispatcher.dispatch(event_id).await.unwrap();
        assert_eq!((first.delivered, first.undelivered), (1, 1));

        let second = dispatcher.dispatch(event_id).await.unwrap();
        assert_eq!(second.skipped, 1);
        assert_eq!(second.delivered, 1);
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
        assert_eq!(chat.calls.load(Ordering::SeqCst), 4);

        let chat_row = store
            .list_deliveries(event_id)
            .await
            .unwrap()
            .into_iter()
            .find(|d| d.channel == ChannelKind::ChatWebhook)
            .unwrap();
        assert_eq!(chat_row.status, DeliveryStatus::Delivered);
        assert_eq!(chat_row.attempts, 4);
        assert_eq!(chat_row.last_error, None);
    }
}
