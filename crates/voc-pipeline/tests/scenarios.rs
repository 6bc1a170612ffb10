//! Whole-pipeline scenarios over the in-memory store and queue.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use voc_core::{
    ChannelKind, ChannelTarget, CrawlStatus, DeliveryStatus, ExtractionStatus, NewAlertRule,
    NewSource, Platform, RedditConfig, RedditSort, RedditTimeFilter, RuleType, Severity,
    SourceConfig,
};
use voc_crawler::{AdapterRegistry, CrawlError, CrawlerAdapter, FetchOutcome, RawRecord, RetryPolicy};
use voc_db::{JobQueue, MemoryJobQueue, MemoryStore, QueueName, Store};
use voc_pipeline::notify::AlertNotice;
use voc_pipeline::{
    process_next, AlertEvaluator, ClassifierConfig, Cleaner, Completion, CompletionClient,
    CompletionRequest, CrawlScheduler, DeliveryError, ExtractorConfig, InsightExtractor, JobContext,
    LlmError, NotificationChannel, NotificationDispatcher, Processed, SchedulerConfig, Taxonomy,
    ThemeClassifier, WorkerConfig,
};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

enum Fetch {
    Records(Vec<RawRecord>),
    RateLimited(u64),
    Hang,
}

struct FakeReddit {
    fetch: Fetch,
    calls: AtomicU32,
}

#[async_trait]
impl CrawlerAdapter for FakeReddit {
    fn platform(&self) -> Platform {
        Platform::Reddit
    }

    async fn fetch(&self, _config: &SourceConfig, _limit: usize) -> FetchOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.fetch {
            Fetch::Records(records) => FetchOutcome::complete(records.clone()),
            Fetch::RateLimited(secs) => FetchOutcome::failed(CrawlError::RateLimited {
                retry_after_secs: *secs,
            }),
            Fetch::Hang => std::future::pending().await,
        }
    }
}

/// Answers every item with the same negative pricing complaint.
struct CannedLlm;

#[async_trait]
impl CompletionClient for CannedLlm {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let results: Vec<Value> = request
            .user
            .lines()
            .filter(|l| l.starts_with('{'))
            .filter_map(|l| serde_json::from_str::<Value>(l).ok())
            .filter_map(|v| v["feedback_id"].as_i64())
            .map(|id| {
                json!({
                    "feedback_id": id,
                    "sentiment": { "score": -0.3, "label": "negative", "confidence": 0.9 },
                    "summary": "Prices went up and the subscription is too expensive",
                    "pain_points": [{ "description": "price increase", "severity": "high" }],
                    "feature_requests": [],
                    "competitor_mentions": [],
                    "customer_context": {},
                    "journey_stage": "retention",
                    "urgency_level": 3,
                    "themes": ["pricing"]
                })
            })
            .collect();
        Ok(Completion {
            content: json!({ "results": results }).to_string(),
            prompt_tokens: 800,
            completion_tokens: 300,
        })
    }
}

#[derive(Default)]
struct RecordingWebhook {
    sent: Mutex<Vec<(String, i64)>>,
}

#[async_trait]
impl NotificationChannel for RecordingWebhook {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    async fn send(&self, target: &ChannelTarget, notice: &AlertNotice) -> Result<(), DeliveryError> {
        self.sent
            .lock()
            .unwrap()
            .push((target.address().to_string(), notice.event_id));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Harness {
    store: Arc<MemoryStore>,
    queue: Arc<MemoryJobQueue>,
    adapter: Arc<FakeReddit>,
    webhook: Arc<RecordingWebhook>,
    ctx: JobContext,
    scheduler: CrawlScheduler,
}

fn harness(fetch: Fetch) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let dyn_store = Arc::clone(&store) as Arc<dyn Store>;
    let dyn_queue = Arc::clone(&queue) as Arc<dyn JobQueue>;

    let adapter = Arc::new(FakeReddit {
        fetch,
        calls: AtomicU32::new(0),
    });
    let webhook = Arc::new(RecordingWebhook::default());
    let registry = AdapterRegistry::new().with(Arc::clone(&adapter) as Arc<dyn CrawlerAdapter>);

    let extractor = InsightExtractor::new(
        Arc::clone(&dyn_store),
        Arc::new(CannedLlm),
        ExtractorConfig {
            backoff_base_ms: 10,
            ..ExtractorConfig::default()
        },
    );
    let classifier = ThemeClassifier::new(
        Arc::clone(&dyn_store),
        None,
        &Taxonomy::builtin().unwrap(),
        ClassifierConfig::default(),
    )
    .unwrap();
    let dispatcher = NotificationDispatcher::new(Arc::clone(&dyn_store), RetryPolicy::new(2, 10))
        .with_channel(Arc::clone(&webhook) as Arc<dyn NotificationChannel>);

    let ctx = JobContext {
        store: Arc::clone(&dyn_store),
        queue: Arc::clone(&dyn_queue),
        registry: Arc::new(registry),
        cleaner: Cleaner::default(),
        extractor: Arc::new(extractor),
        classifier: Arc::new(classifier),
        evaluator: Arc::new(AlertEvaluator::new(Arc::clone(&dyn_store))),
        dispatcher: Arc::new(dispatcher),
        fetch_limit: 50,
    };
    let scheduler = CrawlScheduler::new(dyn_store, dyn_queue, SchedulerConfig::default());

    Harness {
        store,
        queue,
        adapter,
        webhook,
        ctx,
        scheduler,
    }
}

fn reddit_source() -> NewSource {
    NewSource {
        name: "r/saas".to_string(),
        config: SourceConfig::Reddit(RedditConfig {
            subreddit: "saas".to_string(),
            query: Some("pricing".to_string()),
            sort: RedditSort::New,
            time_filter: RedditTimeFilter::Day,
        }),
        cadence_minutes: Some(60),
        is_active: true,
    }
}

fn post(external_id: &str, content: &str) -> RawRecord {
    RawRecord {
        external_id: external_id.to_string(),
        content: content.to_string(),
        title: None,
        author_handle: Some("u/someone".to_string()),
        url: Some(format!("https://reddit.com/r/saas/comments/{external_id}")),
        posted_at: Some(Utc::now()),
        metadata: json!({ "subreddit": "saas" }),
    }
}

const COMPLAINT: &str =
    "They raised prices again this year and our subscription is now far too expensive for us.";

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        visibility: Duration::from_secs(60),
        max_attempts: 3,
        retry_base: Duration::from_secs(1),
        idle_poll: Duration::from_millis(10),
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn crawl_to_notification_end_to_end() {
    let h = harness(Fetch::Records(vec![
        post("t3_a", COMPLAINT),
        post("t3_b", COMPLAINT),
        post("t3_c", "too short"),
    ]));
    let source = h.store.insert_source(&reddit_source()).await.unwrap();
    let mut rule = NewAlertRule::new("Pricing sentiment", RuleType::SentimentThreshold, Some(3.0));
    rule.channels = vec![
        ChannelTarget::Webhook {
            url: "https://hooks.example.com/voc".to_string(),
        },
        ChannelTarget::Email {
            to: "ops@example.com".to_string(),
        },
    ];
    let rule = h.store.insert_alert_rule(&rule).await.unwrap();
    let config = worker_config();

    // Scheduling and crawling.
    let tick = h.scheduler.tick(Utc::now()).await.unwrap();
    assert_eq!(tick.enqueued.len(), 1);
    let run_id = tick.enqueued[0].id;
    assert_eq!(
        process_next(&h.ctx, QueueName::Crawl, &config).await.unwrap(),
        Processed::Acked
    );

    let run = h.store.get_crawl_run(run_id).await.unwrap();
    assert_eq!(run.status, CrawlStatus::Succeeded);
    assert_eq!(
        (run.stats.fetched, run.stats.stored, run.stats.duplicates, run.stats.discarded),
        (3, 1, 1, 1)
    );
    let feedback = h.store.all_feedback();
    assert_eq!(feedback.len(), 1);
    assert_eq!(feedback[0].source_id, source.id);

    // Extraction and classification.
    assert_eq!(
        process_next(&h.ctx, QueueName::Processing, &config).await.unwrap(),
        Processed::Acked
    );
    let feedback = h.store.get_feedback(&[feedback[0].id]).await.unwrap();
    assert_eq!(feedback[0].extraction_status, ExtractionStatus::Succeeded);
    let window = h
        .store
        .list_insights_since(Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(window.len(), 1);
    let insight = &window[0].insight;
    let themes = h.store.list_insight_themes(insight.id).await.unwrap();
    let pricing = h
        .store
        .list_themes()
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.name == "Pricing")
        .unwrap();
    assert!(themes.iter().any(|t| t.theme_id == pricing.id));

    // Alerting and dispatch.
    h.ctx.schedule_alert_evaluation().await.unwrap();
    assert_eq!(
        process_next(&h.ctx, QueueName::Alert, &config).await.unwrap(),
        Processed::Acked
    );
    let events = h.store.list_alert_events(rule.id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].severity, Severity::High);
    assert_eq!(
        process_next(&h.ctx, QueueName::Alert, &config).await.unwrap(),
        Processed::Acked
    );

    let sent = h.webhook.sent.lock().unwrap().clone();
    assert_eq!(sent, vec![("https://hooks.example.com/voc".to_string(), events[0].id)]);
    let deliveries = h.store.list_deliveries(events[0].id).await.unwrap();
    assert_eq!(deliveries.len(), 2);
    let email = deliveries
        .iter()
        .find(|d| d.channel == ChannelKind::Email)
        .unwrap();
    assert_eq!(email.status, DeliveryStatus::Undelivered);
    let hook = deliveries
        .iter()
        .find(|d| d.channel == ChannelKind::Webhook)
        .unwrap();
    assert_eq!(hook.status, DeliveryStatus::Delivered);

    // A second evaluation inside the cooldown stays quiet.
    h.ctx.schedule_alert_evaluation().await.unwrap();
    process_next(&h.ctx, QueueName::Alert, &config).await.unwrap();
    assert_eq!(h.store.list_alert_events(rule.id).await.unwrap().len(), 1);
    assert!(h.queue.pending(QueueName::Alert).is_empty());
}

#[tokio::test]
async fn concurrent_ticks_create_a_single_run() {
    let h = harness(Fetch::Records(vec![]));
    let source = h.store.insert_source(&reddit_source()).await.unwrap();
    let now = Utc::now();

    let (a, b) = tokio::join!(h.scheduler.tick(now), h.scheduler.tick(now));

    let enqueued = a.unwrap().enqueued.len() + b.unwrap().enqueued.len();
    assert_eq!(enqueued, 1);
    assert_eq!(h.queue.pending(QueueName::Crawl).len(), 1);
    let runs = h.store.list_crawl_runs(Some(source.id), 10).await.unwrap();
    assert_eq!(runs.len(), 1);
}

#[tokio::test]
async fn failed_enqueue_leaves_no_lock_behind() {
    let h = harness(Fetch::Records(vec![]));
    let source = h.store.insert_source(&reddit_source()).await.unwrap();

    h.queue.set_fail_enqueue(true);
    let failed = h.scheduler.tick(Utc::now()).await.unwrap();
    assert_eq!(failed.failed, 1);
    assert!(h.store.outstanding_crawl_run(source.id).await.unwrap().is_none());

    h.queue.set_fail_enqueue(false);
    let retried = h.scheduler.tick(Utc::now()).await.unwrap();
    assert_eq!(retried.enqueued.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_crawl_is_requeued_then_exhausted() {
    let h = harness(Fetch::RateLimited(30));
    h.store.insert_source(&reddit_source()).await.unwrap();
    let run_id = h.scheduler.tick(Utc::now()).await.unwrap().enqueued[0].id;
    let config = WorkerConfig {
        max_attempts: 1,
        ..worker_config()
    };

    assert_eq!(
        process_next(&h.ctx, QueueName::Crawl, &config).await.unwrap(),
        Processed::Retried
    );
    assert_eq!(h.store.get_crawl_run(run_id).await.unwrap().status, CrawlStatus::Running);
    assert_eq!(
        process_next(&h.ctx, QueueName::Crawl, &config).await.unwrap(),
        Processed::Empty
    );

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(
        process_next(&h.ctx, QueueName::Crawl, &config).await.unwrap(),
        Processed::Buried
    );
    let run = h.store.get_crawl_run(run_id).await.unwrap();
    assert_eq!(run.status, CrawlStatus::Failed);
    assert_eq!(h.adapter.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.queue.dead_letters().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn hung_crawl_is_abandoned_after_visibility() {
    let h = harness(Fetch::Hang);
    h.store.insert_source(&reddit_source()).await.unwrap();
    h.scheduler.tick(Utc::now()).await.unwrap();

    let outcome = process_next(&h.ctx, QueueName::Crawl, &worker_config())
        .await
        .unwrap();

    assert_eq!(outcome, Processed::Retried);
    assert_eq!(h.queue.pending(QueueName::Crawl).len(), 1);
}

#[tokio::test]
async fn malformed_job_is_buried() {
    let h = harness(Fetch::Records(vec![]));
    h.queue
        .enqueue(QueueName::Processing, json!({ "type": "reindex" }), Duration::ZERO)
        .await
        .unwrap();

    let outcome = process_next(&h.ctx, QueueName::Processing, &worker_config())
        .await
        .unwrap();

    assert_eq!(outcome, Processed::Buried);
    let dead = h.queue.dead_letters();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].1.starts_with("malformed payload"));
}

#[tokio::test]
async fn sweep_picks_up_orphaned_feedback() {
    let h = harness(Fetch::Records(vec![post("t3_a", COMPLAINT)]));
    h.store.insert_source(&reddit_source()).await.unwrap();
    h.scheduler.tick(Utc::now()).await.unwrap();

    // The crawl stores feedback, but its extract job cannot be queued.
    let delivery = h
        .queue
        .dequeue(QueueName::Crawl, Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    let job = voc_pipeline::Job::from_payload(&delivery.payload).unwrap();
    h.queue.set_fail_enqueue(true);
    h.ctx.handle(&job, Utc::now()).await.unwrap();
    h.queue.set_fail_enqueue(false);
    assert!(h.queue.pending(QueueName::Processing).is_empty());

    // Once idle past the bound the row is re-queued, and the sweep counts as
    // a touch.
    let idle_before = Utc::now() + chrono::Duration::seconds(1);
    assert_eq!(h.ctx.sweep_pending(idle_before, 100).await.unwrap(), 1);
    assert_eq!(h.queue.pending(QueueName::Processing).len(), 1);
    let recent = Utc::now() - chrono::Duration::minutes(5);
    assert_eq!(h.ctx.sweep_pending(recent, 100).await.unwrap(), 0);
}

#[tokio::test]
async fn sweep_leaves_feedback_with_a_queued_job_alone() {
    let h = harness(Fetch::Records(vec![post("t3_a", COMPLAINT)]));
    h.store.insert_source(&reddit_source()).await.unwrap();
    h.scheduler.tick(Utc::now()).await.unwrap();
    process_next(&h.ctx, QueueName::Crawl, &worker_config()).await.unwrap();
    assert_eq!(h.queue.pending(QueueName::Processing).len(), 1);

    let idle_before = Utc::now() - chrono::Duration::minutes(5);
    assert_eq!(h.ctx.sweep_pending(idle_before, 100).await.unwrap(), 0);
    assert_eq!(h.queue.pending(QueueName::Processing).len(), 1);
}

#[tokio::test]
async fn redelivered_extract_job_themes_insights_stored_earlier() {
    let h = harness(Fetch::Records(vec![post("t3_a", COMPLAINT)]));
    h.store.insert_source(&reddit_source()).await.unwrap();
    h.scheduler.tick(Utc::now()).await.unwrap();
    process_next(&h.ctx, QueueName::Crawl, &worker_config()).await.unwrap();

    // An earlier delivery stored the insight and died before classifying.
    let ids: Vec<i64> = h.store.all_feedback().iter().map(|f| f.id).collect();
    let report = h.ctx.extractor.extract(&ids).await.unwrap();
    assert_eq!(report.insights.len(), 1);
    let insight_id = report.insights[0].id;
    assert!(h.store.list_insight_themes(insight_id).await.unwrap().is_empty());

    assert_eq!(
        process_next(&h.ctx, QueueName::Processing, &worker_config()).await.unwrap(),
        Processed::Acked
    );
    let pricing = h
        .store
        .list_themes()
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.name == "Pricing")
        .unwrap();
    let themes = h.store.list_insight_themes(insight_id).await.unwrap();
    assert!(themes.iter().any(|t| t.theme_id == pricing.id));
    assert!(h.store.list_unthemed_insights(&ids).await.unwrap().is_empty());
}
