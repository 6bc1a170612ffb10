use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use voc_core::{
    CrawlStats, CrawlStatus, InsightTheme, NewAlertEvent, NewAlertRule, NewFeedback, NewInsight,
    NewSource, RedditConfig, RuleType, SentimentLabel, Severity, SourceConfig,
};

use super::*;

fn reddit_source() -> NewSource {
    NewSource {
        name: "r/rust".to_string(),
        config: SourceConfig::Reddit(RedditConfig {
            subreddit: "rust".to_string(),
            query: None,
            sort: voc_core::RedditSort::New,
            time_filter: voc_core::RedditTimeFilter::Week,
        }),
        cadence_minutes: None,
        is_active: true,
    }
}

fn feedback(source_id: i64, fingerprint: &str) -> NewFeedback {
    NewFeedback {
        source_id,
        crawl_run_id: None,
        external_id: format!("ext-{fingerprint}"),
        raw_content: "raw".to_string(),
        clean_content: "the onboarding flow keeps logging me out".to_string(),
        fingerprint: fingerprint.to_string(),
        posted_at: Utc::now(),
        author_handle: None,
        url: None,
        metadata: serde_json::json!({}),
    }
}

fn insight(feedback_id: i64) -> NewInsight {
    NewInsight {
        feedback_id,
        sentiment_score: -0.4,
        sentiment_label: SentimentLabel::Negative,
        sentiment_confidence: 0.9,
        summary: "logout loop".to_string(),
        pain_points: Vec::new(),
        feature_requests: Vec::new(),
        competitor_mentions: Vec::new(),
        customer_context: voc_core::CustomerContext::default(),
        journey_stage: None,
        urgency_level: 2,
        themes: Vec::new(),
    }
}

#[tokio::test]
async fn concurrent_identical_feedback_inserts_store_one_row() {
    let store = Arc::new(MemoryStore::new());
    let source_id = store.insert_source(&reddit_source()).await.unwrap().id;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.insert_feedback(&feedback(source_id, "abc")).await })
        })
        .collect();

    let mut inserted = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().is_some() {
            inserted += 1;
        }
    }
    assert_eq!(inserted, 1);
    assert_eq!(store.all_feedback().len(), 1);
}

#[tokio::test]
async fn same_fingerprint_on_another_source_is_not_a_duplicate() {
    let store = MemoryStore::new();
    let a = store.insert_source(&reddit_source()).await.unwrap();
    let b = store.insert_source(&reddit_source()).await.unwrap();

    assert!(store.insert_feedback(&feedback(a.id, "abc")).await.unwrap().is_some());
    assert!(store.insert_feedback(&feedback(b.id, "abc")).await.unwrap().is_some());
}

#[tokio::test]
async fn only_one_outstanding_run_per_source() {
    let store = MemoryStore::new();
    let source = store.insert_source(&reddit_source()).await.unwrap();

    let first = store.claim_crawl_run(source.id, None).await.unwrap();
    assert!(first.is_some());
    assert!(store.claim_crawl_run(source.id, None).await.unwrap().is_none());

    let run = first.unwrap();
    store.start_crawl_run(run.id).await.unwrap();
    assert!(store.claim_crawl_run(source.id, None).await.unwrap().is_none());

    store
        .finish_crawl_run(run.id, CrawlStatus::Succeeded, &CrawlStats::default(), None)
        .await
        .unwrap();
    assert!(store.claim_crawl_run(source.id, None).await.unwrap().is_some());
}

#[tokio::test]
async fn released_run_frees_the_lock() {
    let store = MemoryStore::new();
    let source = store.insert_source(&reddit_source()).await.unwrap();

    let run = store.claim_crawl_run(source.id, Some("billing")).await.unwrap().unwrap();
    assert_eq!(run.query_override.as_deref(), Some("billing"));
    store.release_crawl_run(run.id).await.unwrap();

    assert!(matches!(store.get_crawl_run(run.id).await, Err(DbError::NotFound)));
    assert_eq!(store.count_outstanding_crawl_runs().await.unwrap(), 0);
}

#[tokio::test]
async fn finished_run_rejects_restart_and_second_finish() {
    let store = MemoryStore::new();
    let source = store.insert_source(&reddit_source()).await.unwrap();
    let run = store.claim_crawl_run(source.id, None).await.unwrap().unwrap();
    store
        .finish_crawl_run(run.id, CrawlStatus::Failed, &CrawlStats::default(), Some("blocked"))
        .await
        .unwrap();

    assert!(matches!(
        store.start_crawl_run(run.id).await,
        Err(DbError::InvalidCrawlRunTransition { .. })
    ));
    assert!(matches!(
        store
            .finish_crawl_run(run.id, CrawlStatus::Succeeded, &CrawlStats::default(), None)
            .await,
        Err(DbError::InvalidCrawlRunTransition { .. })
    ));
}

#[tokio::test]
async fn stale_runs_are_failed_and_unlocked() {
    let store = MemoryStore::new();
    let source = store.insert_source(&reddit_source()).await.unwrap();
    let run = store.claim_crawl_run(source.id, None).await.unwrap().unwrap();

    let reaped = store
        .fail_stale_crawl_runs(Utc::now() + Duration::minutes(1), "timed out")
        .await
        .unwrap();
    assert_eq!(reaped, 1);

    let run = store.get_crawl_run(run.id).await.unwrap();
    assert_eq!(run.status, CrawlStatus::Failed);
    assert_eq!(run.error_message.as_deref(), Some("timed out"));
    assert!(store.outstanding_crawl_run(source.id).await.unwrap().is_none());
}

#[tokio::test]
async fn insert_insight_is_idempotent_and_marks_feedback() {
    let store = MemoryStore::new();
    let source = store.insert_source(&reddit_source()).await.unwrap();
    let id = store.insert_feedback(&feedback(source.id, "f1")).await.unwrap().unwrap();

    assert!(store.insert_insight(&insight(id)).await.unwrap().is_some());
    assert!(store.insert_insight(&insight(id)).await.unwrap().is_none());

    let row = &store.get_feedback(&[id]).await.unwrap()[0];
    assert_eq!(row.extraction_status, voc_core::ExtractionStatus::Succeeded);
    assert_eq!(store.pipeline_stats().await.unwrap().insights_total, 1);
}

#[tokio::test]
async fn failed_extraction_can_be_reset() {
    let store = MemoryStore::new();
    let source = store.insert_source(&reddit_source()).await.unwrap();
    let id = store.insert_feedback(&feedback(source.id, "f1")).await.unwrap().unwrap();

    for _ in 0..3 {
        store.claim_extraction_attempt(&[id], 3).await.unwrap();
    }
    assert!(store.mark_extraction_failed(id, "timeout").await.unwrap());
    assert!(!store.mark_extraction_failed(id, "timeout").await.unwrap());

    assert_eq!(store.reset_failed_extractions(10).await.unwrap(), vec![id]);
    let row = &store.get_feedback(&[id]).await.unwrap()[0];
    assert_eq!(row.extraction_attempts, 0);
    assert!(row.extraction_error.is_none());
}

#[tokio::test]
async fn extraction_attempts_stop_at_the_budget() {
    let store = MemoryStore::new();
    let source = store.insert_source(&reddit_source()).await.unwrap();
    let a = store.insert_feedback(&feedback(source.id, "f1")).await.unwrap().unwrap();
    let b = store.insert_feedback(&feedback(source.id, "f2")).await.unwrap().unwrap();

    assert_eq!(store.claim_extraction_attempt(&[a, b], 2).await.unwrap(), vec![a, b]);
    assert_eq!(store.claim_extraction_attempt(&[a], 2).await.unwrap(), vec![a]);
    assert_eq!(store.claim_extraction_attempt(&[a, b], 2).await.unwrap(), vec![b]);
    assert!(store.claim_extraction_attempt(&[a, b], 2).await.unwrap().is_empty());

    let rows = store.get_feedback(&[a, b]).await.unwrap();
    assert!(rows.iter().all(|f| f.extraction_attempts == 2));
}

#[tokio::test]
async fn idle_sweep_skips_recently_touched_feedback() {
    let store = MemoryStore::new();
    let t0 = Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap();
    let source = store.insert_source(&reddit_source()).await.unwrap();
    store.set_clock(Some(t0));
    let fresh = store.insert_feedback(&feedback(source.id, "f1")).await.unwrap().unwrap();
    let charged = store.insert_feedback(&feedback(source.id, "f2")).await.unwrap().unwrap();

    store.set_clock(Some(t0 + Duration::minutes(10)));
    store.claim_extraction_attempt(&[charged], 3).await.unwrap();

    let idle_before = t0 + Duration::minutes(5);
    assert_eq!(store.claim_idle_pending_feedback(idle_before, 10).await.unwrap(), vec![fresh]);
    // Claimed rows count as touched.
    assert!(store.claim_idle_pending_feedback(idle_before, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn assign_theme_folds_centroid_once() {
    let store = MemoryStore::new();
    let theme = store
        .create_emerging_theme("Emerging: logout", "logout loop", &[1.0, 0.0])
        .await
        .unwrap()
        .unwrap();
    assert!(store
        .create_emerging_theme("Emerging: logout", "another loop", &[0.0, 1.0])
        .await
        .unwrap()
        .is_none());

    let link = InsightTheme {
        insight_id: 10,
        theme_id: theme.id,
        weight: 0.9,
    };
    assert!(store.assign_theme(&link, Some(&[1.0, 0.0])).await.unwrap());
    let link2 = InsightTheme {
        insight_id: 11,
        ..link.clone()
    };
    assert!(store.assign_theme(&link2, Some(&[0.0, 1.0])).await.unwrap());
    assert!(!store.assign_theme(&link2, Some(&[0.0, 1.0])).await.unwrap());

    let centroids = store.list_theme_centroids().await.unwrap();
    assert_eq!(centroids.len(), 1);
    assert_eq!(centroids[0].member_count, 2);
    assert!((centroids[0].centroid[0] - 0.5).abs() < 1e-6);
    assert!((centroids[0].centroid[1] - 0.5).abs() < 1e-6);
}

#[tokio::test]
async fn cooldown_suppresses_same_condition_key() {
    let store = MemoryStore::new();
    let rule = store
        .insert_alert_rule(&NewAlertRule::new("avg", RuleType::SentimentThreshold, Some(3.0)))
        .await
        .unwrap();
    let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    let event = |at| NewAlertEvent {
        alert_rule_id: rule.id,
        primary_insight_id: None,
        triggered_at: at,
        severity: Severity::High,
        condition_key: "sentiment".to_string(),
        payload: serde_json::json!({}),
    };

    let first = store.create_alert_event(&event(t0), t0 - rule.cooldown()).await.unwrap();
    assert!(first.is_some());

    let t1 = t0 + Duration::minutes(2);
    assert!(store
        .create_alert_event(&event(t1), t1 - rule.cooldown())
        .await
        .unwrap()
        .is_none());

    // Acknowledged events no longer hold the cooldown.
    store
        .update_alert_status(first.unwrap().id, AlertStatus::Acknowledged)
        .await
        .unwrap();
    assert!(store
        .create_alert_event(&event(t1), t1 - rule.cooldown())
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn resolving_stamps_resolved_at() {
    let store = MemoryStore::new();
    let rule = store
        .insert_alert_rule(&NewAlertRule::new("kw", RuleType::Keyword, None))
        .await
        .unwrap();
    let now = Utc::now();
    let event = store
        .create_alert_event(
            &NewAlertEvent {
                alert_rule_id: rule.id,
                primary_insight_id: None,
                triggered_at: now,
                severity: Severity::Low,
                condition_key: "refund".to_string(),
                payload: serde_json::json!({}),
            },
            now,
        )
        .await
        .unwrap()
        .unwrap();

    let resolved = store
        .update_alert_status(event.id, AlertStatus::Resolved)
        .await
        .unwrap();
    assert!(resolved.resolved_at.is_some());
    assert_eq!(store.pipeline_stats().await.unwrap().open_alerts, 0);
}

#[tokio::test]
async fn delivery_upsert_accumulates_attempts() {
    let store = MemoryStore::new();
    let delivery = NewDelivery {
        alert_event_id: 1,
        channel: voc_core::ChannelKind::Webhook,
        target: "https://hooks.example.com/a".to_string(),
        status: DeliveryStatus::Undelivered,
        attempts: 3,
        last_error: Some("HTTP 500".to_string()),
    };
    store.upsert_delivery(&delivery).await.unwrap();
    store
        .upsert_delivery(&NewDelivery {
            status: DeliveryStatus::Delivered,
            attempts: 1,
            last_error: None,
            ..delivery.clone()
        })
        .await
        .unwrap();

    let rows = store.list_deliveries(1).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].attempts, 4);
    assert_eq!(rows[0].status, DeliveryStatus::Delivered);
    assert!(rows[0].last_error.is_none());
}
