use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use voc_core::{CrawlRun, CrawlStats, CrawlStatus};

use crate::middleware::RequestId;

use super::{map_scheduler_error, ApiError, ApiResponse, AppState, ResponseMeta};

const DEFAULT_LIMIT: i64 = 50;

#[derive(Debug, Default, Deserialize)]
pub(super) struct TriggerCrawlBody {
    pub query_override: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct CrawlRunsQuery {
    pub source_id: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub(super) struct CrawlRunItem {
    crawl_run_id: i64,
    source_id: i64,
    status: CrawlStatus,
    query_override: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    stats: CrawlStats,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<CrawlRun> for CrawlRunItem {
    fn from(run: CrawlRun) -> Self {
        Self {
            crawl_run_id: run.id,
            source_id: run.source_id,
            status: run.status,
            query_override: run.query_override,
            started_at: run.started_at,
            finished_at: run.finished_at,
            stats: run.stats,
            error_message: run.error_message,
            created_at: run.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub(super) struct TriggeredCrawlItem {
    already_outstanding: bool,
    run: CrawlRunItem,
}

/// `202 Accepted` with a new run, or `200 OK` with the run already in
/// flight for the source.
pub(super) async fn trigger_crawl(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Path(source_id): Path<i64>,
    body: Option<Json<TriggerCrawlBody>>,
) -> Result<(StatusCode, Json<ApiResponse<TriggeredCrawlItem>>), ApiError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let triggered = state
        .scheduler
        .trigger_crawl(source_id, body.query_override.as_deref(), Utc::now())
        .await
        .map_err(|e| map_scheduler_error(req_id.0.clone(), &e))?;

    let status = if triggered.already_outstanding {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((
        status,
        Json(ApiResponse {
            data: TriggeredCrawlItem {
                already_outstanding: triggered.already_outstanding,
                run: triggered.run.into(),
            },
            meta: ResponseMeta::new(req_id.0),
        }),
    ))
}

pub(super) async fn list_crawl_runs(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Query(query): Query<CrawlRunsQuery>,
) -> Result<Json<ApiResponse<Vec<CrawlRunItem>>>, ApiError> {
    let runs = state
        .scheduler
        .crawl_status(query.source_id, query.limit.unwrap_or(DEFAULT_LIMIT))
        .await
        .map_err(|e| map_scheduler_error(req_id.0.clone(), &e))?;

    Ok(Json(ApiResponse {
        data: runs.into_iter().map(CrawlRunItem::from).collect(),
        meta: ResponseMeta::new(req_id.0),
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use voc_core::{NewSource, RedditConfig, RedditSort, RedditTimeFilter, SourceConfig, TrustpilotConfig};
    use voc_db::{MemoryJobQueue, MemoryStore, QueueName, Store};

    use crate::api::testing::{app, send};

    fn reddit() -> NewSource {
        NewSource {
            name: "r/saas".to_string(),
            config: SourceConfig::Reddit(RedditConfig {
                subreddit: "saas".to_string(),
                query: None,
                sort: RedditSort::New,
                time_filter: RedditTimeFilter::Week,
            }),
            cadence_minutes: None,
            is_active: true,
        }
    }

    fn post_crawl(source_id: i64, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/api/v1/sources/{source_id}/crawl"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn trigger_enqueues_then_returns_outstanding_run() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let source = store.insert_source(&reddit()).await.unwrap();

        let (status, first) = send(
            app(&store, &queue),
            post_crawl(source.id, r#"{"query_override":"pricing"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(first["data"]["already_outstanding"], false);
        assert_eq!(first["data"]["run"]["status"], "pending");
        assert_eq!(first["data"]["run"]["query_override"], "pricing");

        let (status, second) = send(app(&store, &queue), post_crawl(source.id, "{}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["data"]["already_outstanding"], true);
        assert_eq!(
            second["data"]["run"]["crawl_run_id"],
            first["data"]["run"]["crawl_run_id"]
        );
        assert_eq!(queue.pending(QueueName::Crawl).len(), 1);
    }

    #[tokio::test]
    async fn trigger_without_body_is_accepted() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let source = store.insert_source(&reddit()).await.unwrap();

        let (status, _) = send(
            app(&store, &queue),
            Request::builder()
                .method("POST")
                .uri(format!("/api/v1/sources/{}/crawl", source.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn unknown_source_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new());

        let (status, json) = send(app(&store, &queue), post_crawl(999, "{}")).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn override_on_review_platform_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let source = store
            .insert_source(&NewSource {
                name: "Trustpilot".to_string(),
                config: SourceConfig::Trustpilot(TrustpilotConfig {
                    company_domain: "example.com".to_string(),
                    language: None,
                }),
                cadence_minutes: None,
                is_active: true,
            })
            .await
            .unwrap();

        let (status, json) = send(
            app(&store, &queue),
            post_crawl(source.id, r#"{"query_override":"billing"}"#),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "validation_error");
        assert!(queue.pending(QueueName::Crawl).is_empty());
    }

    #[tokio::test]
    async fn lists_runs_for_a_source() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let source = store.insert_source(&reddit()).await.unwrap();
        send(app(&store, &queue), post_crawl(source.id, "{}")).await;

        let (status, json) = send(
            app(&store, &queue),
            Request::builder()
                .uri(format!("/api/v1/crawl-runs?source_id={}&limit=5", source.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let runs = json["data"].as_array().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0]["source_id"], source.id);
    }
}
