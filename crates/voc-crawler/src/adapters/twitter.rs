//! Tweets from the X API v2 recent-search endpoint.
//!
//! Requires a bearer token; without one every fetch fails as
//! [`CrawlError::Blocked`]. Retweets are excluded from the query.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;
use serde_json::json;
use voc_core::{Platform, SourceConfig, TwitterConfig, TwitterResultType};

use super::{trim_base_url, wrong_platform};
use crate::adapter::CrawlerAdapter;
use crate::client::PoliteClient;
use crate::error::CrawlError;
use crate::types::{FetchOutcome, RawRecord};

const DEFAULT_BASE_URL: &str = "https://api.x.com";
const MIN_PAGE_SIZE: usize = 10;
const MAX_PAGE_SIZE: usize = 100;
const MAX_PAGES: usize = 5;

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    data: Vec<Tweet>,
    #[serde(default)]
    includes: Includes,
    #[serde(default)]
    meta: Meta,
}

#[derive(Debug, Default, Deserialize)]
struct Includes {
    #[serde(default)]
    users: Vec<User>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: String,
    username: String,
}

#[derive(Debug, Default, Deserialize)]
struct Meta {
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Tweet {
    id: String,
    text: String,
    author_id: Option<String>,
    created_at: Option<DateTime<Utc>>,
    lang: Option<String>,
    public_metrics: Option<serde_json::Value>,
}

pub struct TwitterAdapter {
    client: Arc<PoliteClient>,
    bearer_token: Option<String>,
    base_url: String,
    min_delay: Duration,
}

impl TwitterAdapter {
    #[must_use]
    pub fn new(client: Arc<PoliteClient>, bearer_token: Option<String>) -> Self {
        Self {
            client,
            bearer_token,
            base_url: DEFAULT_BASE_URL.to_string(),
            min_delay: Platform::Twitter.min_request_delay(),
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = trim_base_url(base_url);
        self
    }

    #[must_use]
    pub fn with_min_delay(mut self, min_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self
    }

    fn page_url(&self, cfg: &TwitterConfig, page_size: usize, next: Option<&str>) -> String {
        let mut query = format!("{} -is:retweet", cfg.query.trim());
        if let Some(language) = cfg.language.as_deref() {
            query.push_str(" lang:");
            query.push_str(language);
        }
        let sort = match cfg.result_type {
            TwitterResultType::Latest => "recency",
            TwitterResultType::Top => "relevancy",
        };
        let mut url = format!(
            "{}/2/tweets/search/recent?query={}&max_results={page_size}&sort_order={sort}\
             &tweet.fields=created_at,lang,author_id,public_metrics&expansions=author_id\
             &user.fields=username",
            self.base_url,
            utf8_percent_encode(&query, NON_ALPHANUMERIC),
        );
        if let Some(token) = next {
            url.push_str("&next_token=");
            url.push_str(&utf8_percent_encode(token, NON_ALPHANUMERIC).to_string());
        }
        url
    }

    async fn collect(
        &self,
        cfg: &TwitterConfig,
        bearer_token: &str,
        limit: usize,
        records: &mut Vec<RawRecord>,
    ) -> Result<(), CrawlError> {
        let mut seen = HashSet::new();
        let mut next: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let page_size = (limit - records.len()).clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE);
            let url = self.page_url(cfg, page_size, next.as_deref());
            let page: SearchPage = self
                .client
                .get_api_json(&url, bearer_token, self.min_delay)
                .await?;

            let handles: HashMap<String, String> = page
                .includes
                .users
                .into_iter()
                .map(|u| (u.id, u.username))
                .collect();
            for tweet in page.data {
                if records.len() >= limit {
                    break;
                }
                if seen.insert(tweet.id.clone()) {
                    records.push(to_record(tweet, &handles));
                }
            }

            next = page.meta.next_token;
            if next.is_none() || records.len() >= limit {
                break;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CrawlerAdapter for TwitterAdapter {
    fn platform(&self) -> Platform {
        Platform::Twitter
    }

    async fn fetch(&self, config: &SourceConfig, limit: usize) -> FetchOutcome {
        let SourceConfig::Twitter(cfg) = config else {
            return FetchOutcome::failed(wrong_platform(Platform::Twitter, config.platform()));
        };
        let Some(bearer_token) = self.bearer_token.as_deref() else {
            return FetchOutcome::failed(CrawlError::Blocked(
                "twitter bearer token is not configured".to_string(),
            ));
        };
        if limit == 0 {
            return FetchOutcome::complete(Vec::new());
        }

        let mut records = Vec::new();
        let result = self.collect(cfg, bearer_token, limit, &mut records).await;
        tracing::debug!(
            query = %cfg.query,
            records = records.len(),
            error = result.as_ref().err().map(ToString::to_string),
            "crawler: twitter fetch finished"
        );
        FetchOutcome::from_parts(records, result)
    }
}

fn to_record(tweet: Tweet, handles: &HashMap<String, String>) -> RawRecord {
    let handle = tweet
        .author_id
        .as_ref()
        .and_then(|id| handles.get(id))
        .cloned();
    let url = match handle.as_deref() {
        Some(handle) => format!("https://x.com/{handle}/status/{}", tweet.id),
        None => format!("https://x.com/i/web/status/{}", tweet.id),
    };
    RawRecord {
        url: Some(url),
        metadata: json!({
            "lang": tweet.lang,
            "metrics": tweet.public_metrics,
        }),
        external_id: tweet.id,
        content: tweet.text,
        title: None,
        author_handle: handle,
        posted_at: tweet.created_at,
    }
}
