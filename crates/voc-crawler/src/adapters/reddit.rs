//! Reddit listings and subreddit search via the public `.json` endpoints.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;
use serde_json::json;
use voc_core::{Platform, RedditConfig, RedditSort, SourceConfig};

use super::{trim_base_url, wrong_platform};
use crate::adapter::CrawlerAdapter;
use crate::client::PoliteClient;
use crate::error::CrawlError;
use crate::types::{FetchOutcome, RawRecord};

const DEFAULT_BASE_URL: &str = "https://www.reddit.com";
const PAGE_LIMIT: usize = 100;
const MAX_PAGES: usize = 10;

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    children: Vec<Post>,
    after: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Post {
    data: PostData,
}

#[derive(Debug, Deserialize)]
struct PostData {
    id: String,
    title: Option<String>,
    selftext: Option<String>,
    author: Option<String>,
    permalink: Option<String>,
    created_utc: Option<f64>,
    subreddit: Option<String>,
    score: Option<i64>,
    num_comments: Option<i64>,
}

pub struct RedditAdapter {
    client: Arc<PoliteClient>,
    base_url: String,
    min_delay: Duration,
}

impl RedditAdapter {
    #[must_use]
    pub fn new(client: Arc<PoliteClient>) -> Self {
        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            min_delay: Platform::Reddit.min_request_delay(),
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

    fn page_url(&self, cfg: &RedditConfig, page_size: usize, after: Option<&str>) -> String {
        let subreddit = cfg.subreddit.trim_start_matches("r/");
        let mut url = match cfg.query.as_deref() {
            Some(query) => format!(
                "{}/r/{subreddit}/search.json?q={}&restrict_sr=1&sort={}&t={}&limit={page_size}",
                self.base_url,
                utf8_percent_encode(query, NON_ALPHANUMERIC),
                cfg.sort,
                cfg.time_filter,
            ),
            None => {
                // Relevance only exists for search; plain listings fall back to hot.
                let sort = match cfg.sort {
                    RedditSort::Relevance => RedditSort::Hot,
                    other => other,
                };
                format!(
                    "{}/r/{subreddit}/{sort}.json?t={}&limit={page_size}",
                    self.base_url, cfg.time_filter,
                )
            }
        };
        url.push_str("&raw_json=1");
        if let Some(cursor) = after {
            url.push_str("&after=");
            url.push_str(&utf8_percent_encode(cursor, NON_ALPHANUMERIC).to_string());
        }
        url
    }

    async fn collect(
        &self,
        cfg: &RedditConfig,
        limit: usize,
        records: &mut Vec<RawRecord>,
    ) -> Result<(), CrawlError> {
        let mut seen = HashSet::new();
        let mut after: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let page_size = (limit - records.len()).min(PAGE_LIMIT);
            let url = self.page_url(cfg, page_size, after.as_deref());
            let listing: Listing = self.client.get_json(&url, self.min_delay).await?;

            for post in listing.data.children {
                if records.len() >= limit {
                    break;
                }
                if seen.insert(post.data.id.clone()) {
                    records.push(to_record(post.data));
                }
            }

            after = listing.data.after;
            if after.is_none() || records.len() >= limit {
                break;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CrawlerAdapter for RedditAdapter {
    fn platform(&self) -> Platform {
        Platform::Reddit
    }

    async fn fetch(&self, config: &SourceConfig, limit: usize) -> FetchOutcome {
        let SourceConfig::Reddit(cfg) = config else {
            return FetchOutcome::failed(wrong_platform(Platform::Reddit, config.platform()));
        };
        if limit == 0 {
            return FetchOutcome::complete(Vec::new());
        }

        let mut records = Vec::new();
        let result = self.collect(cfg, limit, &mut records).await;
        tracing::debug!(
            subreddit = %cfg.subreddit,
            records = records.len(),
            error = result.as_ref().err().map(ToString::to_string),
            "crawler: reddit fetch finished"
        );
        FetchOutcome::from_parts(records, result)
    }
}

fn to_record(post: PostData) -> RawRecord {
    let content = post
        .selftext
        .as_deref()
        .map(str::trim)
        .filter(|body| *body != "[deleted]" && *body != "[removed]")
        .unwrap_or_default()
        .to_string();

    #[allow(clippy::cast_possible_truncation)]
    let posted_at = post
        .created_utc
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs as i64, 0));

    RawRecord {
        url: post
            .permalink
            .as_deref()
            .map(|p| format!("https://www.reddit.com{p}")),
        metadata: json!({
            "subreddit": post.subreddit,
            "score": post.score,
            "num_comments": post.num_comments,
        }),
        external_id: post.id,
        content,
        title: post.title,
        author_handle: post.author.filter(|a| a != "[deleted]"),
        posted_at,
    }
}
