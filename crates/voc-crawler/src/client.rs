//! Polite HTTP fetching shared by every adapter.
//!
//! - robots.txt is fetched once per origin and cached; disallowed paths fail
//!   with [`CrawlError::Blocked`] before any request is made.
//! - Requests to one host are spaced by the platform's minimum delay, even
//!   across concurrent crawls.
//! - Status codes map onto the [`CrawlError`] taxonomy; transient network
//!   failures are retried with back-off.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{CrawlError, DEFAULT_RETRY_AFTER_SECS};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::robots::RobotsRules;

const NETWORK_ATTEMPTS: u32 = 3;
const NETWORK_BACKOFF_BASE_MS: u64 = 1_000;

pub struct PoliteClient {
    client: Client,
    user_agent: String,
    retry: RetryPolicy,
    robots: Mutex<HashMap<String, Arc<RobotsRules>>>,
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl PoliteClient {
    /// Creates a client with the given request timeout and `User-Agent`.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError::Network`] if the underlying `reqwest::Client`
    /// cannot be constructed.
    pub fn new(timeout_secs: u64, user_agent: &str) -> Result<Self, CrawlError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(user_agent)
            .build()?;
        Ok(Self {
            client,
            user_agent: user_agent.to_owned(),
            retry: RetryPolicy::new(NETWORK_ATTEMPTS, NETWORK_BACKOFF_BASE_MS),
            robots: Mutex::new(HashMap::new()),
            next_slot: Mutex::new(HashMap::new()),
        })
    }

    /// Override the network retry policy (tests use a zero back-off).
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// GET `url` and return the body as text.
    ///
    /// # Errors
    ///
    /// - [`CrawlError::Blocked`] for robots.txt disallow, 401 and 403.
    /// - [`CrawlError::RateLimited`] for 429, with `Retry-After` when present.
    /// - [`CrawlError::InvalidConfig`] for 404 or an unparseable URL.
    /// - [`CrawlError::Network`] for 5xx, other statuses and I/O failures
    ///   once retries are spent.
    pub async fn get_text(&self, url: &str, min_delay: Duration) -> Result<String, CrawlError> {
        let parsed = Url::parse(url)
            .map_err(|e| CrawlError::InvalidConfig(format!("invalid URL {url}: {e}")))?;
        let origin = parsed.origin().ascii_serialization();

        let rules = self.robots_for(&origin).await;
        let path = match parsed.query() {
            Some(q) => format!("{}?{q}", parsed.path()),
            None => parsed.path().to_owned(),
        };
        if !rules.is_allowed(&path) {
            return Err(CrawlError::Blocked(format!("robots.txt disallows {path}")));
        }

        self.send_get(&parsed, &origin, min_delay, None).await
    }

    /// GET `url` and decode the JSON body.
    ///
    /// # Errors
    ///
    /// As [`Self::get_text`]; an undecodable body is [`CrawlError::Network`].
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        min_delay: Duration,
    ) -> Result<T, CrawlError> {
        let body = self.get_text(url, min_delay).await?;
        serde_json::from_str(&body)
            .map_err(|e| CrawlError::Network(format!("unexpected response body from {url}: {e}")))
    }

    /// GET an authenticated JSON API with a bearer token.
    ///
    /// API hosts are not crawled pages, so robots.txt is not consulted;
    /// request spacing, retries and the status mapping still apply.
    ///
    /// # Errors
    ///
    /// As [`Self::get_json`].
    pub async fn get_api_json<T: DeserializeOwned>(
        &self,
        url: &str,
        bearer_token: &str,
        min_delay: Duration,
    ) -> Result<T, CrawlError> {
        let parsed = Url::parse(url)
            .map_err(|e| CrawlError::InvalidConfig(format!("invalid URL {url}: {e}")))?;
        let origin = parsed.origin().ascii_serialization();
        let body = self
            .send_get(&parsed, &origin, min_delay, Some(bearer_token))
            .await?;
        serde_json::from_str(&body)
            .map_err(|e| CrawlError::Network(format!("unexpected response body from {url}: {e}")))
    }

    async fn send_get(
        &self,
        url: &Url,
        origin: &str,
        min_delay: Duration,
        bearer_token: Option<&str>,
    ) -> Result<String, CrawlError> {
        let (result, _) = retry_with_backoff(self.retry, "crawler", |_| async move {
            self.wait_for_slot(origin, min_delay).await;
            let mut request = self.client.get(url.clone());
            if let Some(token) = bearer_token {
                request = request.bearer_auth(token);
            }
            let response = request.send().await?;
            classify_status(response.status(), response.headers(), url.as_str())?;
            Ok(response.text().await?)
        })
        .await;
        result
    }

    async fn robots_for(&self, origin: &str) -> Arc<RobotsRules> {
        if let Some(rules) = self.robots.lock().await.get(origin) {
            return Arc::clone(rules);
        }

        let rules = Arc::new(self.fetch_robots(origin).await);
        self.robots
            .lock()
            .await
            .entry(origin.to_owned())
            .or_insert_with(|| Arc::clone(&rules));
        rules
    }

    async fn fetch_robots(&self, origin: &str) -> RobotsRules {
        let url = format!("{origin}/robots.txt");
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(body) => RobotsRules::parse(&body, &self.user_agent),
                Err(e) => {
                    tracing::debug!(origin, error = %e, "crawler: unreadable robots.txt; allowing all");
                    RobotsRules::allow_all()
                }
            },
            Ok(response) => {
                tracing::debug!(origin, status = %response.status(), "crawler: no robots.txt; allowing all");
                RobotsRules::allow_all()
            }
            Err(e) => {
                tracing::debug!(origin, error = %e, "crawler: robots.txt fetch failed; allowing all");
                RobotsRules::allow_all()
            }
        }
    }

    /// Reserve the next request slot for `origin` and sleep until it opens.
    async fn wait_for_slot(&self, origin: &str, min_delay: Duration) {
        let wait = {
            let mut slots = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = slots.get(origin).copied().unwrap_or(now).max(now);
            slots.insert(origin.to_owned(), slot + min_delay);
            slot - now
        };
        if !wait.is_zero() {
            tracing::debug!(origin, wait_ms = wait.as_millis(), "crawler: spacing request");
            tokio::time::sleep(wait).await;
        }
    }
}

/// Map a response status onto the crawl failure taxonomy.
pub(crate) fn classify_status(
    status: StatusCode,
    headers: &reqwest::header::HeaderMap,
    url: &str,
) -> Result<(), CrawlError> {
    if status.is_success() {
        return Ok(());
    }
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after_secs = headers
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            Err(CrawlError::RateLimited { retry_after_secs })
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(CrawlError::Blocked(format!("HTTP {} from {url}", status.as_u16())))
        }
        StatusCode::NOT_FOUND | StatusCode::GONE => {
            Err(CrawlError::InvalidConfig(format!("HTTP {} from {url}", status.as_u16())))
        }
        _ => Err(CrawlError::Network(format!("HTTP {} from {url}", status.as_u16()))),
    }
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;
