use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use voc_core::{Platform, SourceConfig};

use super::jsonld::collect_review_pages;
use super::{trim_base_url, wrong_platform};
use crate::adapter::CrawlerAdapter;
use crate::client::PoliteClient;
use crate::types::FetchOutcome;

const DEFAULT_BASE_URL: &str = "https://www.g2.com";

/// Product reviews from `g2.com/products/<slug>/reviews`, newest first.
pub struct G2Adapter {
    client: Arc<PoliteClient>,
    base_url: String,
    min_delay: Duration,
}

impl G2Adapter {
    #[must_use]
    pub fn new(client: Arc<PoliteClient>) -> Self {
        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            min_delay: Platform::G2.min_request_delay(),
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
}

#[async_trait]
impl CrawlerAdapter for G2Adapter {
    fn platform(&self) -> Platform {
        Platform::G2
    }

    async fn fetch(&self, config: &SourceConfig, limit: usize) -> FetchOutcome {
        let SourceConfig::G2(cfg) = config else {
            return FetchOutcome::failed(wrong_platform(Platform::G2, config.platform()));
        };

        let base = format!("{}/products/{}/reviews", self.base_url, cfg.product_slug);
        let mut records = Vec::new();
        let result = collect_review_pages(
            &self.client,
            self.min_delay,
            |page| format!("{base}?order=most_recent&page={page}"),
            limit,
            &mut records,
        )
        .await;
        tracing::debug!(
            product = %cfg.product_slug,
            records = records.len(),
            "crawler: g2 fetch finished"
        );
        FetchOutcome::from_parts(records, result)
    }
}
