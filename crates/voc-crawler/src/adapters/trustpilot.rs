use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use voc_core::{Platform, SourceConfig, TrustpilotConfig};

use super::jsonld::collect_review_pages;
use super::{trim_base_url, wrong_platform};
use crate::adapter::CrawlerAdapter;
use crate::client::PoliteClient;
use crate::types::FetchOutcome;

const DEFAULT_BASE_URL: &str = "https://www.trustpilot.com";

/// Company reviews from `trustpilot.com/review/<domain>`.
pub struct TrustpilotAdapter {
    client: Arc<PoliteClient>,
    base_url: String,
    min_delay: Duration,
}

impl TrustpilotAdapter {
    #[must_use]
    pub fn new(client: Arc<PoliteClient>) -> Self {
        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            min_delay: Platform::Trustpilot.min_request_delay(),
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

    fn page_url(&self, cfg: &TrustpilotConfig, page: usize) -> String {
        let mut url = format!(
            "{}/review/{}?page={page}",
            self.base_url,
            cfg.company_domain.to_ascii_lowercase()
        );
        if let Some(language) = cfg.language.as_deref() {
            url.push_str("&languages=");
            url.push_str(&utf8_percent_encode(language, NON_ALPHANUMERIC).to_string());
        }
        url
    }
}

#[async_trait]
impl CrawlerAdapter for TrustpilotAdapter {
    fn platform(&self) -> Platform {
        Platform::Trustpilot
    }

    async fn fetch(&self, config: &SourceConfig, limit: usize) -> FetchOutcome {
        let SourceConfig::Trustpilot(cfg) = config else {
            return FetchOutcome::failed(wrong_platform(Platform::Trustpilot, config.platform()));
        };

        let mut records = Vec::new();
        let result = collect_review_pages(
            &self.client,
            self.min_delay,
            |page| self.page_url(cfg, page),
            limit,
            &mut records,
        )
        .await;
        tracing::debug!(
            company = %cfg.company_domain,
            records = records.len(),
            "crawler: trustpilot fetch finished"
        );
        FetchOutcome::from_parts(records, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_url_adds_language_filter() {
        let adapter = TrustpilotAdapter::new(Arc::new(PoliteClient::new(5, "VocBot").unwrap()))
            .with_base_url("https://tp.test/");
        let cfg = TrustpilotConfig {
            company_domain: "Acme.com".to_string(),
            language: Some("en".to_string()),
        };
        assert_eq!(
            adapter.page_url(&cfg, 2),
            "https://tp.test/review/acme.com?page=2&languages=en"
        );
    }
}
