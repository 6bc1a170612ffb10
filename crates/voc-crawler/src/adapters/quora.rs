use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use voc_core::{Platform, QuoraConfig, SourceConfig};

use super::jsonld::extract_answers;
use super::{trim_base_url, wrong_platform};
use crate::adapter::CrawlerAdapter;
use crate::client::PoliteClient;
use crate::error::CrawlError;
use crate::types::{FetchOutcome, RawRecord};

const DEFAULT_BASE_URL: &str = "https://www.quora.com";

/// Answers from configured question pages, one page per question slug.
pub struct QuoraAdapter {
    client: Arc<PoliteClient>,
    base_url: String,
    min_delay: Duration,
}

impl QuoraAdapter {
    #[must_use]
    pub fn new(client: Arc<PoliteClient>) -> Self {
        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            min_delay: Platform::Quora.min_request_delay(),
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

    async fn collect(
        &self,
        cfg: &QuoraConfig,
        limit: usize,
        records: &mut Vec<RawRecord>,
    ) -> Result<(), CrawlError> {
        let mut seen = HashSet::new();
        for slug in &cfg.questions {
            if records.len() >= limit {
                break;
            }
            let html = self
                .client
                .get_text(&format!("{}/{slug}", self.base_url), self.min_delay)
                .await?;
            for answer in extract_answers(&html) {
                if records.len() >= limit {
                    break;
                }
                if seen.insert(answer.external_id.clone()) {
                    records.push(answer);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CrawlerAdapter for QuoraAdapter {
    fn platform(&self) -> Platform {
        Platform::Quora
    }

    async fn fetch(&self, config: &SourceConfig, limit: usize) -> FetchOutcome {
        let SourceConfig::Quora(cfg) = config else {
            return FetchOutcome::failed(wrong_platform(Platform::Quora, config.platform()));
        };

        let mut records = Vec::new();
        let result = self.collect(cfg, limit, &mut records).await;
        tracing::debug!(
            questions = cfg.questions.len(),
            records = records.len(),
            error = result.as_ref().err().map(ToString::to_string),
            "crawler: quora fetch finished"
        );
        FetchOutcome::from_parts(records, result)
    }
}
