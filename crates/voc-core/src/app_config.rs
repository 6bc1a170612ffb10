use std::net::SocketAddr;
use std::path::PathBuf;

use rust_decimal::Decimal;

use crate::subscribers::WebhookSubscriber;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Development,
    Test,
    Production,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Test => write!(f, "test"),
            Environment::Production => write!(f, "production"),
        }
    }
}

#[derive(Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub env: Environment,
    pub bind_addr: SocketAddr,
    pub log_level: String,
    pub db_max_connections: u32,
    pub db_min_connections: u32,
    pub db_acquire_timeout_secs: u64,

    pub crawl_user_agent: String,
    pub crawl_request_timeout_secs: u64,
    pub crawl_concurrency: usize,
    pub crawl_fetch_limit: usize,
    pub crawl_run_ttl_secs: u64,
    pub min_content_chars: usize,
    pub twitter_bearer_token: Option<String>,

    pub llm_api_key: Option<String>,
    pub llm_base_url: String,
    pub llm_model: String,
    pub llm_timeout_secs: u64,
    pub extraction_batch_size: usize,
    pub extraction_max_attempts: u32,
    pub extraction_backoff_base_ms: u64,
    pub extraction_concurrency: usize,
    pub prompt_cost_per_1k: Decimal,
    pub completion_cost_per_1k: Decimal,

    pub embedding_url: Option<String>,
    pub similarity_threshold: f32,
    pub max_themes_per_insight: usize,
    pub taxonomy_path: Option<PathBuf>,

    pub alert_eval_cron: String,
    pub notify_max_attempts: u32,
    pub notify_backoff_base_ms: u64,
    pub webhook_secret: Option<String>,
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub smtp_from: String,
    pub webhook_subscribers: Vec<WebhookSubscriber>,

    pub job_max_attempts: i32,
    pub job_visibility_secs: u64,
    pub processing_workers: usize,
    pub alert_workers: usize,
}

fn redact(value: Option<&String>) -> Option<&'static str> {
    value.map(|_| "[redacted]")
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("env", &self.env)
            .field("bind_addr", &self.bind_addr)
            .field("log_level", &self.log_level)
            .field("database_url", &"[redacted]")
            .field("db_max_connections", &self.db_max_connections)
            .field("db_min_connections", &self.db_min_connections)
            .field("db_acquire_timeout_secs", &self.db_acquire_timeout_secs)
            .field("crawl_user_agent", &self.crawl_user_agent)
            .field(
                "crawl_request_timeout_secs",
                &self.crawl_request_timeout_secs,
            )
            .field("crawl_concurrency", &self.crawl_concurrency)
            .field("crawl_fetch_limit", &self.crawl_fetch_limit)
            .field("crawl_run_ttl_secs", &self.crawl_run_ttl_secs)
            .field("min_content_chars", &self.min_content_chars)
            .field(
                "twitter_bearer_token",
                &redact(self.twitter_bearer_token.as_ref()),
            )
            .field("llm_api_key", &redact(self.llm_api_key.as_ref()))
            .field("llm_base_url", &self.llm_base_url)
            .field("llm_model", &self.llm_model)
            .field("llm_timeout_secs", &self.llm_timeout_secs)
            .field("extraction_batch_size", &self.extraction_batch_size)
            .field("extraction_max_attempts", &self.extraction_max_attempts)
            .field(
                "extraction_backoff_base_ms",
                &self.extraction_backoff_base_ms,
            )
            .field("extraction_concurrency", &self.extraction_concurrency)
            .field("prompt_cost_per_1k", &self.prompt_cost_per_1k)
            .field("completion_cost_per_1k", &self.completion_cost_per_1k)
            .field("embedding_url", &self.embedding_url)
            .field("similarity_threshold", &self.similarity_threshold)
            .field("max_themes_per_insight", &self.max_themes_per_insight)
            .field("taxonomy_path", &self.taxonomy_path)
            .field("alert_eval_cron", &self.alert_eval_cron)
            .field("notify_max_attempts", &self.notify_max_attempts)
            .field("notify_backoff_base_ms", &self.notify_backoff_base_ms)
            .field("webhook_secret", &redact(self.webhook_secret.as_ref()))
            .field("smtp_host", &self.smtp_host)
            .field("smtp_port", &self.smtp_port)
            .field("smtp_username", &self.smtp_username)
            .field("smtp_password", &redact(self.smtp_password.as_ref()))
            .field("smtp_from", &self.smtp_from)
            .field("webhook_subscribers", &self.webhook_subscribers)
            .field("job_max_attempts", &self.job_max_attempts)
            .field("job_visibility_secs", &self.job_visibility_secs)
            .field("processing_workers", &self.processing_workers)
            .field("alert_workers", &self.alert_workers)
            .finish()
    }
}
