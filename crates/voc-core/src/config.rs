use std::str::FromStr;

use crate::app_config::{AppConfig, Environment};
use crate::subscribers::parse_subscribers;
use crate::ConfigError;

/// Load application configuration from environment variables.
///
/// Calls `dotenvy::dotenv().ok()` to load `.env` files before reading env vars.
///
/// # Errors
///
/// Returns `ConfigError` if required env vars are missing or values are invalid.
pub fn load_app_config() -> Result<AppConfig, ConfigError> {
    dotenvy::dotenv().ok();
    load_app_config_from_env()
}

/// Load application configuration from environment variables already in the process.
///
/// Unlike [`load_app_config`], this does NOT load `.env` files.
///
/// # Errors
///
/// Returns `ConfigError` if required env vars are missing or values are invalid.
pub fn load_app_config_from_env() -> Result<AppConfig, ConfigError> {
    build_app_config(|key| std::env::var(key))
}

/// Parse `var` (or `default` when unset) into `T`.
fn parse_var<F, T>(lookup: &F, var: &str, default: &str) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(var).unwrap_or_else(|_| default.to_string());
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidEnvVar {
            var: var.to_string(),
            reason: e.to_string(),
        })
}

/// Build application configuration using the provided env-var lookup function.
///
/// Decoupled from the process environment so it can be tested with a plain
/// `HashMap` lookup.
#[allow(clippy::too_many_lines)]
fn build_app_config<F>(lookup: F) -> Result<AppConfig, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    use std::path::PathBuf;

    let require = |var: &str| -> Result<String, ConfigError> {
        lookup(var).map_err(|_| ConfigError::MissingEnvVar(var.to_string()))
    };

    let or_default = |var: &str, default: &str| -> String {
        lookup(var).unwrap_or_else(|_| default.to_string())
    };

    // Unset and blank both mean "not configured".
    let optional = |var: &str| -> Option<String> {
        lookup(var)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let database_url = require("DATABASE_URL")?;
    let env = parse_environment(&or_default("VOC_ENV", "development"))?;
    let bind_addr = parse_var(&lookup, "VOC_BIND_ADDR", "0.0.0.0:3000")?;
    let log_level = or_default("VOC_LOG_LEVEL", "info");

    let db_max_connections = parse_var(&lookup, "VOC_DB_MAX_CONNECTIONS", "10")?;
    let db_min_connections = parse_var(&lookup, "VOC_DB_MIN_CONNECTIONS", "1")?;
    let db_acquire_timeout_secs = parse_var(&lookup, "VOC_DB_ACQUIRE_TIMEOUT_SECS", "10")?;

    let crawl_user_agent = or_default(
        "VOC_CRAWL_USER_AGENT",
        "voc-pipeline/0.1 (+feedback-monitoring)",
    );
    let crawl_request_timeout_secs = parse_var(&lookup, "VOC_CRAWL_REQUEST_TIMEOUT_SECS", "30")?;
    let crawl_concurrency = parse_positive(&lookup, "VOC_CRAWL_CONCURRENCY", "4")?;
    let crawl_fetch_limit = parse_positive(&lookup, "VOC_CRAWL_FETCH_LIMIT", "100")?;
    let crawl_run_ttl_secs = parse_var(&lookup, "VOC_CRAWL_RUN_TTL_SECS", "3600")?;
    let min_content_chars = parse_var(&lookup, "VOC_MIN_CONTENT_CHARS", "40")?;
    let twitter_bearer_token = optional("VOC_TWITTER_BEARER_TOKEN");

    let llm_api_key = optional("VOC_LLM_API_KEY");
    let llm_base_url = or_default("VOC_LLM_BASE_URL", "https://api.openai.com/v1");
    let llm_model = or_default("VOC_LLM_MODEL", "gpt-4o-mini");
    let llm_timeout_secs = parse_var(&lookup, "VOC_LLM_TIMEOUT_SECS", "60")?;
    let extraction_batch_size = parse_positive(&lookup, "VOC_EXTRACTION_BATCH_SIZE", "5")?;
    let extraction_max_attempts: u32 = parse_var(&lookup, "VOC_EXTRACTION_MAX_ATTEMPTS", "3")?;
    if extraction_max_attempts == 0 {
        return Err(ConfigError::InvalidEnvVar {
            var: "VOC_EXTRACTION_MAX_ATTEMPTS".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    let extraction_backoff_base_ms = parse_var(&lookup, "VOC_EXTRACTION_BACKOFF_BASE_MS", "1000")?;
    let extraction_concurrency = parse_positive(&lookup, "VOC_EXTRACTION_CONCURRENCY", "4")?;
    let prompt_cost_per_1k = parse_var(&lookup, "VOC_PROMPT_COST_PER_1K", "0.03")?;
    let completion_cost_per_1k = parse_var(&lookup, "VOC_COMPLETION_COST_PER_1K", "0.06")?;

    let embedding_url = optional("VOC_EMBEDDING_URL");
    let similarity_threshold: f32 = parse_var(&lookup, "VOC_SIMILARITY_THRESHOLD", "0.85")?;
    if !(0.0..=1.0).contains(&similarity_threshold) {
        return Err(ConfigError::InvalidEnvVar {
            var: "VOC_SIMILARITY_THRESHOLD".to_string(),
            reason: "must be between 0 and 1".to_string(),
        });
    }
    let max_themes_per_insight = parse_positive(&lookup, "VOC_MAX_THEMES_PER_INSIGHT", "3")?;
    let taxonomy_path = optional("VOC_TAXONOMY_PATH").map(PathBuf::from);

    let alert_eval_cron = or_default("VOC_ALERT_EVAL_CRON", "0 */5 * * * *");
    let notify_max_attempts = parse_var(&lookup, "VOC_NOTIFY_MAX_ATTEMPTS", "3")?;
    let notify_backoff_base_ms = parse_var(&lookup, "VOC_NOTIFY_BACKOFF_BASE_MS", "500")?;
    let webhook_secret = optional("VOC_WEBHOOK_SECRET");
    let smtp_host = optional("VOC_SMTP_HOST");
    let smtp_port = parse_var(&lookup, "VOC_SMTP_PORT", "25")?;
    let smtp_username = optional("VOC_SMTP_USERNAME");
    let smtp_password = optional("VOC_SMTP_PASSWORD");
    let smtp_from = or_default("VOC_SMTP_FROM", "alerts@localhost");
    let webhook_subscribers = parse_subscribers(&or_default("VOC_WEBHOOK_SUBSCRIBERS", ""))
        .map_err(|reason| ConfigError::InvalidEnvVar {
            var: "VOC_WEBHOOK_SUBSCRIBERS".to_string(),
            reason,
        })?;

    let job_max_attempts = parse_var(&lookup, "VOC_JOB_MAX_ATTEMPTS", "5")?;
    let job_visibility_secs = parse_var(&lookup, "VOC_JOB_VISIBILITY_SECS", "300")?;
    let processing_workers = parse_positive(&lookup, "VOC_PROCESSING_WORKERS", "2")?;
    let alert_workers = parse_positive(&lookup, "VOC_ALERT_WORKERS", "1")?;

    Ok(AppConfig {
        database_url,
        env,
        bind_addr,
        log_level,
        db_max_connections,
        db_min_connections,
        db_acquire_timeout_secs,
        crawl_user_agent,
        crawl_request_timeout_secs,
        crawl_concurrency,
        crawl_fetch_limit,
        crawl_run_ttl_secs,
        min_content_chars,
        twitter_bearer_token,
        llm_api_key,
        llm_base_url,
        llm_model,
        llm_timeout_secs,
        extraction_batch_size,
        extraction_max_attempts,
        extraction_backoff_base_ms,
        extraction_concurrency,
        prompt_cost_per_1k,
        completion_cost_per_1k,
        embedding_url,
        similarity_threshold,
        max_themes_per_insight,
        taxonomy_path,
        alert_eval_cron,
        notify_max_attempts,
        notify_backoff_base_ms,
        webhook_secret,
        smtp_host,
        smtp_port,
        smtp_username,
        smtp_password,
        smtp_from,
        webhook_subscribers,
        job_max_attempts,
        job_visibility_secs,
        processing_workers,
        alert_workers,
    })
}

/// Like [`parse_var`] for pool sizes and limits, which must be non-zero.
fn parse_positive<F>(lookup: &F, var: &str, default: &str) -> Result<usize, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    let value: usize = parse_var(lookup, var, default)?;
    if value == 0 {
        return Err(ConfigError::InvalidEnvVar {
            var: var.to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(value)
}

/// Parse a string into an `Environment` variant.
fn parse_environment(s: &str) -> Result<Environment, ConfigError> {
    match s {
        "development" => Ok(Environment::Development),
        "test" => Ok(Environment::Test),
        "production" => Ok(Environment::Production),
        other => Err(ConfigError::InvalidEnvVar {
            var: "VOC_ENV".to_string(),
            reason: format!("expected development, test, or production; got {other:?}"),
        }),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
