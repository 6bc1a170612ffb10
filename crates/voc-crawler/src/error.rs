use std::time::Duration;

use thiserror::Error;

use crate::retry::Retriable;

/// Default back-off when a 429 carries no usable `Retry-After`.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CrawlError {
    #[error("rate limited (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("blocked: {0}")]
    Blocked(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid source config: {0}")]
    InvalidConfig(String),
}

impl CrawlError {
    /// Short machine-readable name stored alongside run errors.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            CrawlError::RateLimited { .. } => "rate_limited",
            CrawlError::Blocked(_) => "blocked",
            CrawlError::Network(_) => "network",
            CrawlError::InvalidConfig(_) => "invalid_config",
        }
    }
}

impl Retriable for CrawlError {
    fn is_retriable(&self) -> bool {
        matches!(self, CrawlError::Network(_))
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            CrawlError::RateLimited { retry_after_secs } => {
                Some(Duration::from_secs(*retry_after_secs))
            }
            _ => None,
        }
    }
}

impl From<reqwest::Error> for CrawlError {
    fn from(err: reqwest::Error) -> Self {
        CrawlError::Network(err.to_string())
    }
}

impl From<voc_core::SourceConfigError> for CrawlError {
    fn from(err: voc_core::SourceConfigError) -> Self {
        CrawlError::InvalidConfig(err.to_string())
    }
}
