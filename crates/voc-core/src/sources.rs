//! Crawl sources and their per-platform configuration.
//!
//! Source configuration arrives as loosely shaped JSON (API payloads, the
//! `sources.config` column). [`SourceConfig::from_json`] is the only way in:
//! it selects the schema by platform tag and rejects unknown fields, so the
//! rest of the pipeline only ever sees a validated tagged union.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

text_enum! {
    /// Platform a source is crawled from.
    Platform {
        Reddit => "reddit",
        Youtube => "youtube",
        Trustpilot => "trustpilot",
        G2 => "g2",
        Twitter => "twitter",
        Quora => "quora",
    }
}

impl Platform {
    /// Crawl cadence used when a source does not set its own.
    #[must_use]
    pub fn default_cadence_minutes(self) -> i32 {
        match self {
            Platform::Reddit => 30,
            Platform::Youtube => 60,
            Platform::Trustpilot => 120,
            Platform::G2 => 240,
            Platform::Twitter => 15,
            Platform::Quora => 60,
        }
    }

    /// Minimum spacing between two requests to the same platform host.
    #[must_use]
    pub fn min_request_delay(self) -> Duration {
        match self {
            Platform::Reddit => Duration::from_secs(2),
            Platform::Youtube => Duration::from_secs(3),
            Platform::Trustpilot => Duration::from_secs(6),
            Platform::G2 => Duration::from_secs(12),
            Platform::Twitter => Duration::from_secs(1),
            Platform::Quora => Duration::from_secs(6),
        }
    }
}

text_enum! {
    RedditSort {
        Hot => "hot",
        New => "new",
        Top => "top",
        Relevance => "relevance",
    }
}

text_enum! {
    RedditTimeFilter {
        Hour => "hour",
        Day => "day",
        Week => "week",
        Month => "month",
        Year => "year",
        All => "all",
    }
}

text_enum! {
    TwitterResultType {
        Latest => "latest",
        Top => "top",
    }
}

fn default_reddit_sort() -> RedditSort {
    RedditSort::New
}

fn default_reddit_time_filter() -> RedditTimeFilter {
    RedditTimeFilter::Week
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedditConfig {
    pub subreddit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default = "default_reddit_sort")]
    pub sort: RedditSort,
    #[serde(default = "default_reddit_time_filter")]
    pub time_filter: RedditTimeFilter,
}

/// Exactly one of `channel_id` or `search_query` must be set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YoutubeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_query: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrustpilotConfig {
    pub company_domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct G2Config {
    pub product_slug: String,
}

fn default_twitter_result_type() -> TwitterResultType {
    TwitterResultType::Latest
}

/// Recent-search query against the X API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TwitterConfig {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default = "default_twitter_result_type")]
    pub result_type: TwitterResultType,
}

/// Question pages to read answers from, by URL slug.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuoraConfig {
    pub questions: Vec<String>,
}

const TWITTER_MAX_QUERY_CHARS: usize = 512;
const QUORA_MAX_QUESTIONS: usize = 25;

/// Validated per-platform configuration.
///
/// Serializes as the bare inner object; the platform tag lives in its own
/// column next to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SourceConfig {
    Reddit(RedditConfig),
    Youtube(YoutubeConfig),
    Trustpilot(TrustpilotConfig),
    G2(G2Config),
    Twitter(TwitterConfig),
    Quora(QuoraConfig),
}

#[derive(Debug, Error)]
pub enum SourceConfigError {
    #[error("malformed {platform} config: {source}")]
    Malformed {
        platform: Platform,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid {platform} config: {reason}")]
    Invalid { platform: Platform, reason: String },

    #[error("query override is not supported for {0} sources")]
    QueryOverrideUnsupported(Platform),
}

impl SourceConfig {
    /// Parse and validate raw JSON against the schema for `platform`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceConfigError::Malformed`] when the shape does not match
    /// (missing or unknown fields, wrong types) and
    /// [`SourceConfigError::Invalid`] when a value fails validation.
    pub fn from_json(
        platform: Platform,
        raw: &serde_json::Value,
    ) -> Result<Self, SourceConfigError> {
        let malformed = |source| SourceConfigError::Malformed { platform, source };
        let config = match platform {
            Platform::Reddit => {
                SourceConfig::Reddit(serde_json::from_value(raw.clone()).map_err(malformed)?)
            }
            Platform::Youtube => {
                SourceConfig::Youtube(serde_json::from_value(raw.clone()).map_err(malformed)?)
            }
            Platform::Trustpilot => {
                SourceConfig::Trustpilot(serde_json::from_value(raw.clone()).map_err(malformed)?)
            }
            Platform::G2 => {
                SourceConfig::G2(serde_json::from_value(raw.clone()).map_err(malformed)?)
            }
            Platform::Twitter => {
                SourceConfig::Twitter(serde_json::from_value(raw.clone()).map_err(malformed)?)
            }
            Platform::Quora => {
                SourceConfig::Quora(serde_json::from_value(raw.clone()).map_err(malformed)?)
            }
        };
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn platform(&self) -> Platform {
        match self {
            SourceConfig::Reddit(_) => Platform::Reddit,
            SourceConfig::Youtube(_) => Platform::Youtube,
            SourceConfig::Trustpilot(_) => Platform::Trustpilot,
            SourceConfig::G2(_) => Platform::G2,
            SourceConfig::Twitter(_) => Platform::Twitter,
            SourceConfig::Quora(_) => Platform::Quora,
        }
    }

    /// Check field values beyond what the serde shape enforces.
    ///
    /// # Errors
    ///
    /// Returns [`SourceConfigError::Invalid`] describing the first bad field.
    pub fn validate(&self) -> Result<(), SourceConfigError> {
        let platform = self.platform();
        let invalid = |reason: &str| SourceConfigError::Invalid {
            platform,
            reason: reason.to_string(),
        };

        match self {
            SourceConfig::Reddit(cfg) => {
                let name = cfg.subreddit.trim_start_matches("r/");
                if !(2..=21).contains(&name.len())
                    || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    return Err(invalid("subreddit must be 2-21 letters, digits or '_'"));
                }
                if cfg.query.as_deref().is_some_and(|q| q.trim().is_empty()) {
                    return Err(invalid("query must not be blank"));
                }
            }
            SourceConfig::Youtube(cfg) => match (&cfg.channel_id, &cfg.search_query) {
                (Some(id), None) => {
                    if id.is_empty()
                        || !id
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
                    {
                        return Err(invalid("channel_id contains invalid characters"));
                    }
                }
                (None, Some(q)) => {
                    if q.trim().is_empty() {
                        return Err(invalid("search_query must not be blank"));
                    }
                }
                _ => return Err(invalid("exactly one of channel_id or search_query is required")),
            },
            SourceConfig::Trustpilot(cfg) => {
                let domain = cfg.company_domain.as_str();
                if !domain.contains('.')
                    || domain.starts_with('.')
                    || domain
                        .chars()
                        .any(|c| c.is_whitespace() || c == '/' || c == ':')
                {
                    return Err(invalid("company_domain must be a bare domain like example.com"));
                }
            }
            SourceConfig::G2(cfg) => {
                let slug = cfg.product_slug.as_str();
                if slug.is_empty()
                    || !slug
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
                {
                    return Err(invalid("product_slug must be lowercase letters, digits or '-'"));
                }
            }
            SourceConfig::Twitter(cfg) => {
                let query = cfg.query.trim();
                if query.is_empty() || query.chars().count() > TWITTER_MAX_QUERY_CHARS {
                    return Err(invalid("query must be 1-512 characters"));
                }
                if let Some(language) = cfg.language.as_deref() {
                    if language.len() != 2 || !language.chars().all(|c| c.is_ascii_lowercase()) {
                        return Err(invalid("language must be a two-letter code like en"));
                    }
                }
            }
            SourceConfig::Quora(cfg) => {
                if cfg.questions.is_empty() || cfg.questions.len() > QUORA_MAX_QUESTIONS {
                    return Err(invalid("questions must list 1-25 question slugs"));
                }
                let bad_slug = |slug: &String| {
                    slug.is_empty()
                        || !slug.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                };
                if cfg.questions.iter().any(bad_slug) {
                    return Err(invalid("question slugs must be letters, digits or '-'"));
                }
            }
        }
        Ok(())
    }

    /// Return a copy of this config with its search query replaced.
    ///
    /// # Errors
    ///
    /// Returns [`SourceConfigError::QueryOverrideUnsupported`] for platforms
    /// that crawl a fixed page rather than a search, or
    /// [`SourceConfigError::Invalid`] for a blank query.
    pub fn with_query_override(&self, query: &str) -> Result<Self, SourceConfigError> {
        let platform = self.platform();
        let query = query.trim();
        if query.is_empty() {
            return Err(SourceConfigError::Invalid {
                platform,
                reason: "query override must not be blank".to_string(),
            });
        }

        match self {
            SourceConfig::Reddit(cfg) => Ok(SourceConfig::Reddit(RedditConfig {
                query: Some(query.to_string()),
                ..cfg.clone()
            })),
            SourceConfig::Youtube(_) => Ok(SourceConfig::Youtube(YoutubeConfig {
                channel_id: None,
                search_query: Some(query.to_string()),
            })),
            SourceConfig::Twitter(cfg) => Ok(SourceConfig::Twitter(TwitterConfig {
                query: query.to_string(),
                ..cfg.clone()
            })),
            SourceConfig::Trustpilot(_) | SourceConfig::G2(_) | SourceConfig::Quora(_) => {
                Err(SourceConfigError::QueryOverrideUnsupported(platform))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub config: SourceConfig,
    pub cadence_minutes: Option<i32>,
    pub is_active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Source {
    #[must_use]
    pub fn platform(&self) -> Platform {
        self.config.platform()
    }

    #[must_use]
    pub fn cadence(&self) -> chrono::Duration {
        let minutes = self
            .cadence_minutes
            .unwrap_or_else(|| self.platform().default_cadence_minutes());
        chrono::Duration::minutes(i64::from(minutes.max(1)))
    }

    /// `true` when the source is active and its cadence has elapsed since the
    /// last run (or it has never run).
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self
                .last_run_at
                .is_none_or(|last| now - last >= self.cadence())
    }
}

#[derive(Debug, Clone)]
pub struct NewSource {
    pub name: String,
    pub config: SourceConfig,
    pub cadence_minutes: Option<i32>,
    pub is_active: bool,
}

#[cfg(test)]
#[path = "sources_test.rs"]
mod tests;
