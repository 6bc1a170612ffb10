use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::CrawlError;

/// One piece of content as fetched from a platform, before cleaning.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawRecord {
    /// Platform-native id (post id, review id, video id).
    pub external_id: String,
    pub content: String,
    pub title: Option<String>,
    pub author_handle: Option<String>,
    pub url: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    /// Platform-specific extras (score, rating, subreddit, ...).
    pub metadata: serde_json::Value,
}

impl RawRecord {
    /// Title and body joined the way the cleaner expects them.
    #[must_use]
    pub fn full_text(&self) -> String {
        match self.title.as_deref().map(str::trim) {
            Some(title) if !title.is_empty() && !self.content.contains(title) => {
                format!("{title}\n\n{}", self.content)
            }
            _ => self.content.clone(),
        }
    }
}

/// What an adapter produced for one fetch.
///
/// An error may accompany records already collected (a later page failed);
/// callers keep those records.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub records: Vec<RawRecord>,
    pub error: Option<CrawlError>,
}

impl FetchOutcome {
    #[must_use]
    pub fn complete(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            error: None,
        }
    }

    #[must_use]
    pub fn partial(records: Vec<RawRecord>, error: CrawlError) -> Self {
        Self {
            records,
            error: Some(error),
        }
    }

    #[must_use]
    pub fn failed(error: CrawlError) -> Self {
        Self {
            records: Vec::new(),
            error: Some(error),
        }
    }

    /// Wrap a fallible page loop: records gathered before the error are kept.
    #[must_use]
    pub fn from_parts(records: Vec<RawRecord>, result: Result<(), CrawlError>) -> Self {
        match result {
            Ok(()) => Self::complete(records),
            Err(error) => Self::partial(records, error),
        }
    }
}
