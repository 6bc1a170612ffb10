use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::feedback::DiscardReason;

text_enum! {
    /// Lifecycle of a crawl run.
    ///
    /// `pending` and `running` are outstanding and hold the per-source lock.
    CrawlStatus {
        Pending => "pending",
        Running => "running",
        Succeeded => "succeeded",
        Failed => "failed",
        Partial => "partial",
    }
}

impl CrawlStatus {
    #[must_use]
    pub fn is_outstanding(self) -> bool {
        matches!(self, CrawlStatus::Pending | CrawlStatus::Running)
    }
}

/// Counters accumulated while ingesting one crawl.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlStats {
    pub fetched: u32,
    pub stored: u32,
    pub duplicates: u32,
    pub discarded: u32,
    pub discard_reasons: BTreeMap<String, u32>,
}

impl CrawlStats {
    pub fn record_discard(&mut self, reason: DiscardReason) {
        self.discarded += 1;
        *self
            .discard_reasons
            .entry(reason.as_str().to_string())
            .or_default() += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrawlRun {
    pub id: i64,
    pub source_id: i64,
    pub status: CrawlStatus,
    pub query_override: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stats: CrawlStats,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}
