use chrono::{DateTime, Utc};
use serde::Serialize;

text_enum! {
    ExtractionStatus {
        Pending => "pending",
        Succeeded => "succeeded",
        Failed => "failed",
    }
}

text_enum! {
    /// Why a raw record was dropped before becoming feedback.
    DiscardReason {
        Empty => "empty",
        TooShort => "too_short",
        MissingTimestamp => "missing_timestamp",
        MissingSource => "missing_source",
    }
}

/// Cleaned, fingerprinted content ready for insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFeedback {
    pub source_id: i64,
    pub crawl_run_id: Option<i64>,
    pub external_id: String,
    pub raw_content: String,
    pub clean_content: String,
    pub fingerprint: String,
    pub posted_at: DateTime<Utc>,
    pub author_handle: Option<String>,
    pub url: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct Feedback {
    pub id: i64,
    pub source_id: i64,
    pub crawl_run_id: Option<i64>,
    pub external_id: String,
    pub raw_content: String,
    pub clean_content: String,
    pub fingerprint: String,
    pub posted_at: DateTime<Utc>,
    pub author_handle: Option<String>,
    pub url: Option<String>,
    pub metadata: serde_json::Value,
    pub extraction_status: ExtractionStatus,
    pub extraction_attempts: i32,
    pub extraction_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDiscard {
    pub source_id: i64,
    pub crawl_run_id: Option<i64>,
    pub external_id: Option<String>,
    pub reason: DiscardReason,
}
