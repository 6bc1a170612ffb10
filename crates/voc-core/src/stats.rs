use std::collections::BTreeMap;
use std::ops::AddAssign;

use rust_decimal::Decimal;
use serde::Serialize;

/// Token usage and cost of one or more LLM calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExtractionUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: Decimal,
}

impl AddAssign for ExtractionUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
        self.cost_usd += rhs.cost_usd;
    }
}

/// Accounting row written once per extraction batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewExtractionBatch {
    pub item_count: i32,
    pub succeeded: i32,
    pub failed: i32,
    pub llm_calls: i32,
    pub usage: ExtractionUsage,
}

/// Operational counters exposed to the API layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub discarded: BTreeMap<String, i64>,
    pub duplicates: i64,
    pub feedback_total: i64,
    pub extraction_pending: i64,
    pub extraction_failed: i64,
    pub insights_total: i64,
    pub extraction_batches: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cost_usd: Decimal,
    pub open_alerts: i64,
    pub undelivered_notifications: i64,
}
