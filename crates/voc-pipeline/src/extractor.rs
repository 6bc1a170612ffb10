//! Batched, retried LLM extraction of structured insights from feedback.
//!
//! Per batch:
//!
//! 1. Items that already spent their attempt budget are marked failed
//!    without a call.
//! 2. One completion covers the remaining items. Transient failures
//!    (timeout, 5xx, rate limit) are retried with back-off. Before every
//!    call each item's attempt is claimed in the store, and only items whose
//!    claim succeeded are sent, so redelivered jobs share one budget.
//! 3. Each returned object is validated on its own. Valid items become
//!    insights; missing or invalid items get one stricter reprompt, which
//!    draws on the same attempt budget.
//! 4. Anything still without an insight is marked `failed`.
//!
//! Batches run concurrently and fail independently.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use thiserror::Error;
use voc_core::{
    AppConfig, ExtractionStatus, ExtractionUsage, Feedback, Insight, NewExtractionBatch,
};
use voc_crawler::{retry_with_backoff, Retriable, RetryPolicy};
use voc_db::{DbError, Store};

use crate::error::{ExtractionError, LlmError};
use crate::llm::{Completion, CompletionClient, CompletionRequest};
use crate::prompts;
use crate::schema::{split_results, validate_item};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractorConfig {
    pub batch_size: usize,
    /// Completion calls allowed per feedback item, reprompts included.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    /// Batches in flight at once.
    pub concurrency: usize,
    pub call_timeout: Duration,
    pub prompt_cost_per_1k: Decimal,
    pub completion_cost_per_1k: Decimal,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            max_attempts: 3,
            backoff_base_ms: 1_000,
            concurrency: 4,
            call_timeout: Duration::from_secs(60),
            prompt_cost_per_1k: Decimal::new(3, 2),
            completion_cost_per_1k: Decimal::new(6, 2),
        }
    }
}

impl ExtractorConfig {
    #[must_use]
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            batch_size: config.extraction_batch_size,
            max_attempts: config.extraction_max_attempts,
            backoff_base_ms: config.extraction_backoff_base_ms,
            concurrency: config.extraction_concurrency,
            call_timeout: Duration::from_secs(config.llm_timeout_secs),
            prompt_cost_per_1k: config.prompt_cost_per_1k,
            completion_cost_per_1k: config.completion_cost_per_1k,
        }
    }

    /// Dollar cost of one completion's token usage.
    #[must_use]
    pub fn usage_for(&self, completion: &Completion) -> ExtractionUsage {
        let per_token =
            |tokens: u64, per_1k: Decimal| Decimal::from(tokens) * per_1k / Decimal::from(1_000);
        ExtractionUsage {
            prompt_tokens: completion.prompt_tokens,
            completion_tokens: completion.completion_tokens,
            cost_usd: per_token(completion.prompt_tokens, self.prompt_cost_per_1k)
                + per_token(completion.completion_tokens, self.completion_cost_per_1k),
        }
    }
}

/// What one extraction run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionReport {
    pub batches: usize,
    /// Insights created by this run.
    pub insights: Vec<Insight>,
    /// Feedback marked `failed` by this run.
    pub failed: Vec<i64>,
    /// Requested ids that were not pending (already extracted or failed).
    pub skipped: usize,
    pub llm_calls: u32,
    pub usage: ExtractionUsage,
}

impl ExtractionReport {
    fn merge(&mut self, other: ExtractionReport) {
        self.batches += other.batches;
        self.insights.extend(other.insights);
        self.failed.extend(other.failed);
        self.skipped += other.skipped;
        self.llm_calls += other.llm_calls;
        self.usage += other.usage;
    }
}

/// A completion attempt fails at the model, while claiming the attempt, or
/// because no item had budget left; only the first is worth retrying.
#[derive(Debug, Error)]
enum CallError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Store(#[from] DbError),
    #[error("attempt budget exhausted")]
    BudgetSpent,
}

impl Retriable for CallError {
    fn is_retriable(&self) -> bool {
        match self {
            CallError::Llm(e) => e.is_retriable(),
            CallError::Store(_) | CallError::BudgetSpent => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            CallError::Llm(e) => e.retry_after(),
            CallError::Store(_) | CallError::BudgetSpent => None,
        }
    }
}

/// Result of [`InsightExtractor::call`].
struct CallOutcome {
    result: Result<Completion, CallError>,
    /// Ids the final attempt was charged to and sent for.
    sent: Vec<i64>,
    llm_calls: u32,
}

fn lock(items: &Mutex<Vec<Feedback>>) -> std::sync::MutexGuard<'_, Vec<Feedback>> {
    items.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Split `items` into those whose id is in `ids` and the rest.
fn split_by_ids(items: Vec<Feedback>, ids: &[i64]) -> (Vec<Feedback>, Vec<Feedback>) {
    items.into_iter().partition(|f| ids.contains(&f.id))
}

pub struct InsightExtractor {
    store: Arc<dyn Store>,
    llm: Arc<dyn CompletionClient>,
    config: ExtractorConfig,
}

impl InsightExtractor {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        llm: Arc<dyn CompletionClient>,
        config: ExtractorConfig,
    ) -> Self {
        Self { store, llm, config }
    }

    #[must_use]
    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Extract insights for the given feedback ids.
    ///
    /// Ids that are unknown or no longer pending are skipped, so redelivered
    /// jobs are harmless.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] when the store fails. Model failures never surface
    /// here; they end as `failed` feedback in the report.
    pub async fn extract(&self, feedback_ids: &[i64]) -> Result<ExtractionReport, DbError> {
        let mut unique = Vec::with_capacity(feedback_ids.len());
        let mut seen = HashSet::new();
        for id in feedback_ids {
            if seen.insert(*id) {
                unique.push(*id);
            }
        }

        let rows = self.store.get_feedback(&unique).await?;
        let pending: Vec<Feedback> = rows
            .into_iter()
            .filter(|f| f.extraction_status == ExtractionStatus::Pending)
            .collect();
        let skipped = unique.len() - pending.len();

        let mut report = self.run_batches(pending).await?;
        report.skipped += skipped;
        Ok(report)
    }

    /// Extract up to `limit` of the oldest pending feedback rows.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] when the store fails.
    pub async fn extract_pending(&self, limit: i64) -> Result<ExtractionReport, DbError> {
        let pending = self.store.list_pending_feedback(limit).await?;
        self.run_batches(pending).await
    }

    /// Return up to `limit` failed rows to `pending` with a fresh budget.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] when the store fails.
    pub async fn retry_failed_extractions(&self, limit: i64) -> Result<Vec<i64>, DbError> {
        let ids = self.store.reset_failed_extractions(limit).await?;
        if !ids.is_empty() {
            tracing::info!(count = ids.len(), "extractor: failed extractions reset to pending");
        }
        Ok(ids)
    }

    async fn run_batches(&self, items: Vec<Feedback>) -> Result<ExtractionReport, DbError> {
        let batches: Vec<Vec<Feedback>> = items
            .chunks(self.config.batch_size.max(1))
            .map(<[Feedback]>::to_vec)
            .collect();

        let results: Vec<Result<ExtractionReport, DbError>> = stream::iter(batches)
            .map(|batch| self.run_batch(batch))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut report = ExtractionReport::default();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(batch) => report.merge(batch),
                Err(e) => {
                    tracing::error!(error = %e, "extractor: batch aborted by store error");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn run_batch(&self, items: Vec<Feedback>) -> Result<ExtractionReport, DbError> {
        let max_attempts = self.max_attempts();
        let mut report = ExtractionReport {
            batches: 1,
            ..ExtractionReport::default()
        };
        let item_count = items.len();

        let (exhausted, work): (Vec<Feedback>, Vec<Feedback>) = items
            .into_iter()
            .partition(|f| f.extraction_attempts >= max_attempts);
        self.fail_all(&exhausted, &ExtractionError::AttemptsExhausted, &mut report)
            .await?;
        if work.is_empty() {
            self.record_batch(&report, item_count).await?;
            return Ok(report);
        }

        let call = self.call(&work, prompts::batch_request).await;
        report.llm_calls += call.llm_calls;
        let charged = match call.result {
            Ok(completion) => {
                report.usage += self.config.usage_for(&completion);
                Some((call.sent, completion))
            }
            Err(CallError::Store(e)) => return Err(e),
            Err(CallError::Llm(e)) => {
                let err = ExtractionError::from(e);
                tracing::warn!(
                    items = work.len(),
                    calls = call.llm_calls,
                    error = %err,
                    "extractor: batch failed after retries"
                );
                self.fail_all(&work, &err, &mut report).await?;
                None
            }
            Err(CallError::BudgetSpent) => {
                tracing::info!(items = work.len(), "extractor: no attempt budget left for batch");
                self.fail_all(&work, &ExtractionError::AttemptsExhausted, &mut report)
                    .await?;
                None
            }
        };
        let Some((sent, completion)) = charged else {
            self.record_batch(&report, item_count).await?;
            return Ok(report);
        };

        // Items dropped between retries ran out of budget under another
        // delivery; whatever is still pending among them is done.
        let (sent_items, dropped) = split_by_ids(work, &sent);
        self.fail_all(&dropped, &ExtractionError::AttemptsExhausted, &mut report)
            .await?;

        let mut problems = self
            .store_valid(&sent_items, &completion.content, &mut report)
            .await?;

        if !problems.is_empty() {
            let retry_items: Vec<Feedback> = sent_items
                .iter()
                .filter(|f| problems.iter().any(|(id, _)| *id == f.id))
                .cloned()
                .collect();
            tracing::info!(
                items = retry_items.len(),
                "extractor: reprompting for invalid results"
            );

            let first_problems = problems.clone();
            let call = self
                .call(&retry_items, |items| prompts::strict_reprompt(items, &first_problems))
                .await;
            report.llm_calls += call.llm_calls;
            match call.result {
                Ok(completion) => {
                    report.usage += self.config.usage_for(&completion);
                    let (resent, unsent) = split_by_ids(retry_items, &call.sent);
                    problems = self
                        .store_valid(&resent, &completion.content, &mut report)
                        .await?;
                    problems.extend(
                        first_problems
                            .into_iter()
                            .filter(|(id, _)| unsent.iter().any(|f| f.id == *id)),
                    );
                }
                Err(CallError::Store(e)) => return Err(e),
                Err(CallError::BudgetSpent) => {}
                Err(CallError::Llm(e)) => {
                    let err = ExtractionError::from(e).to_string();
                    problems = retry_items.iter().map(|f| (f.id, err.clone())).collect();
                }
            }
        }

        for (id, reason) in &problems {
            tracing::warn!(feedback_id = id, reason = %reason, "extractor: extraction failed");
            if self.store.mark_extraction_failed(*id, reason).await? {
                report.failed.push(*id);
            }
        }

        self.record_batch(&report, item_count).await?;
        Ok(report)
    }

    fn max_attempts(&self) -> i32 {
        i32::try_from(self.config.max_attempts.max(1)).unwrap_or(i32::MAX)
    }

    /// One completion with retries.
    ///
    /// Every attempt first claims one unit of budget for the items still in
    /// play and narrows them to the ids the store charged; the request is
    /// built for exactly those. No charged ids ends the call with
    /// [`CallError::BudgetSpent`].
    async fn call<B>(&self, items: &[Feedback], build: B) -> CallOutcome
    where
        B: Fn(&[Feedback]) -> CompletionRequest + Sync,
    {
        let max_attempts = self.max_attempts();
        let in_play = Mutex::new(items.to_vec());
        let llm_calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(self.config.max_attempts, self.config.backoff_base_ms);

        let (result, _) = retry_with_backoff(policy, "extractor", |_attempt| {
            let (in_play, llm_calls, build) = (&in_play, &llm_calls, &build);
            async move {
                let ids: Vec<i64> = lock(in_play).iter().map(|f| f.id).collect();
                let charged = self.store.claim_extraction_attempt(&ids, max_attempts).await?;
                if charged.is_empty() {
                    return Err(CallError::BudgetSpent);
                }
                let request = {
                    let mut current = lock(in_play);
                    current.retain(|f| charged.contains(&f.id));
                    build(&current)
                };
                llm_calls.fetch_add(1, Ordering::SeqCst);
                let completion =
                    tokio::time::timeout(self.config.call_timeout, self.llm.complete(&request))
                        .await
                        .map_err(|_| LlmError::Timeout)??;
                Ok::<_, CallError>(completion)
            }
        })
        .await;

        let sent = in_play
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|f| f.id)
            .collect();
        CallOutcome {
            result,
            sent,
            llm_calls: llm_calls.into_inner(),
        }
    }

    /// Store every valid result among `items`; return `(id, reason)` for the
    /// rest.
    async fn store_valid(
        &self,
        items: &[Feedback],
        content: &str,
        report: &mut ExtractionReport,
    ) -> Result<Vec<(i64, String)>, DbError> {
        let mut by_id = match split_results(content) {
            Ok(by_id) => by_id,
            Err(e) => {
                return Ok(items.iter().map(|f| (f.id, e.to_string())).collect());
            }
        };

        let mut problems = Vec::new();
        for item in items {
            let Some(raw) = by_id.remove(&item.id) else {
                problems.push((item.id, "missing from response".to_string()));
                continue;
            };
            match validate_item(item.id, &raw) {
                Ok(new) => {
                    if let Some(insight) = self.store.insert_insight(&new).await? {
                        tracing::debug!(
                            feedback_id = item.id,
                            insight_id = insight.id,
                            "extractor: insight stored"
                        );
                        report.insights.push(insight);
                    }
                }
                Err(e) => problems.push((item.id, e.to_string())),
            }
        }
        Ok(problems)
    }

    async fn fail_all(
        &self,
        items: &[Feedback],
        err: &ExtractionError,
        report: &mut ExtractionReport,
    ) -> Result<(), DbError> {
        let reason = err.to_string();
        for item in items {
            if self.store.mark_extraction_failed(item.id, &reason).await? {
                report.failed.push(item.id);
            }
        }
        Ok(())
    }

    async fn record_batch(&self, report: &ExtractionReport, item_count: usize) -> Result<(), DbError> {
        let to_i32 = |n: usize| i32::try_from(n).unwrap_or(i32::MAX);
        self.store
            .record_extraction_batch(&NewExtractionBatch {
                item_count: to_i32(item_count),
                succeeded: to_i32(report.insights.len()),
                failed: to_i32(report.failed.len()),
                llm_calls: i32::try_from(report.llm_calls).unwrap_or(i32::MAX),
                usage: report.usage,
            })
            .await?;
        tracing::info!(
            items = item_count,
            succeeded = report.insights.len(),
            failed = report.failed.len(),
            llm_calls = report.llm_calls,
            prompt_tokens = report.usage.prompt_tokens,
            completion_tokens = report.usage.completion_tokens,
            cost_usd = %report.usage.cost_usd,
            "extractor: batch finished"
        );
        Ok(())
    }
}

#[cfg(test)]
#[path = "extractor_test.rs"]
mod tests;
