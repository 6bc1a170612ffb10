//! Aggregate counters for `getPipelineStats`.

use rust_decimal::Decimal;
use sqlx::PgPool;
use voc_core::PipelineStats;

use crate::DbError;

#[derive(Debug, sqlx::FromRow)]
struct FeedbackCounts {
    total: i64,
    pending: i64,
    failed: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct BatchTotals {
    batches: i64,
    prompt_tokens: i64,
    completion_tokens: i64,
    cost_usd: Decimal,
}

/// Collects discard, extraction, cost and alerting counters.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if any query fails.
pub async fn pipeline_stats(pool: &PgPool) -> Result<PipelineStats, DbError> {
    let discarded = sqlx::query_as::<_, (String, i64)>(
        "SELECT reason, COUNT(*) FROM feedback_discards GROUP BY reason ORDER BY reason",
    )
    .fetch_all(pool)
    .await?
    .into_iter()
    .collect();

    let duplicates = sqlx::query_scalar::<_, i64>(
        "SELECT COALESCE(SUM((stats->>'duplicates')::BIGINT), 0)::BIGINT FROM crawl_runs",
    )
    .fetch_one(pool)
    .await?;

    let feedback = sqlx::query_as::<_, FeedbackCounts>(
        "SELECT COUNT(*) AS total, \
                COUNT(*) FILTER (WHERE extraction_status = 'pending') AS pending, \
                COUNT(*) FILTER (WHERE extraction_status = 'failed') AS failed \
         FROM feedback",
    )
    .fetch_one(pool)
    .await?;

    let insights_total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM insights")
        .fetch_one(pool)
        .await?;

    let batches = sqlx::query_as::<_, BatchTotals>(
        "SELECT COUNT(*) AS batches, \
                COALESCE(SUM(prompt_tokens), 0)::BIGINT AS prompt_tokens, \
                COALESCE(SUM(completion_tokens), 0)::BIGINT AS completion_tokens, \
                COALESCE(SUM(cost_usd), 0) AS cost_usd \
         FROM extraction_batches",
    )
    .fetch_one(pool)
    .await?;

    let open_alerts =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM alert_events WHERE status = 'open'")
            .fetch_one(pool)
            .await?;

    let undelivered_notifications = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM alert_deliveries WHERE status = 'undelivered'",
    )
    .fetch_one(pool)
    .await?;

    Ok(PipelineStats {
        discarded,
        duplicates,
        feedback_total: feedback.total,
        extraction_pending: feedback.pending,
        extraction_failed: feedback.failed,
        insights_total,
        extraction_batches: batches.batches,
        prompt_tokens: batches.prompt_tokens,
        completion_tokens: batches.completion_tokens,
        cost_usd: batches.cost_usd,
        open_alerts,
        undelivered_notifications,
    })
}
