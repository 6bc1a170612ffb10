//! Database operations for `feedback` and `feedback_discards`.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use voc_core::{Feedback, NewDiscard, NewFeedback};

use crate::DbError;

/// A row from the `feedback` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FeedbackRow {
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
    pub extraction_status: String,
    pub extraction_attempts: i32,
    pub extraction_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<FeedbackRow> for Feedback {
    type Error = DbError;

    fn try_from(row: FeedbackRow) -> Result<Self, Self::Error> {
        Ok(Feedback {
            id: row.id,
            source_id: row.source_id,
            crawl_run_id: row.crawl_run_id,
            external_id: row.external_id,
            raw_content: row.raw_content,
            clean_content: row.clean_content,
            fingerprint: row.fingerprint,
            posted_at: row.posted_at,
            author_handle: row.author_handle,
            url: row.url,
            metadata: row.metadata,
            extraction_status: row.extraction_status.parse()?,
            extraction_attempts: row.extraction_attempts,
            extraction_error: row.extraction_error,
            created_at: row.created_at,
        })
    }
}

/// Inserts feedback, treating a `(source_id, fingerprint)` conflict as an
/// exact duplicate.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the insert fails for another reason.
pub async fn insert_feedback(pool: &PgPool, new: &NewFeedback) -> Result<Option<i64>, DbError> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO feedback \
             (source_id, crawl_run_id, external_id, raw_content, clean_content, \
              fingerprint, posted_at, author_handle, url, metadata) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
         ON CONFLICT ON CONSTRAINT uq_feedback_source_fingerprint DO NOTHING \
         RETURNING id",
    )
    .bind(new.source_id)
    .bind(new.crawl_run_id)
    .bind(&new.external_id)
    .bind(&new.raw_content)
    .bind(&new.clean_content)
    .bind(&new.fingerprint)
    .bind(new.posted_at)
    .bind(new.author_handle.as_deref())
    .bind(new.url.as_deref())
    .bind(&new.metadata)
    .fetch_optional(pool)
    .await?;

    Ok(id)
}

/// Records why a raw record was dropped.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the insert fails.
pub async fn record_discard(pool: &PgPool, discard: &NewDiscard) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO feedback_discards (source_id, crawl_run_id, external_id, reason) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(discard.source_id)
    .bind(discard.crawl_run_id)
    .bind(discard.external_id.as_deref())
    .bind(discard.reason.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

/// Fetches feedback rows by id, in id order. Missing ids are skipped.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn get_feedback(pool: &PgPool, ids: &[i64]) -> Result<Vec<Feedback>, DbError> {
    let rows = sqlx::query_as::<_, FeedbackRow>(
        "SELECT id, source_id, crawl_run_id, external_id, raw_content, clean_content, \
                fingerprint, posted_at, author_handle, url, metadata, \
                extraction_status, extraction_attempts, extraction_error, created_at \
         FROM feedback \
         WHERE id = ANY($1) \
         ORDER BY id",
    )
    .bind(ids)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(Feedback::try_from).collect()
}

/// Lists the oldest `pending` feedback.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_pending_feedback(pool: &PgPool, limit: i64) -> Result<Vec<Feedback>, DbError> {
    let rows = sqlx::query_as::<_, FeedbackRow>(
        "SELECT id, source_id, crawl_run_id, external_id, raw_content, clean_content, \
                fingerprint, posted_at, author_handle, url, metadata, \
                extraction_status, extraction_attempts, extraction_error, created_at \
         FROM feedback \
         WHERE extraction_status = 'pending' \
         ORDER BY id \
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(Feedback::try_from).collect()
}

/// Charges one attempt to each pending row in `ids` still under
/// `max_attempts`, returning the charged ids.
///
/// The guard lives in the `WHERE` clause, so concurrent deliveries of the
/// same job share one budget per row.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the update fails.
pub async fn claim_extraction_attempt(
    pool: &PgPool,
    ids: &[i64],
    max_attempts: i32,
) -> Result<Vec<i64>, DbError> {
    let mut charged = sqlx::query_scalar::<_, i64>(
        "UPDATE feedback \
         SET extraction_attempts = extraction_attempts + 1, extraction_touched_at = NOW() \
         WHERE id = ANY($1) \
           AND extraction_status = 'pending' \
           AND extraction_attempts < $2 \
         RETURNING id",
    )
    .bind(ids)
    .bind(max_attempts)
    .fetch_all(pool)
    .await?;
    charged.sort_unstable();
    Ok(charged)
}

/// Claims up to `limit` pending rows untouched since `idle_before`.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the update fails.
pub async fn claim_idle_pending_feedback(
    pool: &PgPool,
    idle_before: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<i64>, DbError> {
    let mut ids = sqlx::query_scalar::<_, i64>(
        "UPDATE feedback \
         SET extraction_touched_at = NOW() \
         WHERE id IN ( \
             SELECT id FROM feedback \
             WHERE extraction_status = 'pending' \
               AND extraction_touched_at < $1 \
             ORDER BY id \
             LIMIT $2 \
             FOR UPDATE SKIP LOCKED \
         ) \
         RETURNING id",
    )
    .bind(idle_before)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    ids.sort_unstable();
    Ok(ids)
}

/// Marks a pending row as `failed`.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the update fails.
pub async fn mark_extraction_failed(pool: &PgPool, id: i64, error: &str) -> Result<bool, DbError> {
    let result = sqlx::query(
        "UPDATE feedback \
         SET extraction_status = 'failed', extraction_error = $1 \
         WHERE id = $2 AND extraction_status = 'pending'",
    )
    .bind(error)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Returns up to `limit` failed rows to `pending` with attempts reset.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the update fails.
pub async fn reset_failed_extractions(pool: &PgPool, limit: i64) -> Result<Vec<i64>, DbError> {
    let ids = sqlx::query_scalar::<_, i64>(
        "UPDATE feedback \
         SET extraction_status = 'pending', extraction_attempts = 0, extraction_error = NULL \
         WHERE id IN ( \
             SELECT id FROM feedback \
             WHERE extraction_status = 'failed' \
             ORDER BY id \
             LIMIT $1 \
             FOR UPDATE SKIP LOCKED \
         ) \
         RETURNING id",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}
