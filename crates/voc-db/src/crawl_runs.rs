//! Database operations for `crawl_runs`.
//!
//! The partial unique index `uq_crawl_runs_outstanding` allows one `pending`
//! or `running` row per source; [`claim_crawl_run`] relies on it as the
//! per-source lock.

use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};
use voc_core::{CrawlRun, CrawlStats, CrawlStatus};

use crate::DbError;

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A row from the `crawl_runs` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CrawlRunRow {
    pub id: i64,
    pub source_id: i64,
    pub status: String,
    pub query_override: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stats: Json<CrawlStats>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<CrawlRunRow> for CrawlRun {
    type Error = DbError;

    fn try_from(row: CrawlRunRow) -> Result<Self, Self::Error> {
        Ok(CrawlRun {
            id: row.id,
            source_id: row.source_id,
            status: row.status.parse()?,
            query_override: row.query_override,
            started_at: row.started_at,
            finished_at: row.finished_at,
            stats: row.stats.0,
            error_message: row.error_message,
            created_at: row.created_at,
        })
    }
}

fn into_runs(rows: Vec<CrawlRunRow>) -> Result<Vec<CrawlRun>, DbError> {
    rows.into_iter().map(CrawlRun::try_from).collect()
}

// ---------------------------------------------------------------------------
// Lock and lifecycle
// ---------------------------------------------------------------------------

/// Inserts a `pending` run unless the source already has an outstanding one.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the insert fails for any reason other than
/// the outstanding-run conflict.
pub async fn claim_crawl_run(
    pool: &PgPool,
    source_id: i64,
    query_override: Option<&str>,
) -> Result<Option<CrawlRun>, DbError> {
    let row = sqlx::query_as::<_, CrawlRunRow>(
        "INSERT INTO crawl_runs (source_id, status, query_override) \
         VALUES ($1, 'pending', $2) \
         ON CONFLICT (source_id) WHERE status IN ('pending', 'running') DO NOTHING \
         RETURNING id, source_id, status, query_override, started_at, finished_at, \
                   stats, error_message, created_at",
    )
    .bind(source_id)
    .bind(query_override)
    .fetch_optional(pool)
    .await?;

    row.map(CrawlRun::try_from).transpose()
}

/// Deletes a run that is still `pending`.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the delete fails.
pub async fn release_crawl_run(pool: &PgPool, run_id: i64) -> Result<(), DbError> {
    sqlx::query("DELETE FROM crawl_runs WHERE id = $1 AND status = 'pending'")
        .bind(run_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Moves a run from `pending` to `running` and sets `started_at = NOW()`.
///
/// # Errors
///
/// Returns [`DbError::InvalidCrawlRunTransition`] if the run is terminal,
/// [`DbError::NotFound`] if it does not exist.
pub async fn start_crawl_run(pool: &PgPool, run_id: i64) -> Result<CrawlRun, DbError> {
    let started = sqlx::query_as::<_, CrawlRunRow>(
        "UPDATE crawl_runs \
         SET status = 'running', started_at = NOW() \
         WHERE id = $1 AND status = 'pending' \
         RETURNING id, source_id, status, query_override, started_at, finished_at, \
                   stats, error_message, created_at",
    )
    .bind(run_id)
    .fetch_optional(pool)
    .await?;

    if let Some(row) = started {
        return row.try_into();
    }

    let current = get_crawl_run(pool, run_id).await?;
    if current.status == CrawlStatus::Running {
        return Ok(current);
    }
    Err(DbError::InvalidCrawlRunTransition {
        id: run_id,
        expected: "pending",
    })
}

/// Writes a terminal status, stats and error for an outstanding run.
///
/// # Errors
///
/// Returns [`DbError::InvalidCrawlRunTransition`] if the run is not
/// outstanding, or [`DbError::InvalidData`] for a non-terminal `status`.
pub async fn finish_crawl_run(
    pool: &PgPool,
    run_id: i64,
    status: CrawlStatus,
    stats: &CrawlStats,
    error_message: Option<&str>,
) -> Result<(), DbError> {
    if status.is_outstanding() {
        return Err(DbError::InvalidData(format!(
            "{status} is not a terminal crawl status"
        )));
    }

    let result = sqlx::query(
        "UPDATE crawl_runs \
         SET status = $1, stats = $2, error_message = $3, finished_at = NOW(), \
             started_at = COALESCE(started_at, NOW()) \
         WHERE id = $4 AND status IN ('pending', 'running')",
    )
    .bind(status.as_str())
    .bind(Json(stats))
    .bind(error_message)
    .bind(run_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::InvalidCrawlRunTransition {
            id: run_id,
            expected: "pending or running",
        });
    }
    Ok(())
}

/// Fails every outstanding run created before `created_before`.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the update fails.
pub async fn fail_stale_crawl_runs(
    pool: &PgPool,
    created_before: DateTime<Utc>,
    reason: &str,
) -> Result<u64, DbError> {
    let result = sqlx::query(
        "UPDATE crawl_runs \
         SET status = 'failed', error_message = $1, finished_at = NOW() \
         WHERE status IN ('pending', 'running') AND created_at < $2",
    )
    .bind(reason)
    .bind(created_before)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// Fetches a single run by id.
///
/// # Errors
///
/// Returns [`DbError::NotFound`] if no row exists with the given `id`.
pub async fn get_crawl_run(pool: &PgPool, id: i64) -> Result<CrawlRun, DbError> {
    let row = sqlx::query_as::<_, CrawlRunRow>(
        "SELECT id, source_id, status, query_override, started_at, finished_at, \
                stats, error_message, created_at \
         FROM crawl_runs \
         WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)?;

    row.try_into()
}

/// Returns the outstanding run for a source, if any.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn outstanding_crawl_run(
    pool: &PgPool,
    source_id: i64,
) -> Result<Option<CrawlRun>, DbError> {
    let row = sqlx::query_as::<_, CrawlRunRow>(
        "SELECT id, source_id, status, query_override, started_at, finished_at, \
                stats, error_message, created_at \
         FROM crawl_runs \
         WHERE source_id = $1 AND status IN ('pending', 'running')",
    )
    .bind(source_id)
    .fetch_optional(pool)
    .await?;

    row.map(CrawlRun::try_from).transpose()
}

/// Counts runs that are `pending` or `running` across all sources.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn count_outstanding_crawl_runs(pool: &PgPool) -> Result<i64, DbError> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM crawl_runs WHERE status IN ('pending', 'running')",
    )
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Returns the most recent `limit` runs, optionally filtered by source.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_crawl_runs(
    pool: &PgPool,
    source_id: Option<i64>,
    limit: i64,
) -> Result<Vec<CrawlRun>, DbError> {
    let rows = sqlx::query_as::<_, CrawlRunRow>(
        "SELECT id, source_id, status, query_override, started_at, finished_at, \
                stats, error_message, created_at \
         FROM crawl_runs \
         WHERE ($1::BIGINT IS NULL OR source_id = $1) \
         ORDER BY created_at DESC, id DESC \
         LIMIT $2",
    )
    .bind(source_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    into_runs(rows)
}
