//! Database operations for `sources`.

use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};
use voc_core::{NewSource, Platform, Source, SourceConfig};

use crate::DbError;

/// A row from the `sources` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SourceRow {
    pub id: i64,
    pub name: String,
    pub platform: String,
    pub config: serde_json::Value,
    pub cadence_minutes: Option<i32>,
    pub is_active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<SourceRow> for Source {
    type Error = DbError;

    fn try_from(row: SourceRow) -> Result<Self, Self::Error> {
        let platform: Platform = row.platform.parse()?;
        let config = SourceConfig::from_json(platform, &row.config)
            .map_err(|e| DbError::InvalidData(format!("source {}: {e}", row.id)))?;
        Ok(Source {
            id: row.id,
            name: row.name,
            config,
            cadence_minutes: row.cadence_minutes,
            is_active: row.is_active,
            last_run_at: row.last_run_at,
            created_at: row.created_at,
        })
    }
}

/// Inserts a source and returns it.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the insert fails.
pub async fn insert_source(pool: &PgPool, new: &NewSource) -> Result<Source, DbError> {
    let row = sqlx::query_as::<_, SourceRow>(
        "INSERT INTO sources (name, platform, config, cadence_minutes, is_active) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING id, name, platform, config, cadence_minutes, is_active, \
                   last_run_at, created_at",
    )
    .bind(&new.name)
    .bind(new.config.platform().as_str())
    .bind(Json(&new.config))
    .bind(new.cadence_minutes)
    .bind(new.is_active)
    .fetch_one(pool)
    .await?;

    row.try_into()
}

/// Fetches a single source by id.
///
/// # Errors
///
/// Returns [`DbError::NotFound`] if no row exists, [`DbError::InvalidData`] if
/// the stored config no longer validates, or [`DbError::Sqlx`] on query failure.
pub async fn get_source(pool: &PgPool, id: i64) -> Result<Source, DbError> {
    let row = sqlx::query_as::<_, SourceRow>(
        "SELECT id, name, platform, config, cadence_minutes, is_active, \
                last_run_at, created_at \
         FROM sources \
         WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)?;

    row.try_into()
}

/// Lists active sources, least recently run first.
///
/// Rows whose stored config fails validation are skipped with a warning so a
/// single bad source cannot stall scheduling for the rest.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_active_sources(pool: &PgPool) -> Result<Vec<Source>, DbError> {
    let rows = sqlx::query_as::<_, SourceRow>(
        "SELECT id, name, platform, config, cadence_minutes, is_active, \
                last_run_at, created_at \
         FROM sources \
         WHERE is_active = true \
         ORDER BY last_run_at ASC NULLS FIRST, id ASC",
    )
    .fetch_all(pool)
    .await?;

    let mut sources = Vec::with_capacity(rows.len());
    for row in rows {
        let id = row.id;
        match Source::try_from(row) {
            Ok(source) => sources.push(source),
            Err(e) => tracing::warn!(source_id = id, error = %e, "skipping source with invalid config"),
        }
    }
    Ok(sources)
}

/// Sets `last_run_at` for a source.
///
/// # Errors
///
/// Returns [`DbError::NotFound`] if the source does not exist.
pub async fn mark_source_run(pool: &PgPool, id: i64, at: DateTime<Utc>) -> Result<(), DbError> {
    let result = sqlx::query(
        "UPDATE sources SET last_run_at = $1, updated_at = NOW() WHERE id = $2",
    )
    .bind(at)
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}
