//! Database operations for `themes`, `theme_centroids` and `insight_themes`.
//!
//! Centroids are updated inside the same transaction as the membership insert,
//! holding a row lock on the centroid, so concurrent workers never fold two
//! members into a stale read. A missing centroid row is created with
//! `ON CONFLICT DO NOTHING` first, so there is always a row to lock.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use voc_core::{moving_average, InsightTheme, Theme, ThemeCentroid};

use crate::DbError;

/// A row from the `themes` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ThemeRow {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
}

impl From<ThemeRow> for Theme {
    fn from(row: ThemeRow) -> Self {
        Theme {
            id: row.id,
            name: row.name,
            description: row.description,
            is_system: row.is_system,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct CentroidRow {
    theme_id: i64,
    centroid: Vec<f32>,
    member_count: i64,
}

/// Inserts a theme, or returns the existing theme with the same name.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the upsert fails.
pub async fn upsert_theme(
    pool: &PgPool,
    name: &str,
    description: Option<&str>,
    is_system: bool,
) -> Result<Theme, DbError> {
    // DO UPDATE with a no-op assignment so RETURNING yields the existing row.
    let row = sqlx::query_as::<_, ThemeRow>(
        "INSERT INTO themes (name, description, is_system) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name \
         RETURNING id, name, description, is_system, created_at",
    )
    .bind(name)
    .bind(description)
    .bind(is_system)
    .fetch_one(pool)
    .await?;

    Ok(row.into())
}

/// Creates a non-system theme and seeds its centroid. Returns `None` when
/// the name is taken.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if any statement fails.
pub async fn create_emerging_theme(
    pool: &PgPool,
    name: &str,
    description: &str,
    centroid: &[f32],
) -> Result<Option<Theme>, DbError> {
    let mut tx = pool.begin().await?;

    let Some(row) = sqlx::query_as::<_, ThemeRow>(
        "INSERT INTO themes (name, description, is_system) \
         VALUES ($1, $2, false) \
         ON CONFLICT (name) DO NOTHING \
         RETURNING id, name, description, is_system, created_at",
    )
    .bind(name)
    .bind(description)
    .fetch_optional(&mut *tx)
    .await?
    else {
        tx.rollback().await?;
        return Ok(None);
    };

    sqlx::query(
        "INSERT INTO theme_centroids (theme_id, centroid, member_count) \
         VALUES ($1, $2, 0)",
    )
    .bind(row.id)
    .bind(centroid)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some(row.into()))
}

/// Lists all themes by name.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_themes(pool: &PgPool) -> Result<Vec<Theme>, DbError> {
    let rows = sqlx::query_as::<_, ThemeRow>(
        "SELECT id, name, description, is_system, created_at FROM themes ORDER BY name",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Theme::from).collect())
}

/// Lists every cached centroid.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_theme_centroids(pool: &PgPool) -> Result<Vec<ThemeCentroid>, DbError> {
    let rows = sqlx::query_as::<_, CentroidRow>(
        "SELECT theme_id, centroid, member_count FROM theme_centroids ORDER BY theme_id",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| ThemeCentroid {
            theme_id: row.theme_id,
            centroid: row.centroid,
            member_count: row.member_count,
        })
        .collect())
}

/// Links an insight to a theme and folds the member into the centroid.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if any statement fails.
pub async fn assign_theme(
    pool: &PgPool,
    link: &InsightTheme,
    member_embedding: Option<&[f32]>,
) -> Result<bool, DbError> {
    let mut tx = pool.begin().await?;

    let inserted = sqlx::query(
        "INSERT INTO insight_themes (insight_id, theme_id, weight) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (insight_id, theme_id) DO NOTHING",
    )
    .bind(link.insight_id)
    .bind(link.theme_id)
    .bind(link.weight.clamp(0.0, 1.0))
    .execute(&mut *tx)
    .await?
    .rows_affected()
        == 1;

    if inserted {
        if let Some(embedding) = member_embedding {
            fold_centroid(&mut tx, link.theme_id, embedding).await?;
        }
    }

    tx.commit().await?;
    Ok(inserted)
}

async fn fold_centroid(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    theme_id: i64,
    embedding: &[f32],
) -> Result<(), DbError> {
    // The first member seeds the centroid. A concurrent first member loses
    // the insert and folds into the winner's row below.
    let seeded = sqlx::query(
        "INSERT INTO theme_centroids (theme_id, centroid, member_count) \
         VALUES ($1, $2, 1) \
         ON CONFLICT (theme_id) DO NOTHING",
    )
    .bind(theme_id)
    .bind(embedding)
    .execute(&mut **tx)
    .await?
    .rows_affected()
        == 1;
    if seeded {
        return Ok(());
    }

    let row = sqlx::query_as::<_, CentroidRow>(
        "SELECT theme_id, centroid, member_count \
         FROM theme_centroids \
         WHERE theme_id = $1 \
         FOR UPDATE",
    )
    .bind(theme_id)
    .fetch_one(&mut **tx)
    .await?;

    let Some(updated) = moving_average(&row.centroid, embedding, row.member_count) else {
        tracing::warn!(
            theme_id,
            stored = row.centroid.len(),
            incoming = embedding.len(),
            "centroid dimension mismatch; leaving centroid unchanged"
        );
        return Ok(());
    };
    sqlx::query(
        "UPDATE theme_centroids \
         SET centroid = $1, member_count = member_count + 1, updated_at = NOW() \
         WHERE theme_id = $2",
    )
    .bind(&updated)
    .bind(theme_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Lists theme links for one insight, heaviest first.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_insight_themes(
    pool: &PgPool,
    insight_id: i64,
) -> Result<Vec<InsightTheme>, DbError> {
    let rows = sqlx::query_as::<_, (i64, i64, f64)>(
        "SELECT insight_id, theme_id, weight \
         FROM insight_themes \
         WHERE insight_id = $1 \
         ORDER BY weight DESC, theme_id",
    )
    .bind(insight_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(insight_id, theme_id, weight)| InsightTheme {
            insight_id,
            theme_id,
            weight,
        })
        .collect())
}
