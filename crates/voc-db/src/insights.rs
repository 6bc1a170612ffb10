//! Database operations for `insights` and `extraction_batches`.

use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};
use voc_core::{
    CompetitorMention, CustomerContext, FeatureRequest, Insight, JourneyStage, NewExtractionBatch,
    NewInsight, PainPoint, WindowInsight,
};

use crate::DbError;

/// A row from the `insights` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InsightRow {
    pub id: i64,
    pub feedback_id: i64,
    pub sentiment_score: f64,
    pub sentiment_label: String,
    pub sentiment_confidence: f64,
    pub summary: String,
    pub pain_points: Json<Vec<PainPoint>>,
    pub feature_requests: Json<Vec<FeatureRequest>>,
    pub competitor_mentions: Json<Vec<CompetitorMention>>,
    pub customer_context: Json<CustomerContext>,
    pub journey_stage: Option<String>,
    pub urgency_level: i16,
    pub themes: Json<Vec<String>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<InsightRow> for Insight {
    type Error = DbError;

    fn try_from(row: InsightRow) -> Result<Self, Self::Error> {
        Ok(Insight {
            id: row.id,
            feedback_id: row.feedback_id,
            sentiment_score: row.sentiment_score,
            sentiment_label: row.sentiment_label.parse()?,
            sentiment_confidence: row.sentiment_confidence,
            summary: row.summary,
            pain_points: row.pain_points.0,
            feature_requests: row.feature_requests.0,
            competitor_mentions: row.competitor_mentions.0,
            customer_context: row.customer_context.0,
            journey_stage: row.journey_stage.as_deref().map(str::parse::<JourneyStage>).transpose()?,
            urgency_level: row.urgency_level,
            themes: row.themes.0,
            created_at: row.created_at,
        })
    }
}

/// An insight joined with its feedback text.
#[derive(Debug, Clone, sqlx::FromRow)]
struct WindowInsightRow {
    #[sqlx(flatten)]
    insight: InsightRow,
    clean_content: String,
}

/// Inserts an insight and marks its feedback `succeeded` in one transaction.
///
/// Returns `None` when the feedback already has an insight; the existing row
/// is left untouched.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if either statement fails.
pub async fn insert_insight(pool: &PgPool, new: &NewInsight) -> Result<Option<Insight>, DbError> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query_as::<_, InsightRow>(
        "INSERT INTO insights \
             (feedback_id, sentiment_score, sentiment_label, sentiment_confidence, summary, \
              pain_points, feature_requests, competitor_mentions, customer_context, \
              journey_stage, urgency_level, themes) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
         ON CONFLICT ON CONSTRAINT uq_insights_feedback DO NOTHING \
         RETURNING id, feedback_id, sentiment_score, sentiment_label, sentiment_confidence, \
                   summary, pain_points, feature_requests, competitor_mentions, \
                   customer_context, journey_stage, urgency_level, themes, created_at",
    )
    .bind(new.feedback_id)
    .bind(new.sentiment_score)
    .bind(new.sentiment_label.as_str())
    .bind(new.sentiment_confidence)
    .bind(&new.summary)
    .bind(Json(&new.pain_points))
    .bind(Json(&new.feature_requests))
    .bind(Json(&new.competitor_mentions))
    .bind(Json(&new.customer_context))
    .bind(new.journey_stage.map(JourneyStage::as_str))
    .bind(new.urgency_level)
    .bind(Json(&new.themes))
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        tx.rollback().await?;
        return Ok(None);
    };

    sqlx::query(
        "UPDATE feedback \
         SET extraction_status = 'succeeded', extraction_error = NULL \
         WHERE id = $1",
    )
    .bind(new.feedback_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some(row.try_into()?))
}

/// Fetches a single insight by id.
///
/// # Errors
///
/// Returns [`DbError::NotFound`] if no row exists with the given `id`.
pub async fn get_insight(pool: &PgPool, id: i64) -> Result<Insight, DbError> {
    let row = sqlx::query_as::<_, InsightRow>(
        "SELECT id, feedback_id, sentiment_score, sentiment_label, sentiment_confidence, \
                summary, pain_points, feature_requests, competitor_mentions, \
                customer_context, journey_stage, urgency_level, themes, created_at \
         FROM insights \
         WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)?;

    row.try_into()
}

/// Lists insights of `feedback_ids` that have no `insight_themes` row.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_unthemed_insights(
    pool: &PgPool,
    feedback_ids: &[i64],
) -> Result<Vec<Insight>, DbError> {
    let rows = sqlx::query_as::<_, InsightRow>(
        "SELECT i.id, i.feedback_id, i.sentiment_score, i.sentiment_label, \
                i.sentiment_confidence, i.summary, i.pain_points, i.feature_requests, \
                i.competitor_mentions, i.customer_context, i.journey_stage, \
                i.urgency_level, i.themes, i.created_at \
         FROM insights i \
         WHERE i.feedback_id = ANY($1) \
           AND NOT EXISTS (SELECT 1 FROM insight_themes t WHERE t.insight_id = i.id) \
         ORDER BY i.id",
    )
    .bind(feedback_ids)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(Insight::try_from).collect()
}

/// Lists insights created since `since`, joined with feedback text.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_insights_since(
    pool: &PgPool,
    since: DateTime<Utc>,
) -> Result<Vec<WindowInsight>, DbError> {
    let rows = sqlx::query_as::<_, WindowInsightRow>(
        "SELECT i.id, i.feedback_id, i.sentiment_score, i.sentiment_label, \
                i.sentiment_confidence, i.summary, i.pain_points, i.feature_requests, \
                i.competitor_mentions, i.customer_context, i.journey_stage, \
                i.urgency_level, i.themes, i.created_at, f.clean_content \
         FROM insights i \
         JOIN feedback f ON f.id = i.feedback_id \
         WHERE i.created_at >= $1 \
         ORDER BY i.created_at, i.id",
    )
    .bind(since)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            Ok(WindowInsight {
                insight: row.insight.try_into()?,
                content: row.clean_content,
            })
        })
        .collect()
}

/// Writes one accounting row for an extraction batch.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the insert fails.
pub async fn record_extraction_batch(
    pool: &PgPool,
    batch: &NewExtractionBatch,
) -> Result<(), DbError> {
    let prompt_tokens = i64::try_from(batch.usage.prompt_tokens)
        .map_err(|e| DbError::InvalidData(format!("prompt_tokens: {e}")))?;
    let completion_tokens = i64::try_from(batch.usage.completion_tokens)
        .map_err(|e| DbError::InvalidData(format!("completion_tokens: {e}")))?;

    sqlx::query(
        "INSERT INTO extraction_batches \
             (item_count, succeeded, failed, llm_calls, prompt_tokens, completion_tokens, cost_usd) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(batch.item_count)
    .bind(batch.succeeded)
    .bind(batch.failed)
    .bind(batch.llm_calls)
    .bind(prompt_tokens)
    .bind(completion_tokens)
    .bind(batch.usage.cost_usd)
    .execute(pool)
    .await?;
    Ok(())
}
