//! Database operations for `alert_rules`, `alert_events` and `alert_deliveries`.

use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};
use voc_core::{
    AlertDelivery, AlertEvent, AlertRule, AlertStatus, ChannelTarget, NewAlertEvent,
    NewAlertRule, NewDelivery,
};

use crate::DbError;

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A row from the `alert_rules` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AlertRuleRow {
    pub id: i64,
    pub name: String,
    pub rule_type: String,
    pub threshold_value: Option<f64>,
    pub keywords: Vec<String>,
    pub competitor_filters: Vec<String>,
    pub channels: Json<Vec<ChannelTarget>>,
    pub window_minutes: i32,
    pub cooldown_minutes: i32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<AlertRuleRow> for AlertRule {
    type Error = DbError;

    fn try_from(row: AlertRuleRow) -> Result<Self, Self::Error> {
        Ok(AlertRule {
            id: row.id,
            name: row.name,
            rule_type: row.rule_type.parse()?,
            threshold_value: row.threshold_value,
            keywords: row.keywords,
            competitor_filters: row.competitor_filters,
            channels: row.channels.0,
            window_minutes: row.window_minutes,
            cooldown_minutes: row.cooldown_minutes,
            enabled: row.enabled,
            created_at: row.created_at,
        })
    }
}

/// A row from the `alert_events` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AlertEventRow {
    pub id: i64,
    pub alert_rule_id: i64,
    pub primary_insight_id: Option<i64>,
    pub triggered_at: DateTime<Utc>,
    pub severity: String,
    pub status: String,
    pub condition_key: String,
    pub payload: serde_json::Value,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl TryFrom<AlertEventRow> for AlertEvent {
    type Error = DbError;

    fn try_from(row: AlertEventRow) -> Result<Self, Self::Error> {
        Ok(AlertEvent {
            id: row.id,
            alert_rule_id: row.alert_rule_id,
            primary_insight_id: row.primary_insight_id,
            triggered_at: row.triggered_at,
            severity: row.severity.parse()?,
            status: row.status.parse()?,
            condition_key: row.condition_key,
            payload: row.payload,
            resolved_at: row.resolved_at,
        })
    }
}

/// A row from the `alert_deliveries` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AlertDeliveryRow {
    pub id: i64,
    pub alert_event_id: i64,
    pub channel: String,
    pub target: String,
    pub status: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<AlertDeliveryRow> for AlertDelivery {
    type Error = DbError;

    fn try_from(row: AlertDeliveryRow) -> Result<Self, Self::Error> {
        Ok(AlertDelivery {
            id: row.id,
            alert_event_id: row.alert_event_id,
            channel: row.channel.parse()?,
            target: row.target,
            status: row.status.parse()?,
            attempts: row.attempts,
            last_error: row.last_error,
            updated_at: row.updated_at,
        })
    }
}

// ---------------------------------------------------------------------------
// alert_rules
// ---------------------------------------------------------------------------

/// Inserts an alert rule.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the insert fails.
pub async fn insert_alert_rule(pool: &PgPool, new: &NewAlertRule) -> Result<AlertRule, DbError> {
    let row = sqlx::query_as::<_, AlertRuleRow>(
        "INSERT INTO alert_rules \
             (name, rule_type, threshold_value, keywords, competitor_filters, channels, \
              window_minutes, cooldown_minutes, enabled) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         RETURNING id, name, rule_type, threshold_value, keywords, competitor_filters, \
                   channels, window_minutes, cooldown_minutes, enabled, created_at",
    )
    .bind(&new.name)
    .bind(new.rule_type.as_str())
    .bind(new.threshold_value)
    .bind(&new.keywords)
    .bind(&new.competitor_filters)
    .bind(Json(&new.channels))
    .bind(new.window_minutes)
    .bind(new.cooldown_minutes)
    .bind(new.enabled)
    .fetch_one(pool)
    .await?;

    row.try_into()
}

/// Fetches one rule by id.
///
/// # Errors
///
/// Returns [`DbError::NotFound`] if no row exists with the given `id`.
pub async fn get_alert_rule(pool: &PgPool, id: i64) -> Result<AlertRule, DbError> {
    let row = sqlx::query_as::<_, AlertRuleRow>(
        "SELECT id, name, rule_type, threshold_value, keywords, competitor_filters, \
                channels, window_minutes, cooldown_minutes, enabled, created_at \
         FROM alert_rules \
         WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)?;

    row.try_into()
}

/// Lists enabled rules by id.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_enabled_alert_rules(pool: &PgPool) -> Result<Vec<AlertRule>, DbError> {
    let rows = sqlx::query_as::<_, AlertRuleRow>(
        "SELECT id, name, rule_type, threshold_value, keywords, competitor_filters, \
                channels, window_minutes, cooldown_minutes, enabled, created_at \
         FROM alert_rules \
         WHERE enabled = true \
         ORDER BY id",
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(AlertRule::try_from).collect()
}

// ---------------------------------------------------------------------------
// alert_events
// ---------------------------------------------------------------------------

/// Creates an alert event unless an unresolved (open or acknowledged) event
/// with the same condition key exists inside the cooldown.
///
/// The rule row is locked with `FOR UPDATE` for the duration of the check and
/// insert, which serializes concurrent evaluators of the same rule.
///
/// # Errors
///
/// Returns [`DbError::NotFound`] if the rule does not exist, or
/// [`DbError::Sqlx`] if any statement fails.
pub async fn create_alert_event(
    pool: &PgPool,
    event: &NewAlertEvent,
    cooldown_since: DateTime<Utc>,
) -> Result<Option<AlertEvent>, DbError> {
    let mut tx = pool.begin().await?;

    sqlx::query_scalar::<_, i64>("SELECT id FROM alert_rules WHERE id = $1 FOR UPDATE")
        .bind(event.alert_rule_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(DbError::NotFound)?;

    let cooling = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS ( \
             SELECT 1 FROM alert_events \
             WHERE alert_rule_id = $1 \
               AND condition_key = $2 \
               AND status <> 'resolved' \
               AND triggered_at >= $3 \
         )",
    )
    .bind(event.alert_rule_id)
    .bind(&event.condition_key)
    .bind(cooldown_since)
    .fetch_one(&mut *tx)
    .await?;

    if cooling {
        tx.rollback().await?;
        return Ok(None);
    }

    let row = sqlx::query_as::<_, AlertEventRow>(
        "INSERT INTO alert_events \
             (alert_rule_id, primary_insight_id, triggered_at, severity, status, \
              condition_key, payload) \
         VALUES ($1, $2, $3, $4, 'open', $5, $6) \
         RETURNING id, alert_rule_id, primary_insight_id, triggered_at, severity, status, \
                   condition_key, payload, resolved_at",
    )
    .bind(event.alert_rule_id)
    .bind(event.primary_insight_id)
    .bind(event.triggered_at)
    .bind(event.severity.as_str())
    .bind(&event.condition_key)
    .bind(&event.payload)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some(row.try_into()?))
}

/// Fetches one event by id.
///
/// # Errors
///
/// Returns [`DbError::NotFound`] if no row exists with the given `id`.
pub async fn get_alert_event(pool: &PgPool, id: i64) -> Result<AlertEvent, DbError> {
    let row = sqlx::query_as::<_, AlertEventRow>(
        "SELECT id, alert_rule_id, primary_insight_id, triggered_at, severity, status, \
                condition_key, payload, resolved_at \
         FROM alert_events \
         WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)?;

    row.try_into()
}

/// Lists a rule's events, most recent first.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_alert_events(pool: &PgPool, rule_id: i64) -> Result<Vec<AlertEvent>, DbError> {
    let rows = sqlx::query_as::<_, AlertEventRow>(
        "SELECT id, alert_rule_id, primary_insight_id, triggered_at, severity, status, \
                condition_key, payload, resolved_at \
         FROM alert_events \
         WHERE alert_rule_id = $1 \
         ORDER BY triggered_at DESC, id DESC",
    )
    .bind(rule_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(AlertEvent::try_from).collect()
}

/// Sets an event's status. Resolving stamps `resolved_at`; reopening clears it.
///
/// # Errors
///
/// Returns [`DbError::NotFound`] if no row exists with the given `id`.
pub async fn update_alert_status(
    pool: &PgPool,
    id: i64,
    status: AlertStatus,
) -> Result<AlertEvent, DbError> {
    let row = sqlx::query_as::<_, AlertEventRow>(
        "UPDATE alert_events \
         SET status = $1, \
             resolved_at = CASE WHEN $1 = 'resolved' THEN COALESCE(resolved_at, NOW()) END \
         WHERE id = $2 \
         RETURNING id, alert_rule_id, primary_insight_id, triggered_at, severity, status, \
                   condition_key, payload, resolved_at",
    )
    .bind(status.as_str())
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)?;

    row.try_into()
}

// ---------------------------------------------------------------------------
// alert_deliveries
// ---------------------------------------------------------------------------

/// Lists delivery records for an event.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_deliveries(
    pool: &PgPool,
    alert_event_id: i64,
) -> Result<Vec<AlertDelivery>, DbError> {
    let rows = sqlx::query_as::<_, AlertDeliveryRow>(
        "SELECT id, alert_event_id, channel, target, status, attempts, last_error, updated_at \
         FROM alert_deliveries \
         WHERE alert_event_id = $1 \
         ORDER BY id",
    )
    .bind(alert_event_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(AlertDelivery::try_from).collect()
}

/// Inserts or replaces the delivery record for `(event, channel, target)`.
///
/// Attempts accumulate across redeliveries of the same event.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the upsert fails.
pub async fn upsert_delivery(pool: &PgPool, delivery: &NewDelivery) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO alert_deliveries \
             (alert_event_id, channel, target, status, attempts, last_error) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT ON CONSTRAINT uq_alert_deliveries_target DO UPDATE \
         SET status = EXCLUDED.status, \
             attempts = alert_deliveries.attempts + EXCLUDED.attempts, \
             last_error = EXCLUDED.last_error, \
             updated_at = NOW()",
    )
    .bind(delivery.alert_event_id)
    .bind(delivery.channel.as_str())
    .bind(&delivery.target)
    .bind(delivery.status.as_str())
    .bind(delivery.attempts)
    .bind(delivery.last_error.as_deref())
    .execute(pool)
    .await?;
    Ok(())
}
