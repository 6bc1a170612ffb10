use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;

use super::{JobQueue, QueueError, QueueName, QueuedJob};

/// [`JobQueue`] over the `jobs` table.
///
/// Concurrent consumers claim distinct rows through `FOR UPDATE SKIP LOCKED`.
#[derive(Debug, Clone)]
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(
        &self,
        queue: QueueName,
        payload: serde_json::Value,
        delay: Duration,
    ) -> Result<i64, QueueError> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO jobs (queue, payload, visible_at) \
             VALUES ($1, $2, NOW() + make_interval(secs => $3)) \
             RETURNING id",
        )
        .bind(queue.as_str())
        .bind(payload)
        .bind(delay.as_secs_f64())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn dequeue(
        &self,
        queue: QueueName,
        visibility: Duration,
    ) -> Result<Option<QueuedJob>, QueueError> {
        let row = sqlx::query_as::<_, (i64, serde_json::Value, i32)>(
            "UPDATE jobs \
             SET attempts = attempts + 1, \
                 visible_at = NOW() + make_interval(secs => $2) \
             WHERE id = ( \
                 SELECT id FROM jobs \
                 WHERE queue = $1 AND dead_at IS NULL AND visible_at <= NOW() \
                 ORDER BY visible_at, id \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING id, payload, attempts",
        )
        .bind(queue.as_str())
        .bind(visibility.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, payload, attempts)| QueuedJob {
            id,
            queue,
            payload,
            attempts,
        }))
    }

    async fn ack(&self, id: i64) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn retry(&self, id: i64, delay: Duration, reason: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE jobs \
             SET visible_at = NOW() + make_interval(secs => $1), last_error = $2 \
             WHERE id = $3 AND dead_at IS NULL",
        )
        .bind(delay.as_secs_f64())
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    async fn bury(&self, id: i64, reason: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE jobs SET dead_at = NOW(), last_error = $1 WHERE id = $2 AND dead_at IS NULL",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }
}
