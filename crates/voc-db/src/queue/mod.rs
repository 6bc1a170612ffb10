//! At-least-once job queue with visibility timeouts.
//!
//! A dequeued job stays invisible until its visibility deadline passes; if the
//! consumer neither acks, retries nor buries it by then, the job is delivered
//! again with its attempt counter incremented.

mod memory;
mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryJobQueue;
pub use postgres::PgJobQueue;

/// The three logical queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Crawl,
    Processing,
    Alert,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [QueueName::Crawl, QueueName::Processing, QueueName::Alert];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::Crawl => "crawl",
            QueueName::Processing => "processing",
            QueueName::Alert => "alert",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One delivery of a job. `attempts` counts this delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub id: i64,
    pub queue: QueueName,
    pub payload: serde_json::Value,
    pub attempts: i32,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job {0} not found")]
    NotFound(i64),
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job that becomes visible after `delay`.
    async fn enqueue(
        &self,
        queue: QueueName,
        payload: serde_json::Value,
        delay: Duration,
    ) -> Result<i64, QueueError>;

    /// Take the oldest visible job, hiding it for `visibility`.
    async fn dequeue(
        &self,
        queue: QueueName,
        visibility: Duration,
    ) -> Result<Option<QueuedJob>, QueueError>;

    /// Remove a completed job.
    async fn ack(&self, id: i64) -> Result<(), QueueError>;

    /// Make the job visible again after `delay`. The attempt counter is only
    /// bumped by the next [`JobQueue::dequeue`].
    async fn retry(&self, id: i64, delay: Duration, reason: &str) -> Result<(), QueueError>;

    /// Park the job permanently; it is never delivered again.
    async fn bury(&self, id: i64, reason: &str) -> Result<(), QueueError>;
}
