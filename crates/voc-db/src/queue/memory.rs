use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{JobQueue, QueueError, QueueName, QueuedJob};

#[derive(Debug)]
struct Entry {
    queue: QueueName,
    payload: serde_json::Value,
    attempts: i32,
    visible_at: Instant,
    dead: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    jobs: BTreeMap<i64, Entry>,
    fail_enqueue: bool,
}

/// In-process [`JobQueue`]. Visibility uses `tokio::time`, so tests can drive
/// redelivery with a paused clock.
#[derive(Debug, Default)]
pub struct MemoryJobQueue {
    inner: Mutex<Inner>,
}

impl MemoryJobQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every subsequent `enqueue` fail with [`QueueError::Unavailable`].
    pub fn set_fail_enqueue(&self, fail: bool) {
        self.inner().fail_enqueue = fail;
    }

    /// Payloads of live jobs on `queue`, visible or not, in id order.
    #[must_use]
    pub fn pending(&self, queue: QueueName) -> Vec<serde_json::Value> {
        self.inner()
            .jobs
            .values()
            .filter(|e| e.queue == queue && e.dead.is_none())
            .map(|e| e.payload.clone())
            .collect()
    }

    /// Buried jobs as `(id, reason)`.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<(i64, String)> {
        self.inner()
            .jobs
            .iter()
            .filter_map(|(id, e)| e.dead.clone().map(|reason| (*id, reason)))
            .collect()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(
        &self,
        queue: QueueName,
        payload: serde_json::Value,
        delay: Duration,
    ) -> Result<i64, QueueError> {
        let mut inner = self.inner();
        if inner.fail_enqueue {
            return Err(QueueError::Unavailable("enqueue disabled".to_string()));
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner.jobs.insert(
            id,
            Entry {
                queue,
                payload,
                attempts: 0,
                visible_at: Instant::now() + delay,
                dead: None,
            },
        );
        Ok(id)
    }

    async fn dequeue(
        &self,
        queue: QueueName,
        visibility: Duration,
    ) -> Result<Option<QueuedJob>, QueueError> {
        let now = Instant::now();
        let mut inner = self.inner();
        let Some((&id, entry)) = inner
            .jobs
            .iter_mut()
            .filter(|(_, e)| e.queue == queue && e.dead.is_none() && e.visible_at <= now)
            .min_by_key(|(id, e)| (e.visible_at, **id))
        else {
            return Ok(None);
        };
        entry.attempts += 1;
        entry.visible_at = now + visibility;
        Ok(Some(QueuedJob {
            id,
            queue,
            payload: entry.payload.clone(),
            attempts: entry.attempts,
        }))
    }

    async fn ack(&self, id: i64) -> Result<(), QueueError> {
        self.inner().jobs.remove(&id);
        Ok(())
    }

    async fn retry(&self, id: i64, delay: Duration, _reason: &str) -> Result<(), QueueError> {
        let mut inner = self.inner();
        let entry = inner
            .jobs
            .get_mut(&id)
            .filter(|e| e.dead.is_none())
            .ok_or(QueueError::NotFound(id))?;
        entry.visible_at = Instant::now() + delay;
        Ok(())
    }

    async fn bury(&self, id: i64, reason: &str) -> Result<(), QueueError> {
        let mut inner = self.inner();
        let entry = inner
            .jobs
            .get_mut(&id)
            .filter(|e| e.dead.is_none())
            .ok_or(QueueError::NotFound(id))?;
        entry.dead = Some(reason.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const VISIBILITY: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn unacked_job_is_redelivered_after_visibility() {
        let queue = MemoryJobQueue::new();
        let id = queue
            .enqueue(QueueName::Crawl, json!({"n": 1}), Duration::ZERO)
            .await
            .unwrap();

        let first = queue.dequeue(QueueName::Crawl, VISIBILITY).await.unwrap().unwrap();
        assert_eq!((first.id, first.attempts), (id, 1));
        assert!(queue.dequeue(QueueName::Crawl, VISIBILITY).await.unwrap().is_none());

        tokio::time::advance(VISIBILITY + Duration::from_secs(1)).await;
        let second = queue.dequeue(QueueName::Crawl, VISIBILITY).await.unwrap().unwrap();
        assert_eq!((second.id, second.attempts), (id, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_job_is_hidden_until_due() {
        let queue = MemoryJobQueue::new();
        queue
            .enqueue(QueueName::Alert, json!({}), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(queue.dequeue(QueueName::Alert, VISIBILITY).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(queue.dequeue(QueueName::Alert, VISIBILITY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn queues_are_isolated() {
        let queue = MemoryJobQueue::new();
        queue
            .enqueue(QueueName::Processing, json!({}), Duration::ZERO)
            .await
            .unwrap();
        assert!(queue.dequeue(QueueName::Crawl, VISIBILITY).await.unwrap().is_none());
        assert_eq!(queue.pending(QueueName::Processing).len(), 1);
    }

    #[tokio::test]
    async fn acked_and_buried_jobs_are_not_redelivered() {
        let queue = MemoryJobQueue::new();
        let a = queue.enqueue(QueueName::Crawl, json!({"a": 1}), Duration::ZERO).await.unwrap();
        let b = queue.enqueue(QueueName::Crawl, json!({"b": 1}), Duration::ZERO).await.unwrap();

        queue.ack(a).await.unwrap();
        queue.bury(b, "exhausted").await.unwrap();

        assert!(queue.dequeue(QueueName::Crawl, Duration::ZERO).await.unwrap().is_none());
        assert_eq!(queue.dead_letters(), vec![(b, "exhausted".to_string())]);
        assert!(matches!(queue.retry(b, Duration::ZERO, "x").await, Err(QueueError::NotFound(_))));
    }

    #[tokio::test]
    async fn injected_enqueue_failure() {
        let queue = MemoryJobQueue::new();
        queue.set_fail_enqueue(true);
        assert!(matches!(
            queue.enqueue(QueueName::Crawl, json!({}), Duration::ZERO).await,
            Err(QueueError::Unavailable(_))
        ));
        assert!(queue.pending(QueueName::Crawl).is_empty());
    }
}
