//! Transactional outbox: rows written next to entity changes, drained by a
//! pool of workers and published at least once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use sqlx::PgConnection;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::ServiceError;
use crate::config::OutboxConfig;
use crate::models::{NewOutboxMessage, OutboxMessage};

pub const USERS_TOPIC: &str = "identity.users";
pub const RBAC_TOPIC: &str = "identity.rbac";
pub const DEFAULT_TOPIC: &str = "identity.events";

/// Maps an event type to the stream it is published on.
pub fn topic_for(event_type: &str) -> &'static str {
    let prefix = event_type.split('.').next().unwrap_or_default();
    match prefix {
        "user" => USERS_TOPIC,
        "role" | "permission" | "assignment" => RBAC_TOPIC,
        _ => DEFAULT_TOPIC,
    }
}

/// Inserts `message` as a pending row on an open connection, usually the
/// transaction that carries the entity change.
pub async fn enqueue(
    conn: &mut PgConnection,
    message: &NewOutboxMessage,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO outbox_messages (id, message_id, event_type, aggregate_id, payload, status, retries, max_retries, created_at)
        VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, NOW())
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(message.message_id)
    .bind(&message.event_type)
    .bind(&message.aggregate_id)
    .bind(&message.payload)
    .bind(message.max_retries)
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Standalone insert outside any entity transaction.
    async fn enqueue(&self, message: NewOutboxMessage) -> Result<OutboxMessage, ServiceError>;

    /// Claims up to `batch_size` pending rows, oldest first, marking them
    /// inflight for `worker_id`.
    async fn drain(
        &self,
        batch_size: i64,
        worker_id: &str,
    ) -> Result<Vec<OutboxMessage>, ServiceError>;

    /// Settles a row `worker_id` still holds inflight. Returns false, and
    /// leaves the row alone, when the claim was released or taken over.
    async fn mark_processed(&self, id: Uuid, worker_id: &str) -> Result<bool, ServiceError>;

    /// Sets status failed, bumps `retries` and records `error`, under the
    /// same claim check as `mark_processed`.
    async fn mark_failed(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
    ) -> Result<bool, ServiceError>;

    /// Moves failed rows with retries left back to pending.
    async fn retry_failed(&self, batch_size: i64) -> Result<Vec<OutboxMessage>, ServiceError>;

    /// Returns inflight rows claimed before `older_than` to pending.
    async fn release_stale(&self, older_than: DateTime<Utc>) -> Result<u64, ServiceError>;

    /// Deletes processed rows older than `older_than_days`.
    async fn cleanup(&self, older_than_days: i64) -> Result<u64, ServiceError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<OutboxMessage>, ServiceError>;

    async fn find_by_aggregate(
        &self,
        aggregate_id: &str,
    ) -> Result<Vec<OutboxMessage>, ServiceError>;
}

#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, topic: &str, message: &OutboxMessage) -> Result<(), anyhow::Error>;
}

/// Appends each message to a Redis stream named after its topic.
#[derive(Clone)]
pub struct RedisStreamPublisher {
    manager: ConnectionManager,
}

impl RedisStreamPublisher {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl MessagePublisher for RedisStreamPublisher {
    async fn publish(&self, topic: &str, message: &OutboxMessage) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        let entry_id: String = redis::cmd("XADD")
            .arg(topic)
            .arg("*")
            .arg("message_id")
            .arg(message.message_id.to_string())
            .arg("event_type")
            .arg(&message.event_type)
            .arg("aggregate_id")
            .arg(&message.aggregate_id)
            .arg("payload")
            .arg(message.payload.as_slice())
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("XADD to {} failed: {}", topic, e))?;

        tracing::debug!(
            topic = %topic,
            entry_id = %entry_id,
            message_id = %message.message_id,
            "Outbox message appended to stream"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub message_id: Uuid,
    pub event_type: String,
    pub aggregate_id: String,
    pub payload: Vec<u8>,
}

/// Keeps published messages in memory. Failure can be switched on to
/// exercise the retry path.
#[derive(Clone, Default)]
pub struct RecordingPublisher {
    published: Arc<Mutex<Vec<PublishedMessage>>>,
    fail: Arc<AtomicBool>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessagePublisher for RecordingPublisher {
    async fn publish(&self, topic: &str, message: &OutboxMessage) -> Result<(), anyhow::Error> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("broker unavailable"));
        }
        self.published
            .lock()
            .map_err(|e| anyhow::anyhow!("Publisher mutex poisoned: {}", e))?
            .push(PublishedMessage {
                topic: topic.to_string(),
                message_id: message.message_id,
                event_type: message.event_type.clone(),
                aggregate_id: message.aggregate_id.clone(),
                payload: message.payload.clone(),
            });
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
}

pub struct OutboxProcessor {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn MessagePublisher>,
    config: OutboxConfig,
}

impl OutboxProcessor {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn MessagePublisher>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    /// Claims one batch and publishes it. Each row ends processed or failed.
    pub async fn run_once(&self, worker_id: &str) -> Result<DrainReport, ServiceError> {
        let batch = self.store.drain(self.config.batch_size, worker_id).await?;
        let mut report = DrainReport {
            claimed: batch.len(),
            ..Default::default()
        };

        for message in batch {
            let topic = topic_for(&message.event_type);
            match self.publisher.publish(topic, &message).await {
                Ok(()) => {
                    if !self.store.mark_processed(message.id, worker_id).await? {
                        tracing::warn!(
                            worker_id = %worker_id,
                            message_id = %message.message_id,
                            "Outbox claim lost before settling"
                        );
                    }
                    report.published += 1;
                    metrics::counter!("outbox_messages_published_total", "topic" => topic)
                        .increment(1);
                }
                Err(e) => {
                    tracing::warn!(
                        worker_id = %worker_id,
                        message_id = %message.message_id,
                        event_type = %message.event_type,
                        retries = message.retries,
                        error = %e,
                        "Outbox publish failed"
                    );
                    if !self
                        .store
                        .mark_failed(message.id, worker_id, &e.to_string())
                        .await?
                    {
                        tracing::warn!(
                            worker_id = %worker_id,
                            message_id = %message.message_id,
                            "Outbox claim lost before settling"
                        );
                    }
                    report.failed += 1;
                    metrics::counter!("outbox_messages_failed_total", "topic" => topic)
                        .increment(1);
                }
            }
        }

        Ok(report)
    }

    /// Returns failed rows with retries left to the pending queue.
    pub async fn requeue_failed(&self) -> Result<usize, ServiceError> {
        let requeued = self.store.retry_failed(self.config.batch_size).await?;
        if !requeued.is_empty() {
            tracing::info!(count = requeued.len(), "Requeued failed outbox messages");
            metrics::counter!("outbox_messages_retried_total").increment(requeued.len() as u64);
        }
        Ok(requeued.len())
    }

    /// Spawns the drain workers and the retry loop. All of them stop
    /// between batches once `shutdown` is cancelled.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let workers = self.config.workers.max(1);
        tracing::info!(
            workers,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval_ms,
            "Starting outbox processor"
        );

        let mut handles: Vec<JoinHandle<()>> = (0..workers)
            .map(|n| {
                let processor = self.clone();
                let shutdown = shutdown.clone();
                let worker_id = format!("outbox-worker-{}", n);
                tokio::spawn(async move { processor.worker_loop(worker_id, shutdown).await })
            })
            .collect();

        let processor = self.clone();
        handles.push(tokio::spawn(async move {
            processor.retry_loop(shutdown).await
        }));
        handles
    }

    async fn worker_loop(&self, worker_id: String, shutdown: CancellationToken) {
        let idle = Duration::from_millis(self.config.poll_interval_ms);

        while !shutdown.is_cancelled() {
            let full_batch = match self.run_once(&worker_id).await {
                Ok(report) => report.claimed as i64 >= self.config.batch_size,
                Err(e) => {
                    tracing::error!(worker_id = %worker_id, error = %e, "Outbox drain failed");
                    false
                }
            };

            if full_batch {
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(idle) => {}
            }
        }

        tracing::info!(worker_id = %worker_id, "Outbox worker stopped");
    }

    async fn retry_loop(&self, shutdown: CancellationToken) {
        let delay = Duration::from_secs(self.config.retry_delay_seconds.max(1));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            if let Err(e) = self.requeue_failed().await {
                tracing::error!(error = %e, "Outbox retry pass failed");
            }
        }

        tracing::info!("Outbox retry loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OutboxStatus;
    use crate::services::memory::MemoryStore;

    fn config() -> OutboxConfig {
        OutboxConfig {
            max_retries: 3,
            retry_delay_seconds: 1,
            workers: 2,
            poll_interval_ms: 10,
            batch_size: 10,
            cleanup_after_days: 7,
            stale_claim_seconds: 300,
        }
    }

    fn event(event_type: &str) -> NewOutboxMessage {
        NewOutboxMessage::json(event_type, Uuid::new_v4(), &serde_json::json!({}), 3).unwrap()
    }

    #[test]
    fn test_topic_routing() {
        assert_eq!(topic_for("user.created"), "identity.users");
        assert_eq!(topic_for("role.updated"), "identity.rbac");
        assert_eq!(topic_for("permission.granted"), "identity.rbac");
        assert_eq!(topic_for("assignment.created"), "identity.rbac");
        assert_eq!(topic_for("billing.charged"), "identity.events");
    }

    #[tokio::test]
    async fn test_run_once_publishes_and_marks_processed() {
        let store = Arc::new(MemoryStore::new());
        let publisher = RecordingPublisher::new();
        let processor =
            OutboxProcessor::new(store.clone(), Arc::new(publisher.clone()), config());

        let row = store.enqueue(event("user.created")).await.unwrap();
        let report = processor.run_once("w1").await.unwrap();

        assert_eq!(report.published, 1);
        let stored = store.find_by_id(row.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Processed);
        assert!(stored.processed_at.is_some());

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "identity.users");
        assert_eq!(published[0].message_id, row.message_id);

        // processed rows are never drained again
        assert_eq!(processor.run_once("w1").await.unwrap().claimed, 0);
    }

    #[tokio::test]
    async fn test_failing_publisher_exhausts_retries() {
        let store = Arc::new(MemoryStore::new());
        let publisher = RecordingPublisher::new();
        publisher.set_failing(true);
        let processor =
            OutboxProcessor::new(store.clone(), Arc::new(publisher.clone()), config());

        let row = store.enqueue(event("user.created")).await.unwrap();
        for _ in 0..3 {
            processor.run_once("w1").await.unwrap();
            processor.requeue_failed().await.unwrap();
        }

        let stored = store.find_by_id(row.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Failed);
        assert_eq!(stored.retries, 3);
        assert_eq!(stored.last_error.as_deref(), Some("broker unavailable"));

        // no more retries left
        assert_eq!(processor.requeue_failed().await.unwrap(), 0);
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_recovered_publisher_delivers_on_retry() {
        let store = Arc::new(MemoryStore::new());
        let publisher = RecordingPublisher::new();
        publisher.set_failing(true);
        let processor =
            OutboxProcessor::new(store.clone(), Arc::new(publisher.clone()), config());

        let row = store.enqueue(event("role.created")).await.unwrap();
        processor.run_once("w1").await.unwrap();

        publisher.set_failing(false);
        assert_eq!(processor.requeue_failed().await.unwrap(), 1);
        processor.run_once("w1").await.unwrap();

        let stored = store.find_by_id(row.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Processed);
        assert_eq!(stored.retries, 1);
        assert_eq!(publisher.published()[0].topic, "identity.rbac");
    }

    #[tokio::test]
    async fn test_stale_claim_cannot_settle_a_row_taken_over() {
        let store = Arc::new(MemoryStore::new());
        let row = store.enqueue(event("user.created")).await.unwrap();

        assert_eq!(store.drain(10, "w-slow").await.unwrap().len(), 1);
        let released = store
            .release_stale(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(released, 1);
        let pending = store.find_by_id(row.id).await.unwrap().unwrap();
        assert_eq!(pending.status, OutboxStatus::Pending);
        assert!(pending.claimed_by.is_none());

        assert_eq!(store.drain(10, "w-fast").await.unwrap().len(), 1);
        assert!(store.mark_processed(row.id, "w-fast").await.unwrap());

        // the original claimant finishes late with a failure
        assert!(!store
            .mark_failed(row.id, "w-slow", "broker unavailable")
            .await
            .unwrap());
        assert!(!store.mark_processed(row.id, "w-slow").await.unwrap());

        let stored = store.find_by_id(row.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Processed);
        assert_eq!(stored.retries, 0);
        assert!(stored.last_error.is_none());
        assert!(store.retry_failed(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_stale_leaves_fresh_claims() {
        let store = Arc::new(MemoryStore::new());
        let row = store.enqueue(event("user.updated")).await.unwrap();
        store.drain(10, "w1").await.unwrap();

        let released = store
            .release_stale(Utc::now() - chrono::Duration::seconds(300))
            .await
            .unwrap();
        assert_eq!(released, 0);
        let stored = store.find_by_id(row.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Inflight);
        assert_eq!(stored.claimed_by.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_workers_stop_on_cancellation() {
        let store = Arc::new(MemoryStore::new());
        let publisher = RecordingPublisher::new();
        let processor = Arc::new(OutboxProcessor::new(
            store.clone(),
            Arc::new(publisher.clone()),
            config(),
        ));

        for _ in 0..5 {
            store.enqueue(event("user.updated")).await.unwrap();
        }

        let shutdown = CancellationToken::new();
        let handles = processor.start(shutdown.clone());

        for _ in 0..100 {
            if publisher.published().len() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }

        // each message went out exactly once across both workers
        assert_eq!(publisher.published().len(), 5);
    }
}
