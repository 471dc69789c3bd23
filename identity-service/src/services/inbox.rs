//! Consumer-side deduplication. A `(message_id, consumer_id)` pair is
//! admitted once per TTL window.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::cache::TrustCache;
use super::error::ServiceError;

#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Atomic set-if-absent. `true` when this call recorded the pair; an
    /// expired record counts as absent.
    async fn try_insert(
        &self,
        message_id: Uuid,
        event_type: &str,
        consumer_id: &str,
        ttl_seconds: u64,
    ) -> Result<bool, ServiceError>;

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, ServiceError>;
}

/// Inbox records kept in the Trust Cache as `inbox:<consumer>:<message_id>`;
/// expiry is the key TTL.
pub struct CacheInboxStore {
    cache: Arc<dyn TrustCache>,
}

impl CacheInboxStore {
    pub fn new(cache: Arc<dyn TrustCache>) -> Self {
        Self { cache }
    }

    pub fn key(consumer_id: &str, message_id: Uuid) -> String {
        format!("inbox:{}:{}", consumer_id, message_id)
    }
}

#[async_trait]
impl InboxStore for CacheInboxStore {
    async fn try_insert(
        &self,
        message_id: Uuid,
        event_type: &str,
        consumer_id: &str,
        ttl_seconds: u64,
    ) -> Result<bool, ServiceError> {
        let key = Self::key(consumer_id, message_id);
        Ok(self
            .cache
            .set_if_absent(&key, event_type, ttl_seconds)
            .await?)
    }

    async fn cleanup_expired(&self, _now: DateTime<Utc>) -> Result<u64, ServiceError> {
        Ok(0)
    }
}

#[derive(Clone)]
pub struct InboxService {
    store: Arc<dyn InboxStore>,
}

impl InboxService {
    pub fn new(store: Arc<dyn InboxStore>) -> Self {
        Self { store }
    }

    /// `true` for the first delivery of `message_id` to `consumer_id`,
    /// `false` for a duplicate.
    pub async fn process_with_dedup(
        &self,
        message_id: Uuid,
        event_type: &str,
        consumer_id: &str,
        ttl_seconds: u64,
    ) -> Result<bool, ServiceError> {
        let first = self
            .store
            .try_insert(message_id, event_type, consumer_id, ttl_seconds)
            .await?;

        if !first {
            tracing::info!(
                message_id = %message_id,
                consumer_id = %consumer_id,
                event_type = %event_type,
                "Duplicate message skipped"
            );
            metrics::counter!("inbox_duplicates_total").increment(1);
        }

        Ok(first)
    }

    pub async fn cleanup_expired(&self) -> Result<u64, ServiceError> {
        self.store.cleanup_expired(Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cache::InMemoryCache;
    use crate::services::memory::MemoryStore;

    #[tokio::test]
    async fn test_cache_backend_admits_once() {
        let inbox = InboxService::new(Arc::new(CacheInboxStore::new(Arc::new(
            InMemoryCache::new(),
        ))));
        let id = Uuid::new_v4();

        assert!(inbox.process_with_dedup(id, "http.POST./x", "http-api", 60).await.unwrap());
        assert!(!inbox.process_with_dedup(id, "http.POST./x", "http-api", 60).await.unwrap());
        // a different consumer sees the message for the first time
        assert!(inbox.process_with_dedup(id, "http.POST./x", "billing", 60).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_backend_concurrent_single_winner() {
        let inbox = InboxService::new(Arc::new(MemoryStore::new()));
        let id = Uuid::new_v4();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let inbox = inbox.clone();
                tokio::spawn(async move {
                    inbox
                        .process_with_dedup(id, "user.created", "mailer", 60)
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn test_memory_backend_expired_row_is_taken_over() {
        let store = Arc::new(MemoryStore::new());
        let inbox = InboxService::new(store.clone());
        let id = Uuid::new_v4();

        assert!(inbox.process_with_dedup(id, "e", "c", 0).await.unwrap());
        // zero TTL expires immediately
        assert!(inbox.process_with_dedup(id, "e", "c", 60).await.unwrap());
        assert!(!inbox.process_with_dedup(id, "e", "c", 60).await.unwrap());
    }
}
