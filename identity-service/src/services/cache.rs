use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Ephemeral key/value store with per-key TTL. Backs the token denylist,
/// single-use tokens and cache-backed inbox deduplication.
#[async_trait]
pub trait TrustCache: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), anyhow::Error>;

    /// Atomic set-if-absent. `true` when this call created the key.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<bool, anyhow::Error>;

    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error>;

    /// Atomic get-and-delete. At most one caller observes the value.
    async fn take(&self, key: &str) -> Result<Option<String>, anyhow::Error>;

    async fn delete(&self, key: &str) -> Result<(), anyhow::Error>;

    async fn exists(&self, key: &str) -> Result<bool, anyhow::Error>;

    /// Drops entries whose TTL has passed and returns how many went.
    /// Backends that expire keys themselves have nothing to do.
    async fn purge_expired(&self) -> Result<u64, anyhow::Error> {
        Ok(0)
    }

    async fn health_check(&self) -> Result<(), anyhow::Error>;
}

#[derive(Clone)]
pub struct RedisService {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisService {
    pub async fn new(config: &crate::config::RedisConfig) -> Result<Self, anyhow::Error> {
        tracing::info!("Connecting to Redis");
        let client = Client::open(config.url.clone())?;

        // ConnectionManager reconnects automatically
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
        })
    }

    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl TrustCache for RedisService {
    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds.max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to set cache key: {}", e))
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds.max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to set cache key if absent: {}", e))?;

        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to get cache key: {}", e))
    }

    async fn take(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("GETDEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to take cache key: {}", e))
    }

    async fn delete(&self, key: &str) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to delete cache key: {}", e))
    }

    async fn exists(&self, key: &str) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to check cache key: {}", e))
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Redis health check failed: {}", e))
    }
}

/// Process-local cache for development and tests. Expired entries are
/// dropped on access and by `purge_expired`, which the maintenance worker
/// runs every pass.
#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>>, anyhow::Error> {
        self.entries
            .lock()
            .map_err(|e| anyhow::anyhow!("In-memory cache mutex poisoned: {}", e))
    }

    fn live<'a>(
        entries: &'a mut HashMap<String, (String, Instant)>,
        key: &str,
    ) -> Option<&'a String> {
        let expired = entries
            .get(key)
            .is_some_and(|(_, expires)| *expires <= Instant::now());
        if expired {
            entries.remove(key);
            return None;
        }
        entries.get(key).map(|(v, _)| v)
    }
}

#[async_trait]
impl TrustCache for InMemoryCache {
    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), anyhow::Error> {
        let expires = Instant::now() + Duration::from_secs(ttl_seconds.max(1));
        self.lock()?
            .insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<bool, anyhow::Error> {
        let mut entries = self.lock()?;
        if Self::live(&mut entries, key).is_some() {
            return Ok(false);
        }
        let expires = Instant::now() + Duration::from_secs(ttl_seconds.max(1));
        entries.insert(key.to_string(), (value.to_string(), expires));
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        let mut entries = self.lock()?;
        Ok(Self::live(&mut entries, key).cloned())
    }

    async fn take(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        let mut entries = self.lock()?;
        let value = Self::live(&mut entries, key).cloned();
        entries.remove(key);
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<(), anyhow::Error> {
        self.lock()?.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, anyhow::Error> {
        let mut entries = self.lock()?;
        Ok(Self::live(&mut entries, key).is_some())
    }

    async fn purge_expired(&self) -> Result<u64, anyhow::Error> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|_, (_, expires)| *expires > now);
        Ok((before - entries.len()) as u64)
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_set_if_absent_only_once() {
        let cache = InMemoryCache::new();
        assert!(cache.set_if_absent("k", "1", 60).await.unwrap());
        assert!(!cache.set_if_absent("k", "2", 60).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_take_is_single_use() {
        let cache = InMemoryCache::new();
        cache.set("password_reset:abc", "user-1", 60).await.unwrap();

        assert_eq!(
            cache.take("password_reset:abc").await.unwrap().as_deref(),
            Some("user-1")
        );
        assert_eq!(cache.take("password_reset:abc").await.unwrap(), None);
        assert!(!cache.exists("password_reset:abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_take_has_one_winner() {
        let cache = Arc::new(InMemoryCache::new());
        cache.set("t", "v", 60).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.take("t").await.unwrap() })
            })
            .collect();

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_expired_entries_are_invisible() {
        let cache = InMemoryCache::new();
        {
            let mut entries = cache.entries.lock().unwrap();
            entries.insert(
                "old".to_string(),
                ("v".to_string(), Instant::now() - Duration::from_secs(1)),
            );
        }
        assert_eq!(cache.get("old").await.unwrap(), None);
        assert!(cache.set_if_absent("old", "new", 60).await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_drops_unread_expired_entries() {
        let cache = InMemoryCache::new();
        {
            let mut entries = cache.entries.lock().unwrap();
            for i in 0..1000 {
                entries.insert(
                    format!("blacklist:token:{}", i),
                    ("1".to_string(), Instant::now() - Duration::from_millis(1)),
                );
            }
        }
        cache.set("blacklist:user:live", "1", 60).await.unwrap();

        assert_eq!(cache.purge_expired().await.unwrap(), 1000);
        assert_eq!(cache.entries.lock().unwrap().len(), 1);
        assert!(cache.exists("blacklist:user:live").await.unwrap());
        assert_eq!(cache.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    #[ignore] // Requires running Redis
    async fn test_redis_getdel() {
        let service = RedisService::new(&crate::config::RedisConfig {
            backend: crate::config::CacheBackend::Redis,
            url: "redis://127.0.0.1:6379".to_string(),
        })
        .await
        .unwrap();

        service.set("test:getdel", "v", 10).await.unwrap();
        assert_eq!(service.take("test:getdel").await.unwrap().as_deref(), Some("v"));
        assert_eq!(service.take("test:getdel").await.unwrap(), None);
    }
}
