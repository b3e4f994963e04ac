//! Key-value store abstraction shared by the registry snapshot and the cache tiers
//!
//! Values are opaque strings (JSON in practice). Entries may carry a TTL after
//! which they are no longer returned.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::SharedResult;

/// Async key-value store with optional per-entry expiry
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a live value
    async fn get(&self, key: &str) -> SharedResult<Option<String>>;

    /// Store a value, replacing any previous one
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> SharedResult<()>;

    /// Remove a key, returning whether it existed
    async fn delete(&self, key: &str) -> SharedResult<bool>;

    /// Remove every key starting with `prefix`, returning the number removed
    async fn delete_prefix(&self, prefix: &str) -> SharedResult<usize>;

    /// Count live keys starting with `prefix`
    async fn count_prefix(&self, prefix: &str) -> SharedResult<usize>;
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Process-local store backed by a concurrent map
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    entries: DashMap<String, StoredValue>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, stored| stored.is_live(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("Purged {} expired entries", removed);
        }
        removed
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> SharedResult<Option<String>> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(stored) if stored.is_live(now) => return Ok(Some(stored.value.clone())),
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.remove_if(key, |_, stored| !stored.is_live(now));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> SharedResult<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .insert(key.to_string(), StoredValue { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> SharedResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn delete_prefix(&self, prefix: &str) -> SharedResult<usize> {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before.saturating_sub(self.entries.len()))
    }

    async fn count_prefix(&self, prefix: &str) -> SharedResult<usize> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().is_live(now))
            .count())
    }
}

#[cfg(feature = "redis")]
mod redis_store {
    use super::*;
    use crate::SharedError;
    use redis::aio::ConnectionManager;
    use redis::AsyncCommands;

    /// Store backed by a Redis server
    #[derive(Clone)]
    pub struct RedisKvStore {
        connection_manager: ConnectionManager,
    }

    impl RedisKvStore {
        pub async fn connect(url: &str) -> SharedResult<Self> {
            let client = redis::Client::open(url)
                .map_err(|e| SharedError::Store(format!("Invalid Redis URL: {}", e)))?;
            let connection_manager = ConnectionManager::new(client)
                .await
                .map_err(|e| SharedError::Store(format!("Failed to connect to Redis: {}", e)))?;
            Ok(Self { connection_manager })
        }

        async fn scan_keys(&self, prefix: &str) -> SharedResult<Vec<String>> {
            let mut conn = self.connection_manager.clone();
            let mut iter: redis::AsyncIter<String> = conn
                .scan_match(format!("{}*", prefix))
                .await
                .map_err(store_error)?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            Ok(keys)
        }
    }

    fn store_error(err: redis::RedisError) -> SharedError {
        SharedError::Store(err.to_string())
    }

    #[async_trait]
    impl KvStore for RedisKvStore {
        async fn get(&self, key: &str) -> SharedResult<Option<String>> {
            let mut conn = self.connection_manager.clone();
            conn.get(key).await.map_err(store_error)
        }

        async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> SharedResult<()> {
            let mut conn = self.connection_manager.clone();
            match ttl {
                Some(ttl) => {
                    let seconds = ttl.as_secs().max(1);
                    let _: () = conn.set_ex(key, value, seconds).await.map_err(store_error)?;
                }
                None => {
                    let _: () = conn.set(key, value).await.map_err(store_error)?;
                }
            }
            Ok(())
        }

        async fn delete(&self, key: &str) -> SharedResult<bool> {
            let mut conn = self.connection_manager.clone();
            let removed: usize = conn.del(key).await.map_err(store_error)?;
            Ok(removed > 0)
        }

        async fn delete_prefix(&self, prefix: &str) -> SharedResult<usize> {
            let keys = self.scan_keys(prefix).await?;
            if keys.is_empty() {
                return Ok(0);
            }
            let mut conn = self.connection_manager.clone();
            let removed: usize = conn.del(keys).await.map_err(store_error)?;
            Ok(removed)
        }

        async fn count_prefix(&self, prefix: &str) -> SharedResult<usize> {
            Ok(self.scan_keys(prefix).await?.len())
        }
    }
}

#[cfg(feature = "redis")]
pub use redis_store::RedisKvStore;
