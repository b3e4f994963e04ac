//! Read-through, write-through caching over three tiers

use crate::tier::{CacheStats, CacheTier, Counters};
use crate::{CacheError, Result, LOCK_STRIPES};

use gradmesh_shared::{CacheConfig, KvStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// Three-tier cache backed by a shared key-value store
pub struct CachingStrategy {
    config: CacheConfig,
    store: Arc<dyn KvStore>,
    counters: Counters,
    stripes: Vec<Mutex<()>>,
}

impl CachingStrategy {
    pub fn new(config: CacheConfig, store: Arc<dyn KvStore>) -> Self {
        Self {
            config,
            store,
            counters: Counters::default(),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn tier_key(&self, tier: CacheTier, key: &str) -> String {
        format!("{}:{}:{}", self.config.key_prefix, tier, key)
    }

    fn tier_ttl(&self, tier: CacheTier) -> Duration {
        let seconds = match tier {
            CacheTier::L1 => self.config.l1_ttl_seconds,
            CacheTier::L2 => self.config.l2_ttl_seconds,
            CacheTier::L3 => self.config.l3_ttl_seconds,
        };
        Duration::from_secs(seconds)
    }

    fn stripe(&self, key: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % self.stripes.len()]
    }

    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(CacheError::InvalidKey("key must not be empty".to_string()));
        }
        Ok(())
    }

    /// Look up `key`, promoting a hit into every faster tier
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        Self::validate_key(key)?;
        let _guard = self.stripe(key).lock().await;

        for (position, tier) in CacheTier::ALL.iter().enumerate() {
            let Some(value) = self.store.get(&self.tier_key(*tier, key)).await? else {
                self.counters.record_tier_miss(*tier);
                continue;
            };

            self.counters.record_hit(*tier);
            for faster in CacheTier::ALL[..position].iter().rev() {
                self.store
                    .set(
                        &self.tier_key(*faster, key),
                        value.clone(),
                        Some(self.tier_ttl(*faster)),
                    )
                    .await?;
            }
            if position > 0 {
                debug!(key = %key, tier = %tier, "Promoted cache entry");
            }
            return Ok(Some(value));
        }

        self.counters.record_miss();
        trace!(key = %key, "Cache miss in all tiers");
        Ok(None)
    }

    /// Write `value` to every tier, with `ttl` overriding the per-tier TTLs
    pub async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        Self::validate_key(key)?;
        let _guard = self.stripe(key).lock().await;

        let mut previous = Vec::with_capacity(CacheTier::ALL.len());
        for tier in CacheTier::ALL.iter().rev() {
            previous.push((*tier, self.store.get(&self.tier_key(*tier, key)).await?));
        }

        for (written, (tier, _)) in previous.iter().enumerate() {
            let tier_ttl = ttl.unwrap_or_else(|| self.tier_ttl(*tier));
            if let Err(err) = self
                .store
                .set(&self.tier_key(*tier, key), value.clone(), Some(tier_ttl))
                .await
            {
                self.roll_back(key, &previous[..written]).await;
                return Err(err.into());
            }
        }

        self.counters.record_set();
        Ok(())
    }

    /// Restore tiers written by a failed `set`; tiers that cannot be restored are emptied
    async fn roll_back(&self, key: &str, written: &[(CacheTier, Option<String>)]) {
        for (tier, prior) in written {
            let tier_key = self.tier_key(*tier, key);
            let restored = match prior {
                Some(value) => {
                    self.store
                        .set(&tier_key, value.clone(), Some(self.tier_ttl(*tier)))
                        .await
                }
                None => self.store.delete(&tier_key).await.map(|_| ()),
            };
            if let Err(err) = restored {
                warn!(key = %key, tier = %tier, error = %err, "Cache rollback failed, evicting");
                if let Err(err) = self.store.delete(&tier_key).await {
                    warn!(key = %key, tier = %tier, error = %err, "Cache eviction failed");
                }
            }
        }
    }

    /// Remove `key` from every tier
    pub async fn delete(&self, key: &str) -> Result<bool> {
        Self::validate_key(key)?;
        let _guard = self.stripe(key).lock().await;

        let mut existed = false;
        for tier in CacheTier::ALL {
            existed |= self.store.delete(&self.tier_key(tier, key)).await?;
        }

        self.counters.record_delete();
        Ok(existed)
    }

    /// Remove `key` from a single tier
    pub async fn evict_tier(&self, key: &str, tier: CacheTier) -> Result<bool> {
        Self::validate_key(key)?;
        let _guard = self.stripe(key).lock().await;
        Ok(self.store.delete(&self.tier_key(tier, key)).await?)
    }

    /// Drop every entry of one tier
    pub async fn clear_tier(&self, tier: CacheTier) -> Result<usize> {
        let prefix = format!("{}:{}:", self.config.key_prefix, tier);
        let removed = self.store.delete_prefix(&prefix).await?;
        debug!(tier = %tier, removed, "Cleared cache tier");
        Ok(removed)
    }

    /// Number of live entries in one tier
    pub async fn tier_size(&self, tier: CacheTier) -> Result<usize> {
        let prefix = format!("{}:{}:", self.config.key_prefix, tier);
        Ok(self.store.count_prefix(&prefix).await?)
    }

    /// Typed lookup over serde
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Typed write over serde
    pub async fn set_as<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.set(key, raw, ttl).await
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }

    pub fn hit_rate(&self) -> f64 {
        self.stats().hit_rate()
    }
}
