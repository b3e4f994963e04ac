//! Cache tiers and hit/miss accounting

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// One layer of the cache, fastest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    L1,
    L2,
    L3,
}

impl CacheTier {
    /// Tiers in read order
    pub const ALL: [CacheTier; 3] = [CacheTier::L1, CacheTier::L2, CacheTier::L3];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::L1 => "l1",
            CacheTier::L2 => "l2",
            CacheTier::L3 => "l3",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            CacheTier::L1 => 0,
            CacheTier::L2 => 1,
            CacheTier::L3 => 2,
        }
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters of a single tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierStats {
    pub tier: CacheTier,
    pub hits: u64,
    pub misses: u64,
}

/// Snapshot of all cache counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub tiers: Vec<TierStats>,
    /// Lookups that missed in every tier
    pub misses: u64,
    /// Lookups answered by some tier
    pub hits: u64,
    pub sets: u64,
    pub deletes: u64,
}

impl CacheStats {
    pub fn tier(&self, tier: CacheTier) -> Option<&TierStats> {
        self.tiers.iter().find(|stats| stats.tier == tier)
    }

    /// Fraction of lookups answered by any tier
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    tier_hits: [AtomicU64; 3],
    tier_misses: [AtomicU64; 3],
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
}

impl Counters {
    pub(crate) fn record_hit(&self, tier: CacheTier) {
        self.tier_hits[tier.index()].fetch_add(1, Ordering::Relaxed);
        metrics::counter!("cache_hits_total", "tier" => tier.as_str()).increment(1);
    }

    pub(crate) fn record_tier_miss(&self, tier: CacheTier) {
        self.tier_misses[tier.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("cache_misses_total").increment(1);
    }

    pub(crate) fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        let tiers: Vec<TierStats> = CacheTier::ALL
            .iter()
            .map(|tier| TierStats {
                tier: *tier,
                hits: self.tier_hits[tier.index()].load(Ordering::Relaxed),
                misses: self.tier_misses[tier.index()].load(Ordering::Relaxed),
            })
            .collect();
        let hits = tiers.iter().map(|t| t.hits).sum();

        CacheStats {
            tiers,
            misses: self.misses.load(Ordering::Relaxed),
            hits,
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}
