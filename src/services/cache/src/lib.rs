//! Three-tier read-through cache
//!
//! Tiers live in one injected [`KvStore`](gradmesh_shared::KvStore) under
//! distinct key prefixes, each with its own TTL. Reads probe L1, L2 then L3 and
//! promote a hit into every faster tier.

use gradmesh_shared::SharedError;
use thiserror::Error;

pub mod strategy;
pub mod tier;

pub use strategy::CachingStrategy;
pub use tier::{CacheStats, CacheTier, TierStats};

/// Cache errors
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache backend error: {0}")]
    Backend(#[from] SharedError),

    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid cache key: {0}")]
    InvalidKey(String),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Number of lock stripes guarding per-key tier writes
pub const LOCK_STRIPES: usize = 64;
