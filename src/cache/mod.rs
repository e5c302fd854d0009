//! Sharded Tiered Cache
//!
//! In-memory cache in front of the backing store, split into independent
//! shards with three tiers each.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           ShardedCache                                   │
//! │        hash(tenant, key) ──► shard[i]   (N shards, default 256)          │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  Shard                                                                   │
//! │  ┌────────────┐  demote  ┌────────────┐  demote  ┌────────────┐  evict   │
//! │  │    Hot     │ ───────► │    Warm    │ ───────► │    Cold    │ ───────► │
//! │  │  LRU queue │          │  LRU queue │          │  LRU queue │          │
//! │  └────────────┘ ◄─────── └────────────┘ ◄─────── └────────────┘          │
//! │                    promote on hit (best effort)                          │
//! └──────────────────────────────────────────────────────────────────────────┘
//!                                   │ miss
//!                                   ▼
//!                             Backing store
//! ```
//!
//! # Design Principles
//!
//! - Contention is limited to the one shard a key hashes to
//! - Per-tier budgets are enforced before a write returns
//! - Promotion never blocks a read: it is skipped if the shard is busy
//! - Statistics are per-shard atomics summed on read
//! - Large values are compressed outside the shard lock and budgets count
//!   the compressed size

mod compression;
mod entry;
mod metrics;
mod policy;
mod proptest;
mod shard;
mod sharded;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use compression::{
    CompressionAlgorithm, CompressionConfig, CompressionManager, CompressionStats, Payload,
};
pub use entry::{CacheEntry, CacheKey, Tier};
pub(crate) use entry::{fold_index, fx_hash};
pub use metrics::{CacheStats, ShardCounters, ShardStats, TierStats};
pub use policy::{PromotionMode, TierBudget, TierBudgets};
pub use shard::{Evicted, Shard};
pub use sharded::{Lookup, PutOutcome, RemoteApply, ShardedCache};

use crate::error::{Error, Result};

/// Default number of shards
pub const DEFAULT_SHARD_COUNT: usize = 256;

/// Default maximum size of a single entry (1 MiB)
pub const DEFAULT_MAX_ENTRY_SIZE: u64 = 1024 * 1024;

/// Default number of delete tombstones remembered per shard
pub const DEFAULT_TOMBSTONES_PER_SHARD: usize = 1024;

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of shards (fixed at construction)
    pub shard_count: usize,
    /// Per-shard tier budgets
    pub budgets: TierBudgets,
    /// Largest value a single entry may hold
    pub max_entry_size: u64,
    /// Where Warm and Cold hits are moved
    pub promotion: PromotionMode,
    /// Expiry applied to entries written without an explicit TTL
    pub default_ttl_ms: Option<u64>,
    /// Deleted-key versions remembered per shard
    pub tombstones_per_shard: usize,
    /// Compression of large values
    pub compression: CompressionConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shard_count: DEFAULT_SHARD_COUNT,
            budgets: TierBudgets::default(),
            max_entry_size: DEFAULT_MAX_ENTRY_SIZE,
            promotion: PromotionMode::ToHot,
            default_ttl_ms: None,
            tombstones_per_shard: DEFAULT_TOMBSTONES_PER_SHARD,
            compression: CompressionConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn with_shard_count(mut self, shard_count: usize) -> Self {
        self.shard_count = shard_count;
        self
    }

    pub fn with_budgets(mut self, budgets: TierBudgets) -> Self {
        self.budgets = budgets;
        self
    }

    pub fn with_max_entry_size(mut self, max_entry_size: u64) -> Self {
        self.max_entry_size = max_entry_size;
        self
    }

    pub fn with_promotion(mut self, promotion: PromotionMode) -> Self {
        self.promotion = promotion;
        self
    }

    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl_ms = Some(ttl.as_millis() as u64);
        self
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(Error::Config("cache.shard_count must be at least 1".into()));
        }
        for tier in Tier::ALL {
            let budget = self.budgets.get(tier);
            if budget.max_items == 0 || budget.max_bytes == 0 {
                return Err(Error::Config(format!(
                    "cache.budgets.{} must allow at least one entry",
                    tier
                )));
            }
        }
        if self.max_entry_size == 0 {
            return Err(Error::Config("cache.max_entry_size must be non-zero".into()));
        }
        self.compression.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
