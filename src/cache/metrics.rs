//! Cache Metrics Collection
//!
//! Every shard owns a [`ShardCounters`] block. Aggregate statistics are
//! produced by summing the blocks without taking any shard lock, so a
//! snapshot taken during heavy writes may be momentarily inconsistent.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::entry::Tier;

/// Per-shard atomic counters.
#[derive(Debug, Default)]
pub struct ShardCounters {
    hits: [AtomicU64; 3],
    misses: AtomicU64,
    evictions: AtomicU64,
    promotions: AtomicU64,
    promotions_skipped: AtomicU64,
    demotions: AtomicU64,
    expirations: AtomicU64,
    rejected: AtomicU64,
    bytes: [AtomicU64; 3],
    items: [AtomicU64; 3],
}

impl ShardCounters {
    pub fn record_hit(&self, tier: Tier) {
        self.hits[tier.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion_skipped(&self) {
        self.promotions_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_demotion(&self) {
        self.demotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Account an entry entering `tier`. Called under the shard write lock.
    pub(crate) fn add_resident(&self, tier: Tier, size: u64) {
        self.bytes[tier.index()].fetch_add(size, Ordering::Relaxed);
        self.items[tier.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Account an entry leaving `tier`. Called under the shard write lock.
    pub(crate) fn sub_resident(&self, tier: Tier, size: u64) {
        self.bytes[tier.index()].fetch_sub(size, Ordering::Relaxed);
        self.items[tier.index()].fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn reset_resident(&self) {
        for tier in Tier::ALL {
            self.bytes[tier.index()].store(0, Ordering::Relaxed);
            self.items[tier.index()].store(0, Ordering::Relaxed);
        }
    }

    pub fn tier_bytes(&self, tier: Tier) -> u64 {
        self.bytes[tier.index()].load(Ordering::Relaxed)
    }

    pub fn tier_items(&self, tier: Tier) -> u64 {
        self.items[tier.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ShardStats {
        let tier = |t: Tier| TierStats {
            hits: self.hits[t.index()].load(Ordering::Relaxed),
            bytes: self.tier_bytes(t),
            items: self.tier_items(t),
        };
        ShardStats {
            hot: tier(Tier::Hot),
            warm: tier(Tier::Warm),
            cold: tier(Tier::Cold),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            promotions_skipped: self.promotions_skipped.load(Ordering::Relaxed),
            demotions: self.demotions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Statistics for one tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierStats {
    pub hits: u64,
    pub bytes: u64,
    pub items: u64,
}

impl TierStats {
    fn merge(&mut self, other: &TierStats) {
        self.hits += other.hits;
        self.bytes += other.bytes;
        self.items += other.items;
    }
}

/// Snapshot of one shard's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShardStats {
    pub hot: TierStats,
    pub warm: TierStats,
    pub cold: TierStats,
    pub misses: u64,
    pub evictions: u64,
    pub promotions: u64,
    pub promotions_skipped: u64,
    pub demotions: u64,
    pub expirations: u64,
    pub rejected: u64,
}

impl ShardStats {
    pub fn tier(&self, tier: Tier) -> &TierStats {
        match tier {
            Tier::Hot => &self.hot,
            Tier::Warm => &self.warm,
            Tier::Cold => &self.cold,
        }
    }

    pub fn hits(&self) -> u64 {
        self.hot.hits + self.warm.hits + self.cold.hits
    }

    pub fn items(&self) -> u64 {
        self.hot.items + self.warm.items + self.cold.items
    }

    pub fn bytes(&self) -> u64 {
        self.hot.bytes + self.warm.bytes + self.cold.bytes
    }
}

/// Aggregate statistics across all shards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub shards: usize,
    #[serde(flatten)]
    pub totals: ShardStats,
}

impl CacheStats {
    pub(crate) fn accumulate(&mut self, shard: &ShardStats) {
        self.shards += 1;
        let t = &mut self.totals;
        t.hot.merge(&shard.hot);
        t.warm.merge(&shard.warm);
        t.cold.merge(&shard.cold);
        t.misses += shard.misses;
        t.evictions += shard.evictions;
        t.promotions += shard.promotions;
        t.promotions_skipped += shard.promotions_skipped;
        t.demotions += shard.demotions;
        t.expirations += shard.expirations;
        t.rejected += shard.rejected;
    }

    pub fn hits(&self) -> u64 {
        self.totals.hits()
    }

    pub fn misses(&self) -> u64 {
        self.totals.misses
    }

    pub fn evictions(&self) -> u64 {
        self.totals.evictions
    }

    pub fn items(&self) -> u64 {
        self.totals.items()
    }

    pub fn bytes(&self) -> u64 {
        self.totals.bytes()
    }

    pub fn bytes_in(&self, tier: Tier) -> u64 {
        self.totals.tier(tier).bytes
    }

    pub fn items_in(&self, tier: Tier) -> u64 {
        self.totals.tier(tier).items
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot() {
        let c = ShardCounters::default();
        c.record_hit(Tier::Hot);
        c.record_hit(Tier::Warm);
        c.record_miss();
        c.add_resident(Tier::Hot, 100);
        c.add_resident(Tier::Cold, 50);
        c.sub_resident(Tier::Hot, 100);

        let s = c.snapshot();
        assert_eq!(s.hits(), 2);
        assert_eq!(s.misses, 1);
        assert_eq!(s.hot.bytes, 0);
        assert_eq!(s.cold.items, 1);
        assert_eq!(s.bytes(), 50);
    }

    #[test]
    fn test_aggregate_hit_ratio() {
        let a = ShardCounters::default();
        let b = ShardCounters::default();
        a.record_hit(Tier::Hot);
        a.record_hit(Tier::Hot);
        b.record_hit(Tier::Cold);
        b.record_miss();

        let mut stats = CacheStats::default();
        stats.accumulate(&a.snapshot());
        stats.accumulate(&b.snapshot());

        assert_eq!(stats.shards, 2);
        assert_eq!(stats.hits(), 3);
        assert!((stats.hit_ratio() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_empty_hit_ratio() {
        assert_eq!(CacheStats::default().hit_ratio(), 0.0);
    }
}
