//! Sharded Tiered Cache
//!
//! Routes each tenant-scoped key to one shard and exposes the public cache
//! operations. No operation touches more than one shard except the
//! aggregate ones (`stats`, `len`, `clear`, `purge_expired`).

use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, instrument, warn};

use super::compression::{CompressionManager, CompressionStats};
use super::entry::{CacheKey, Tier};
use super::metrics::{CacheStats, ShardStats};
use super::shard::{DeleteMode, DeleteResult, Evicted, ShardRead, Shard, WriteMode, WriteResult};
use super::CacheConfig;
use crate::domain::ports::Change;
use crate::error::{Error, Result};

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Hit {
        value: Bytes,
        /// Tier the entry was found in, before any promotion.
        tier: Tier,
        version: u64,
    },
    Miss,
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit { .. })
    }

    pub fn value(&self) -> Option<&Bytes> {
        match self {
            Lookup::Hit { value, .. } => Some(value),
            Lookup::Miss => None,
        }
    }

    pub fn tier(&self) -> Option<Tier> {
        match self {
            Lookup::Hit { tier, .. } => Some(*tier),
            Lookup::Miss => None,
        }
    }

    pub fn version(&self) -> Option<u64> {
        match self {
            Lookup::Hit { version, .. } => Some(*version),
            Lookup::Miss => None,
        }
    }

    pub fn into_value(self) -> Option<Bytes> {
        match self {
            Lookup::Hit { value, .. } => Some(value),
            Lookup::Miss => None,
        }
    }
}

/// Result of a successful `put`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    /// Version assigned to the new entry.
    pub version: u64,
    /// Entries that fell out of the Cold tier to make room.
    pub evicted: Vec<Evicted>,
}

/// Result of applying a replicated change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApply {
    Applied,
    /// Local state is as new or newer.
    Stale { current: u64 },
}

/// N-way sharded Hot/Warm/Cold cache.
pub struct ShardedCache {
    shards: Box<[Shard]>,
    codec: CompressionManager,
    config: CacheConfig,
}

impl ShardedCache {
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let shards: Vec<Shard> = (0..config.shard_count)
            .map(|_| Shard::new(config.budgets, config.tombstones_per_shard))
            .collect();
        Ok(Self {
            shards: shards.into_boxed_slice(),
            codec: CompressionManager::new(config.compression.clone()),
            config,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[inline]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    fn shard(&self, key: &CacheKey) -> &Shard {
        &self.shards[key.shard_index(self.shards.len())]
    }

    /// Shard index a key routes to.
    pub fn shard_of(&self, tenant: &str, key: &str) -> usize {
        CacheKey::new(tenant, key).shard_index(self.shards.len())
    }

    /// Largest value a single entry may hold.
    pub fn max_entry_size(&self) -> u64 {
        self.config
            .max_entry_size
            .min(self.config.budgets.hot.max_bytes)
    }

    fn check_size(&self, shard: &Shard, size: u64) -> Result<()> {
        let limit = self.max_entry_size();
        if size > limit {
            shard.counters().record_rejected();
            return Err(Error::EntryTooLarge { size, limit });
        }
        Ok(())
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<Instant> {
        ttl.or(self.config.default_ttl())
            .map(|ttl| Instant::now() + ttl)
    }

    /// Insert or replace a value in the Hot tier, marked dirty.
    ///
    /// Overflow is resolved before returning: the LRU Hot entry is demoted
    /// to Warm, Warm to Cold, and Cold entries are evicted.
    pub fn put(&self, tenant: &str, key: &str, value: Bytes) -> Result<PutOutcome> {
        self.put_with_ttl(tenant, key, value, None)
    }

    #[instrument(level = "trace", skip(self, value), fields(size = value.len()))]
    pub fn put_with_ttl(
        &self,
        tenant: &str,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<PutOutcome> {
        let ck = CacheKey::new(tenant, key);
        let shard = self.shard(&ck);
        self.check_size(shard, value.len() as u64)?;
        let payload = self.codec.compress(value);

        match shard.write(ck, payload, WriteMode::Local, self.expiry(ttl)) {
            WriteResult::Written { version, evicted } => Ok(PutOutcome { version, evicted }),
            WriteResult::Skipped { current } => Err(Error::Internal(format!(
                "local write skipped at version {}",
                current
            ))),
        }
    }

    /// Look a key up, promoting Warm and Cold hits when the shard is free.
    pub fn get(&self, tenant: &str, key: &str) -> Lookup {
        let ck = CacheKey::new(tenant, key);
        let shard = self.shard(&ck);

        match shard.lookup(&ck, Instant::now()) {
            ShardRead::Hit {
                value,
                encoding,
                tier,
                version,
            } => {
                let value = match self.codec.decompress(value, encoding) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(key = %ck, version, error = %e, "Dropped undecodable cache entry");
                        shard.remove_version(&ck, version);
                        return Lookup::Miss;
                    }
                };
                if let Some(target) = self.config.promotion.target(tier) {
                    shard.try_promote(&ck, version, target);
                }
                Lookup::Hit {
                    value,
                    tier,
                    version,
                }
            }
            ShardRead::Expired { version } => {
                if shard.remove_version(&ck, version).is_some() {
                    shard.counters().record_expiration();
                    debug!(key = %ck, "Dropped expired cache entry");
                }
                Lookup::Miss
            }
            ShardRead::Miss => Lookup::Miss,
        }
    }

    /// Remove a key. Returns whether it was resident.
    pub fn delete(&self, tenant: &str, key: &str) -> bool {
        self.delete_versioned(tenant, key).0
    }

    /// Remove a key and leave a tombstone. Returns whether it was resident
    /// and the version stamped on the delete.
    pub fn delete_versioned(&self, tenant: &str, key: &str) -> (bool, u64) {
        let ck = CacheKey::new(tenant, key);
        match self.shard(&ck).delete(&ck, DeleteMode::Local) {
            DeleteResult::Removed { version } => (true, version),
            DeleteResult::Absent { version } | DeleteResult::Stale { current: version } => {
                (false, version)
            }
        }
    }

    /// Fill a clean entry after a backing-store read.
    ///
    /// Skipped when the key is already resident or was deleted at or after
    /// `version`.
    pub fn populate(&self, tenant: &str, key: &str, value: Bytes, version: u64) -> Result<bool> {
        let ck = CacheKey::new(tenant, key);
        let shard = self.shard(&ck);
        self.check_size(shard, value.len() as u64)?;
        let expiry = self.expiry(None);
        let payload = self.codec.compress(value);
        Ok(matches!(
            shard.write(ck, payload, WriteMode::Fill { version }, expiry),
            WriteResult::Written { .. }
        ))
    }

    /// Clear the dirty flag if the entry still carries `version`.
    pub fn mark_clean(&self, tenant: &str, key: &str, version: u64) -> bool {
        let ck = CacheKey::new(tenant, key);
        self.shard(&ck).mark_clean(&ck, version)
    }

    pub fn is_dirty(&self, tenant: &str, key: &str) -> Option<bool> {
        let ck = CacheKey::new(tenant, key);
        self.shard(&ck).is_dirty(&ck)
    }

    /// Undo a write whose downstream steps failed. A newer write wins.
    pub fn rollback(&self, tenant: &str, key: &str, version: u64) -> bool {
        let ck = CacheKey::new(tenant, key);
        let removed = self.shard(&ck).remove_version(&ck, version).is_some();
        if removed {
            debug!(key = %ck, version, "Rolled back cache entry");
        }
        removed
    }

    /// Apply a change received from a peer, ordered by version.
    pub fn apply_remote(&self, tenant: &str, key: &str, change: Change) -> Result<RemoteApply> {
        let ck = CacheKey::new(tenant, key);
        let shard = self.shard(&ck);
        match change {
            Change::Put { value, version } => {
                self.check_size(shard, value.len() as u64)?;
                let expiry = self.expiry(None);
                let payload = self.codec.compress(value);
                Ok(match shard.write(ck, payload, WriteMode::Replica { version }, expiry) {
                    WriteResult::Written { .. } => RemoteApply::Applied,
                    WriteResult::Skipped { current } => RemoteApply::Stale { current },
                })
            }
            Change::Delete { version } => Ok(match shard.delete(&ck, DeleteMode::Replica { version }) {
                DeleteResult::Removed { .. } | DeleteResult::Absent { .. } => RemoteApply::Applied,
                DeleteResult::Stale { current } => RemoteApply::Stale { current },
            }),
        }
    }

    pub fn contains(&self, tenant: &str, key: &str) -> bool {
        let ck = CacheKey::new(tenant, key);
        self.shard(&ck).contains(&ck, Instant::now())
    }

    /// Tier a key currently sits in, without counting an access.
    pub fn tier_of(&self, tenant: &str, key: &str) -> Option<Tier> {
        let ck = CacheKey::new(tenant, key);
        self.shard(&ck).tier_of(&ck)
    }

    /// Insert several values. Stops at the first rejected entry.
    pub fn put_many<I, K>(&self, tenant: &str, items: I) -> Result<Vec<PutOutcome>>
    where
        I: IntoIterator<Item = (K, Bytes)>,
        K: AsRef<str>,
    {
        items
            .into_iter()
            .map(|(k, v)| self.put(tenant, k.as_ref(), v))
            .collect()
    }

    pub fn get_many<'a, I>(&self, tenant: &str, keys: I) -> Vec<Lookup>
    where
        I: IntoIterator<Item = &'a str>,
    {
        keys.into_iter().map(|k| self.get(tenant, k)).collect()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        self.shards.iter().map(|s| s.purge_expired(now)).sum()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.is_empty())
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.clear();
        }
    }

    /// Aggregate statistics. Lock-free; shards are read one at a time.
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for shard in self.shards.iter() {
            stats.accumulate(&shard.stats());
        }
        stats
    }

    pub fn compression_stats(&self) -> CompressionStats {
        self.codec.stats()
    }

    pub fn shard_stats(&self, index: usize) -> Option<ShardStats> {
        self.shards.get(index).map(|s| s.stats())
    }

    /// Per-tier residency of one shard, read under its lock.
    pub fn shard_residency(&self, index: usize, tier: Tier) -> Option<(u64, usize)> {
        self.shards.get(index).map(|s| s.resident(tier))
    }
}

impl std::fmt::Debug for ShardedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedCache")
            .field("shards", &self.shards.len())
            .field("config", &self.config)
            .finish()
    }
}
