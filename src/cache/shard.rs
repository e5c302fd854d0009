//! Cache Shard
//!
//! One partition of the keyspace: its own entry map, per-tier LRU queues,
//! byte and item accounting, and tombstones, all behind one `RwLock`.
//!
//! # Design
//!
//! - Reads take the read lock and bump the entry's access tick atomically;
//!   they never reorder the LRU queues.
//! - Queues are ordered by the tick an entry was filed under. When the
//!   eviction scan pops an entry whose access tick has moved on, it is
//!   re-filed at its real tick and the scan continues. The first entry
//!   whose filed tick is current is the true least-recently-used one.
//! - Budget enforcement runs under the write lock before the write that
//!   overflowed the tier returns.
//! - Counters live in a cache-padded block outside the lock so aggregate
//!   stats never contend with writers.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use crossbeam::utils::CachePadded;
use parking_lot::RwLock;
use tracing::debug;

use super::compression::{CompressionAlgorithm, Payload};
use super::entry::{CacheEntry, CacheKey, Tier};
use super::metrics::{ShardCounters, ShardStats};
use super::policy::TierBudgets;

/// An entry dropped out of the Cold tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evicted {
    pub tenant: String,
    pub key: String,
    pub size: u64,
    pub version: u64,
    /// The entry had not been marked clean when it was evicted.
    pub dirty: bool,
}

/// Result of a read-locked lookup.
#[derive(Debug)]
pub(crate) enum ShardRead {
    Hit {
        value: Bytes,
        encoding: CompressionAlgorithm,
        tier: Tier,
        version: u64,
    },
    Expired {
        version: u64,
    },
    Miss,
}

/// How a write is ordered against what the shard already holds.
#[derive(Debug, Clone, Copy)]
pub(crate) enum WriteMode {
    /// Client write: always wins, gets a fresh version, starts dirty.
    Local,
    /// Read-miss fill: only if nothing newer is resident or tombstoned.
    Fill { version: u64 },
    /// Replicated write: only if strictly newer than local state.
    Replica { version: u64 },
}

#[derive(Debug)]
pub(crate) enum WriteResult {
    Written { version: u64, evicted: Vec<Evicted> },
    Skipped { current: u64 },
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum DeleteMode {
    Local,
    Replica { version: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeleteResult {
    Removed { version: u64 },
    Absent { version: u64 },
    Stale { current: u64 },
}

#[derive(Debug, Default)]
struct ShardState {
    entries: HashMap<CacheKey, CacheEntry>,
    queues: [BTreeMap<u64, CacheKey>; 3],
    bytes: [u64; 3],
    items: [usize; 3],
    tombstones: HashMap<CacheKey, u64>,
    tombstone_order: VecDeque<(CacheKey, u64)>,
    version_clock: u64,
}

impl ShardState {
    /// Hybrid clock: wall-clock micros, bumped past anything seen.
    fn next_version(&mut self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or_default();
        self.version_clock = (self.version_clock + 1).max(now);
        self.version_clock
    }

    fn observe_version(&mut self, version: u64) {
        self.version_clock = self.version_clock.max(version);
    }

    /// Newest version known for `key`, resident or deleted.
    fn known_version(&self, key: &CacheKey) -> Option<u64> {
        let resident = self.entries.get(key).map(|e| e.version);
        let tomb = self.tombstones.get(key).copied();
        resident.max(tomb)
    }

    fn attach(&mut self, key: CacheKey, entry: CacheEntry, counters: &ShardCounters) {
        let i = entry.tier.index();
        let size = entry.size();
        self.queues[i].insert(entry.queued_tick, key.clone());
        self.bytes[i] += size;
        self.items[i] += 1;
        counters.add_resident(entry.tier, size);
        self.entries.insert(key, entry);
    }

    fn detach(&mut self, key: &CacheKey, counters: &ShardCounters) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        let i = entry.tier.index();
        let size = entry.size();
        self.queues[i].remove(&entry.queued_tick);
        self.bytes[i] -= size;
        self.items[i] -= 1;
        counters.sub_resident(entry.tier, size);
        Some(entry)
    }

    /// Move a resident entry to `to`, filing it at its last access tick.
    fn retier(&mut self, key: &CacheKey, to: Tier, counters: &ShardCounters) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        let from = entry.tier;
        if from == to {
            return false;
        }
        let size = entry.size();
        self.queues[from.index()].remove(&entry.queued_tick);
        entry.tier = to;
        let tick = entry.requeue();
        self.queues[to.index()].insert(tick, key.clone());

        self.bytes[from.index()] -= size;
        self.items[from.index()] -= 1;
        self.bytes[to.index()] += size;
        self.items[to.index()] += 1;
        counters.sub_resident(from, size);
        counters.add_resident(to, size);
        true
    }

    /// Remove and return the least-recently-used key of `tier` from its queue.
    fn pop_lru(&mut self, tier: Tier) -> Option<CacheKey> {
        let i = tier.index();
        loop {
            let (tick, key) = self.queues[i].pop_first()?;
            let Some(entry) = self.entries.get_mut(&key) else {
                continue;
            };
            if entry.tier != tier || entry.queued_tick != tick {
                continue;
            }
            if entry.last_access() > tick {
                let current = entry.requeue();
                self.queues[i].insert(current, key);
                continue;
            }
            return Some(key);
        }
    }

    /// Push the LRU entry of `tier` one tier colder, or out of the shard.
    fn demote_lru(
        &mut self,
        tier: Tier,
        counters: &ShardCounters,
        evicted: &mut Vec<Evicted>,
    ) -> bool {
        let Some(key) = self.pop_lru(tier) else {
            return false;
        };
        let Some(entry) = self.entries.get_mut(&key) else {
            return false;
        };
        let size = entry.size();
        let from = tier.index();

        match tier.colder() {
            Some(to) => {
                entry.tier = to;
                let tick = entry.requeue();
                self.queues[to.index()].insert(tick, key.clone());
                self.bytes[from] -= size;
                self.items[from] -= 1;
                self.bytes[to.index()] += size;
                self.items[to.index()] += 1;
                counters.sub_resident(tier, size);
                counters.add_resident(to, size);
                counters.record_demotion();
                debug!(key = %key, from = %tier, to = %to, size, "Demoted cache entry");
            }
            None => {
                let Some(entry) = self.entries.remove(&key) else {
                    return false;
                };
                self.bytes[from] -= size;
                self.items[from] -= 1;
                counters.sub_resident(tier, size);
                counters.record_eviction();
                debug!(key = %key, size, dirty = entry.dirty, "Evicted cache entry");
                evicted.push(Evicted {
                    tenant: key.tenant().to_string(),
                    key: key.key().to_string(),
                    size,
                    version: entry.version,
                    dirty: entry.dirty,
                });
            }
        }
        true
    }

    /// Demote and evict until every tier is within budget.
    fn enforce(&mut self, budgets: &TierBudgets, counters: &ShardCounters) -> Vec<Evicted> {
        let mut evicted = Vec::new();
        for tier in Tier::ALL {
            let i = tier.index();
            while budgets.get(tier).exceeded_by(self.bytes[i], self.items[i]) {
                if !self.demote_lru(tier, counters, &mut evicted) {
                    break;
                }
            }
        }
        evicted
    }

    fn add_tombstone(&mut self, key: CacheKey, version: u64, capacity: usize) {
        if capacity == 0 {
            return;
        }
        self.tombstones.insert(key.clone(), version);
        self.tombstone_order.push_back((key, version));
        while self.tombstone_order.len() > capacity {
            let Some((old, v)) = self.tombstone_order.pop_front() else {
                break;
            };
            if self.tombstones.get(&old) == Some(&v) {
                self.tombstones.remove(&old);
            }
        }
    }
}

/// Single cache shard
pub struct Shard {
    state: RwLock<ShardState>,
    tick: AtomicU64,
    counters: CachePadded<ShardCounters>,
    budgets: TierBudgets,
    tombstone_capacity: usize,
}

impl Shard {
    pub fn new(budgets: TierBudgets, tombstone_capacity: usize) -> Self {
        Self {
            state: RwLock::new(ShardState::default()),
            tick: AtomicU64::new(0),
            counters: CachePadded::new(ShardCounters::default()),
            budgets,
            tombstone_capacity,
        }
    }

    #[inline]
    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn budgets(&self) -> &TierBudgets {
        &self.budgets
    }

    pub fn counters(&self) -> &ShardCounters {
        &self.counters
    }

    pub fn stats(&self) -> ShardStats {
        self.counters.snapshot()
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        Tier::ALL
            .iter()
            .map(|t| self.counters.tier_items(*t) as usize)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn lookup(&self, key: &CacheKey, now: Instant) -> ShardRead {
        let state = self.state.read();
        match state.entries.get(key) {
            None => {
                self.counters.record_miss();
                ShardRead::Miss
            }
            Some(entry) if entry.is_expired_at(now) => {
                self.counters.record_miss();
                ShardRead::Expired {
                    version: entry.version,
                }
            }
            Some(entry) => {
                entry.touch(self.next_tick());
                self.counters.record_hit(entry.tier);
                ShardRead::Hit {
                    value: entry.value.clone(),
                    encoding: entry.encoding,
                    tier: entry.tier,
                    version: entry.version,
                }
            }
        }
    }

    pub(crate) fn contains(&self, key: &CacheKey, now: Instant) -> bool {
        self.state
            .read()
            .entries
            .get(key)
            .map(|e| !e.is_expired_at(now))
            .unwrap_or(false)
    }

    /// Best-effort promotion. Gives up rather than wait for the write lock.
    pub(crate) fn try_promote(&self, key: &CacheKey, version: u64, to: Tier) -> bool {
        let Some(mut state) = self.state.try_write() else {
            self.counters.record_promotion_skipped();
            return false;
        };
        let current = state.entries.get(key).map(|e| (e.version, e.tier));
        match current {
            Some((v, tier)) if v == version && tier > to => {
                state.retier(key, to, &self.counters);
                self.counters.record_promotion();
                debug!(key = %key, from = %tier, to = %to, "Promoted cache entry");
                let evicted = state.enforce(&self.budgets, &self.counters);
                drop(state);
                if !evicted.is_empty() {
                    debug!(count = evicted.len(), "Promotion cascaded into eviction");
                }
                true
            }
            _ => false,
        }
    }

    pub(crate) fn write(
        &self,
        key: CacheKey,
        value: impl Into<Payload>,
        mode: WriteMode,
        expires_at: Option<Instant>,
    ) -> WriteResult {
        let value = value.into();
        let mut state = self.state.write();

        let (version, dirty) = match mode {
            WriteMode::Local => (state.next_version(), true),
            WriteMode::Fill { version } => {
                if state.entries.contains_key(&key) {
                    let current = state.known_version(&key).unwrap_or_default();
                    return WriteResult::Skipped { current };
                }
                if let Some(tomb) = state.tombstones.get(&key).copied() {
                    if tomb >= version {
                        return WriteResult::Skipped { current: tomb };
                    }
                }
                state.observe_version(version);
                (version, false)
            }
            WriteMode::Replica { version } => {
                if let Some(current) = state.known_version(&key) {
                    if current >= version {
                        return WriteResult::Skipped { current };
                    }
                }
                state.observe_version(version);
                (version, false)
            }
        };

        state.detach(&key, &self.counters);
        state.tombstones.remove(&key);

        let entry =
            CacheEntry::from_payload(value, Tier::Hot, self.next_tick(), version, dirty, expires_at);
        state.attach(key, entry, &self.counters);
        let evicted = state.enforce(&self.budgets, &self.counters);

        WriteResult::Written { version, evicted }
    }

    pub(crate) fn delete(&self, key: &CacheKey, mode: DeleteMode) -> DeleteResult {
        let mut state = self.state.write();
        let version = match mode {
            DeleteMode::Local => state.next_version(),
            DeleteMode::Replica { version } => {
                if let Some(current) = state.known_version(key) {
                    if current >= version {
                        return DeleteResult::Stale { current };
                    }
                }
                state.observe_version(version);
                version
            }
        };

        let removed = state.detach(key, &self.counters).is_some();
        state.add_tombstone(key.clone(), version, self.tombstone_capacity);
        if removed {
            DeleteResult::Removed { version }
        } else {
            DeleteResult::Absent { version }
        }
    }

    /// Remove the entry only if it still carries `version`.
    pub(crate) fn remove_version(&self, key: &CacheKey, version: u64) -> Option<CacheEntry> {
        let mut state = self.state.write();
        match state.entries.get(key) {
            Some(e) if e.version == version => state.detach(key, &self.counters),
            _ => None,
        }
    }

    pub(crate) fn mark_clean(&self, key: &CacheKey, version: u64) -> bool {
        let mut state = self.state.write();
        match state.entries.get_mut(key) {
            Some(e) if e.version == version => {
                e.dirty = false;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_dirty(&self, key: &CacheKey) -> Option<bool> {
        self.state.read().entries.get(key).map(|e| e.dirty)
    }

    pub(crate) fn tier_of(&self, key: &CacheKey) -> Option<Tier> {
        self.state.read().entries.get(key).map(|e| e.tier)
    }

    pub(crate) fn tombstone_version(&self, key: &CacheKey) -> Option<u64> {
        self.state.read().tombstones.get(key).copied()
    }

    pub(crate) fn purge_expired(&self, now: Instant) -> usize {
        let mut state = self.state.write();
        let expired: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired_at(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            state.detach(key, &self.counters);
            self.counters.record_expiration();
        }
        expired.len()
    }

    pub(crate) fn clear(&self) {
        let mut state = self.state.write();
        let version_clock = state.version_clock;
        *state = ShardState {
            version_clock,
            ..ShardState::default()
        };
        self.counters.reset_resident();
    }

    /// Bytes and items resident in `tier`, read under the lock.
    pub fn resident(&self, tier: Tier) -> (u64, usize) {
        let state = self.state.read();
        (state.bytes[tier.index()], state.items[tier.index()])
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("budgets", &self.budgets)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::policy::TierBudget;

    fn budgets(hot: usize, warm: usize, cold: usize) -> TierBudgets {
        TierBudgets {
            hot: TierBudget::items(hot),
            warm: TierBudget::items(warm),
            cold: TierBudget::items(cold),
        }
    }

    fn key(k: &str) -> CacheKey {
        CacheKey::new("t", k)
    }

    fn put(shard: &Shard, k: &str) -> Vec<Evicted> {
        match shard.write(key(k), Bytes::from(k.to_string()), WriteMode::Local, None) {
            WriteResult::Written { evicted, .. } => evicted,
            WriteResult::Skipped { .. } => panic!("local write skipped"),
        }
    }

    #[test]
    fn test_demotion_cascade() {
        let shard = Shard::new(budgets(1, 1, 1), 16);
        put(&shard, "a");
        put(&shard, "b");
        assert_eq!(shard.tier_of(&key("a")), Some(Tier::Warm));
        put(&shard, "c");
        assert_eq!(shard.tier_of(&key("a")), Some(Tier::Cold));
        assert_eq!(shard.tier_of(&key("b")), Some(Tier::Warm));
        let evicted = put(&shard, "d");
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].key, "a");
        assert!(evicted[0].dirty);
        assert_eq!(shard.len(), 3);

        let stats = shard.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.demotions, 5);
    }

    #[test]
    fn test_lru_respects_reads() {
        let shard = Shard::new(budgets(2, 10, 10), 16);
        put(&shard, "a");
        put(&shard, "b");
        // Touch a so b becomes least recently used
        assert!(matches!(
            shard.lookup(&key("a"), Instant::now()),
            ShardRead::Hit { .. }
        ));
        put(&shard, "c");
        assert_eq!(shard.tier_of(&key("a")), Some(Tier::Hot));
        assert_eq!(shard.tier_of(&key("b")), Some(Tier::Warm));
    }

    #[test]
    fn test_fill_does_not_overwrite() {
        let shard = Shard::new(budgets(4, 4, 4), 16);
        put(&shard, "a");
        let r = shard.write(key("a"), Bytes::from_static(b"old"), WriteMode::Fill { version: 1 }, None);
        assert!(matches!(r, WriteResult::Skipped { .. }));
    }

    #[test]
    fn test_tombstone_blocks_stale_replica() {
        let shard = Shard::new(budgets(4, 4, 4), 16);
        let DeleteResult::Absent { version } = shard.delete(&key("a"), DeleteMode::Local) else {
            panic!("expected absent");
        };
        let stale = shard.write(
            key("a"),
            Bytes::from_static(b"x"),
            WriteMode::Replica { version: version - 1 },
            None,
        );
        assert!(matches!(stale, WriteResult::Skipped { .. }));
        let fresh = shard.write(
            key("a"),
            Bytes::from_static(b"x"),
            WriteMode::Replica { version: version + 1 },
            None,
        );
        assert!(matches!(fresh, WriteResult::Written { .. }));
        assert_eq!(shard.tombstone_version(&key("a")), None);
    }

    #[test]
    fn test_tombstones_bounded() {
        let shard = Shard::new(budgets(4, 4, 4), 2);
        shard.delete(&key("a"), DeleteMode::Local);
        shard.delete(&key("b"), DeleteMode::Local);
        shard.delete(&key("c"), DeleteMode::Local);
        assert_eq!(shard.tombstone_version(&key("a")), None);
        assert!(shard.tombstone_version(&key("b")).is_some());
        assert!(shard.tombstone_version(&key("c")).is_some());
    }

    #[test]
    fn test_versions_increase() {
        let shard = Shard::new(budgets(4, 4, 4), 16);
        let v1 = match shard.write(key("a"), Bytes::new(), WriteMode::Local, None) {
            WriteResult::Written { version, .. } => version,
            _ => unreachable!(),
        };
        let v2 = match shard.write(key("a"), Bytes::new(), WriteMode::Local, None) {
            WriteResult::Written { version, .. } => version,
            _ => unreachable!(),
        };
        assert!(v2 > v1);
    }

    #[test]
    fn test_clear_resets_accounting() {
        let shard = Shard::new(budgets(4, 4, 4), 16);
        put(&shard, "a");
        put(&shard, "b");
        shard.clear();
        assert!(shard.is_empty());
        assert_eq!(shard.resident(Tier::Hot), (0, 0));
    }
}
