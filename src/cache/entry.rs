//! Cache Entry Types
//!
//! Keys are tenant-scoped and carry a pre-computed hash so shard routing and
//! map lookups never rehash the strings.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::compression::{CompressionAlgorithm, Payload};

/// Cache tier, hottest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

impl Tier {
    /// All tiers in demotion order.
    pub const ALL: [Tier; 3] = [Tier::Hot, Tier::Warm, Tier::Cold];

    /// Tier an entry falls into when demoted. `None` means evicted.
    #[inline]
    pub fn colder(self) -> Option<Tier> {
        match self {
            Tier::Hot => Some(Tier::Warm),
            Tier::Warm => Some(Tier::Cold),
            Tier::Cold => None,
        }
    }

    /// Tier one step closer to Hot.
    #[inline]
    pub fn warmer(self) -> Tier {
        match self {
            Tier::Hot | Tier::Warm => Tier::Hot,
            Tier::Cold => Tier::Warm,
        }
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        match self {
            Tier::Hot => 0,
            Tier::Warm => 1,
            Tier::Cold => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const FX_SEED: u64 = 0x517cc1b727220a95;

#[inline]
fn fx_hash_iter<'a>(bytes: impl Iterator<Item = &'a u8>) -> u64 {
    let mut hash = FX_SEED;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(FX_SEED);
    }
    hash
}

/// Fast non-cryptographic hash (FxHash algorithm)
#[inline]
pub(crate) fn fx_hash(bytes: &[u8]) -> u64 {
    fx_hash_iter(bytes.iter())
}

/// Map a hash onto `0..count`.
///
/// High bits are folded in because FxHash mixes poorly into the low bits.
#[inline]
pub(crate) fn fold_index(hash: u64, count: usize) -> usize {
    let folded = hash ^ (hash >> 32) ^ (hash >> 17);
    if count.is_power_of_two() {
        (folded as usize) & (count - 1)
    } else {
        (folded % count as u64) as usize
    }
}

/// Cache key - tenant plus object key
#[derive(Clone, Debug, Eq)]
pub struct CacheKey {
    hash: u64,
    tenant: String,
    key: String,
}

impl CacheKey {
    pub fn new(tenant: impl Into<String>, key: impl Into<String>) -> Self {
        let tenant = tenant.into();
        let key = key.into();
        let hash = Self::fx_hash(tenant.as_bytes(), key.as_bytes());
        Self { hash, tenant, key }
    }

    /// FxHash over `tenant \0 key`. The separator keeps ("ab","c") and
    /// ("a","bc") apart.
    #[inline]
    fn fx_hash(tenant: &[u8], key: &[u8]) -> u64 {
        fx_hash_iter(tenant.iter().chain(std::iter::once(&0u8)).chain(key.iter()))
    }

    /// Shard index in `0..shard_count`.
    #[inline]
    pub fn shard_index(&self, shard_count: usize) -> usize {
        fold_index(self.hash, shard_count)
    }

    #[inline]
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[inline]
    pub fn hash_value(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.tenant == other.tenant && self.key == other.key
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tenant, self.key)
    }
}

/// A cached object.
///
/// `last_access` is bumped under the shard's read lock; everything else
/// changes only under the write lock.
#[derive(Debug)]
pub struct CacheEntry {
    pub(crate) value: Bytes,
    pub(crate) tier: Tier,
    /// Access tick this entry is filed under in its tier's LRU queue.
    pub(crate) queued_tick: u64,
    last_access: AtomicU64,
    pub(crate) dirty: bool,
    pub(crate) version: u64,
    pub(crate) encoding: CompressionAlgorithm,
    raw_size: u64,
    created_at: Instant,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    pub(crate) fn new(
        value: Bytes,
        tier: Tier,
        tick: u64,
        version: u64,
        dirty: bool,
        expires_at: Option<Instant>,
    ) -> Self {
        Self::from_payload(Payload::raw(value), tier, tick, version, dirty, expires_at)
    }

    pub(crate) fn from_payload(
        payload: Payload,
        tier: Tier,
        tick: u64,
        version: u64,
        dirty: bool,
        expires_at: Option<Instant>,
    ) -> Self {
        Self {
            value: payload.data,
            tier,
            queued_tick: tick,
            last_access: AtomicU64::new(tick),
            dirty,
            version,
            encoding: payload.encoding,
            raw_size: payload.raw_len,
            created_at: Instant::now(),
            expires_at,
        }
    }

    /// Bytes held in memory, the figure tier budgets are charged.
    #[inline]
    pub fn size(&self) -> u64 {
        self.value.len() as u64
    }

    /// Length of the value as written, before compression.
    #[inline]
    pub fn raw_size(&self) -> u64 {
        self.raw_size
    }

    #[inline]
    pub fn encoding(&self) -> CompressionAlgorithm {
        self.encoding
    }

    #[inline]
    pub fn tier(&self) -> Tier {
        self.tier
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Stored bytes, compressed when [`Self::encoding`] says so.
    #[inline]
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    #[inline]
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    /// Record an access at `tick`. Ticks only move forward.
    #[inline]
    pub(crate) fn touch(&self, tick: u64) {
        self.last_access.fetch_max(tick, Ordering::Relaxed);
    }

    /// Re-file the entry at its current access tick.
    #[inline]
    pub(crate) fn requeue(&mut self) -> u64 {
        self.queued_tick = self.last_access();
        self.queued_tick
    }

    #[inline]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_tier_transitions() {
        assert_eq!(Tier::Hot.colder(), Some(Tier::Warm));
        assert_eq!(Tier::Warm.colder(), Some(Tier::Cold));
        assert_eq!(Tier::Cold.colder(), None);
        assert_eq!(Tier::Cold.warmer(), Tier::Warm);
        assert_eq!(Tier::Warm.warmer(), Tier::Hot);
        assert_eq!(Tier::Hot.warmer(), Tier::Hot);
    }

    #[test]
    fn test_cache_key_equality() {
        let a = CacheKey::new("tenant", "photos/1.jpg");
        let b = CacheKey::new("tenant", "photos/1.jpg");
        let c = CacheKey::new("other", "photos/1.jpg");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.hash_value(), b.hash_value());
    }

    #[test]
    fn test_cache_key_separator() {
        let a = CacheKey::new("ab", "c");
        let b = CacheKey::new("a", "bc");
        assert_ne!(a, b);
        assert_ne!(a.hash_value(), b.hash_value());
    }

    #[test]
    fn test_shard_index_in_range() {
        for count in [1usize, 7, 256, 1000] {
            for i in 0..500 {
                let k = CacheKey::new("t", format!("key-{}", i));
                assert!(k.shard_index(count) < count);
            }
        }
    }

    #[test]
    fn test_shard_distribution() {
        let mut counts = vec![0usize; 16];
        for i in 0..16_000 {
            let k = CacheKey::new("tenant", format!("object-{}", i));
            counts[k.shard_index(16)] += 1;
        }
        // Every shard gets a reasonable share
        assert!(counts.iter().all(|&c| c > 500), "{:?}", counts);
    }

    #[test]
    fn test_entry_touch_and_requeue() {
        let mut e = CacheEntry::new(Bytes::from_static(b"abc"), Tier::Hot, 5, 1, true, None);
        assert_eq!(e.size(), 3);
        e.touch(9);
        e.touch(7);
        assert_eq!(e.last_access(), 9);
        assert_eq!(e.queued_tick, 5);
        assert_eq!(e.requeue(), 9);
    }

    #[test]
    fn test_entry_expiry() {
        let now = Instant::now();
        let e = CacheEntry::new(Bytes::new(), Tier::Hot, 0, 1, false, Some(now));
        assert!(e.is_expired_at(now));
        let e = CacheEntry::new(
            Bytes::new(),
            Tier::Hot,
            0,
            1,
            false,
            Some(now + Duration::from_secs(60)),
        );
        assert!(!e.is_expired_at(now));
        let e = CacheEntry::new(Bytes::new(), Tier::Hot, 0, 1, false, None);
        assert!(!e.is_expired_at(now + Duration::from_secs(3600)));
    }
}
