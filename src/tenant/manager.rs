//! Tenant Quota Manager
//!
//! Tenants are spread over M shards by a hash of the tenant ID. Each shard
//! holds a map from tenant to that tenant's record; every record has its
//! own mutex, so admission for one tenant never waits on another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::usage::{TenantRecord, TenantUsage, UsageDelta};
use super::window::WindowClock;
use super::{Operation, QuotaConfig, QuotaLimits};
use crate::cache::{fold_index, fx_hash};
use crate::error::{Error, QuotaResource, Result};

#[derive(Debug, Default)]
struct QuotaCounters {
    admitted: AtomicU64,
    denied: AtomicU64,
    committed: AtomicU64,
    released: AtomicU64,
}

type Counters = Arc<CachePadded<QuotaCounters>>;

struct QuotaShard {
    tenants: RwLock<HashMap<String, Arc<Mutex<TenantRecord>>>>,
    counters: Counters,
}

impl QuotaShard {
    fn new() -> Self {
        Self {
            tenants: RwLock::new(HashMap::new()),
            counters: Arc::new(CachePadded::new(QuotaCounters::default())),
        }
    }
}

/// Admission statistics summed across shards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QuotaStats {
    pub tenants: usize,
    pub admitted: u64,
    pub denied: u64,
    pub committed: u64,
    pub released: u64,
}

/// Capacity held for an admitted operation.
///
/// Call [`Reservation::commit`] once the operation has succeeded. A
/// reservation dropped without being committed is released, which returns
/// the reserved storage and the bandwidth it consumed.
#[must_use = "dropping a reservation releases it"]
pub struct Reservation {
    tenant: String,
    record: Arc<Mutex<TenantRecord>>,
    counters: Counters,
    bytes_delta: i64,
    objects_delta: i64,
    reserved_bytes: u64,
    reserved_objects: u64,
    bandwidth: u64,
    window: u64,
    settled: bool,
}

impl Reservation {
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Storage delta applied on commit.
    pub fn bytes_delta(&self) -> i64 {
        self.bytes_delta
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.reserved_bytes
    }

    /// Make the reserved usage permanent.
    pub fn commit(mut self) {
        self.settle(true);
    }

    /// Return the reserved capacity.
    pub fn release(mut self) {
        self.settle(false);
    }

    fn settle(&mut self, commit: bool) {
        if self.settled {
            return;
        }
        self.settled = true;

        let mut record = self.record.lock();
        record.bytes_reserved = record.bytes_reserved.saturating_sub(self.reserved_bytes);
        record.objects_reserved = record.objects_reserved.saturating_sub(self.reserved_objects);
        if commit {
            record.apply(self.bytes_delta, self.objects_delta);
            self.counters.committed.fetch_add(1, Ordering::Relaxed);
        } else {
            record.bandwidth.refund(self.window, self.bandwidth);
            self.counters.released.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled {
            debug!(tenant = %self.tenant, bytes = self.reserved_bytes, "Releasing abandoned reservation");
            self.settle(false);
        }
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("tenant", &self.tenant)
            .field("bytes_delta", &self.bytes_delta)
            .field("objects_delta", &self.objects_delta)
            .field("bandwidth", &self.bandwidth)
            .field("settled", &self.settled)
            .finish()
    }
}

/// Per-tenant quota enforcement.
pub struct TenantQuotaManager {
    shards: Box<[QuotaShard]>,
    clock: WindowClock,
    default_limits: Option<QuotaLimits>,
}

impl TenantQuotaManager {
    pub fn new(config: QuotaConfig) -> Result<Self> {
        config.validate()?;
        let shards: Vec<QuotaShard> = (0..config.shard_count).map(|_| QuotaShard::new()).collect();
        let manager = Self {
            shards: shards.into_boxed_slice(),
            clock: WindowClock::new(config.interval()),
            default_limits: config.default_limits,
        };
        for (tenant, limits) in config.tenants {
            manager.register(&tenant, limits);
        }
        Ok(manager)
    }

    #[inline]
    fn shard(&self, tenant: &str) -> &QuotaShard {
        &self.shards[fold_index(fx_hash(tenant.as_bytes()), self.shards.len())]
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn lookup(&self, shard: &QuotaShard, tenant: &str) -> Option<Arc<Mutex<TenantRecord>>> {
        shard.tenants.read().get(tenant).cloned()
    }

    /// Record for `tenant`, auto-registering it when default limits exist.
    fn record_for(&self, shard: &QuotaShard, tenant: &str) -> Result<Arc<Mutex<TenantRecord>>> {
        if let Some(record) = self.lookup(shard, tenant) {
            return Ok(record);
        }
        let limits = self
            .default_limits
            .ok_or_else(|| Error::TenantNotFound(tenant.to_string()))?;
        let mut tenants = shard.tenants.write();
        let record = tenants
            .entry(tenant.to_string())
            .or_insert_with(|| {
                debug!(tenant, "Auto-registered tenant with default limits");
                Arc::new(Mutex::new(TenantRecord::new(limits)))
            })
            .clone();
        Ok(record)
    }

    /// Register a tenant. Returns `false` if it already exists.
    pub fn register(&self, tenant: &str, limits: QuotaLimits) -> bool {
        let shard = self.shard(tenant);
        let mut tenants = shard.tenants.write();
        if tenants.contains_key(tenant) {
            return false;
        }
        tenants.insert(
            tenant.to_string(),
            Arc::new(Mutex::new(TenantRecord::new(limits))),
        );
        info!(tenant, max_bytes = limits.max_bytes, "Registered tenant");
        true
    }

    /// Replace a tenant's limits. Current usage is kept even if it is now
    /// above the new limits; further writes are denied until it drops.
    pub fn set_limits(&self, tenant: &str, limits: QuotaLimits) -> Result<()> {
        let shard = self.shard(tenant);
        let record = self
            .lookup(shard, tenant)
            .ok_or_else(|| Error::TenantNotFound(tenant.to_string()))?;
        record.lock().limits = limits;
        Ok(())
    }

    /// Forget a tenant. Outstanding reservations settle against the
    /// detached record.
    pub fn remove(&self, tenant: &str) -> Option<TenantUsage> {
        let window = self.clock.current();
        let record = self.shard(tenant).tenants.write().remove(tenant)?;
        let mut record = record.lock();
        Some(record.snapshot(tenant, window))
    }

    /// Atomically check every quota dimension and reserve the operation.
    pub fn admit(&self, tenant: &str, op: Operation, size: u64) -> Result<Reservation> {
        let shard = self.shard(tenant);
        let record = self.record_for(shard, tenant)?;
        let window = self.clock.current();

        let (bytes_delta, objects_delta) = op.storage_delta(size);
        let reserved_bytes = bytes_delta.max(0) as u64;
        let reserved_objects = objects_delta.max(0) as u64;

        let mut r = record.lock();
        r.total_requests += 1;
        let limits = r.limits;

        let denied = if !r.requests.fits(window, 1, limits.max_requests) {
            Some((QuotaResource::Requests, 1, r.requests.used(window), limits.max_requests))
        } else if reserved_bytes > 0
            && (r.bytes_used + r.bytes_reserved).saturating_add(reserved_bytes) > limits.max_bytes
        {
            Some((
                QuotaResource::Storage,
                reserved_bytes,
                r.bytes_used + r.bytes_reserved,
                limits.max_bytes,
            ))
        } else if reserved_objects > 0
            && (r.objects + r.objects_reserved).saturating_add(reserved_objects) > limits.max_objects
        {
            Some((
                QuotaResource::Objects,
                reserved_objects,
                r.objects + r.objects_reserved,
                limits.max_objects,
            ))
        } else if !r.bandwidth.fits(window, size, limits.max_bandwidth) {
            Some((
                QuotaResource::Bandwidth,
                size,
                r.bandwidth.used(window),
                limits.max_bandwidth,
            ))
        } else {
            None
        };

        if let Some((resource, requested, used, limit)) = denied {
            drop(r);
            shard.counters.denied.fetch_add(1, Ordering::Relaxed);
            debug!(tenant, %resource, requested, used, limit, "Admission denied");
            return Err(Error::QuotaExceeded {
                tenant: tenant.to_string(),
                resource,
                requested,
                used,
                limit,
            });
        }

        r.bytes_reserved += reserved_bytes;
        r.objects_reserved += reserved_objects;
        r.bandwidth.consume(window, size);
        r.requests.consume(window, 1);
        drop(r);

        shard.counters.admitted.fetch_add(1, Ordering::Relaxed);
        Ok(Reservation {
            tenant: tenant.to_string(),
            record,
            counters: shard.counters.clone(),
            bytes_delta,
            objects_delta,
            reserved_bytes,
            reserved_objects,
            bandwidth: size,
            window,
            settled: false,
        })
    }

    /// Finalise a reservation after the operation succeeded.
    pub fn commit(&self, reservation: Reservation) {
        reservation.commit();
    }

    /// Compensate a reservation whose operation failed.
    pub fn release(&self, reservation: Reservation) {
        reservation.release();
    }

    /// Apply an adjustment that bypasses admission, such as freeing a
    /// deleted object's bytes or charging read bandwidth after the fact.
    pub fn record(&self, tenant: &str, delta: UsageDelta) -> Result<()> {
        let shard = self.shard(tenant);
        let record = self.record_for(shard, tenant)?;
        let window = self.clock.current();
        let mut r = record.lock();
        r.apply(delta.bytes, delta.objects);
        if delta.bandwidth > 0 {
            r.bandwidth.consume(window, delta.bandwidth);
        }
        Ok(())
    }

    /// Apply many adjustments. Unknown tenants are skipped and logged.
    /// Returns how many were applied.
    pub fn record_batch<'a, I>(&self, updates: I) -> usize
    where
        I: IntoIterator<Item = (&'a str, UsageDelta)>,
    {
        let mut applied = 0;
        for (tenant, delta) in updates {
            match self.record(tenant, delta) {
                Ok(()) => applied += 1,
                Err(e) => warn!(tenant, error = %e, "Skipped usage update"),
            }
        }
        applied
    }

    /// Current usage. Unknown tenants report zero usage under the default
    /// limits when those exist.
    pub fn usage(&self, tenant: &str) -> Result<TenantUsage> {
        let window = self.clock.current();
        match self.lookup(self.shard(tenant), tenant) {
            Some(record) => {
                let usage = record.lock().snapshot(tenant, window);
                Ok(usage)
            }
            None => {
                let limits = self
                    .default_limits
                    .ok_or_else(|| Error::TenantNotFound(tenant.to_string()))?;
                Ok(TenantRecord::new(limits).snapshot(tenant, window))
            }
        }
    }

    pub fn limits(&self, tenant: &str) -> Option<QuotaLimits> {
        self.lookup(self.shard(tenant), tenant)
            .map(|r| r.lock().limits)
    }

    pub fn tenants(&self) -> Vec<String> {
        let mut all: Vec<String> = self
            .shards
            .iter()
            .flat_map(|s| s.tenants.read().keys().cloned().collect::<Vec<_>>())
            .collect();
        all.sort();
        all
    }

    pub fn stats(&self) -> QuotaStats {
        let mut stats = QuotaStats::default();
        for shard in self.shards.iter() {
            stats.tenants += shard.tenants.read().len();
            stats.admitted += shard.counters.admitted.load(Ordering::Relaxed);
            stats.denied += shard.counters.denied.load(Ordering::Relaxed);
            stats.committed += shard.counters.committed.load(Ordering::Relaxed);
            stats.released += shard.counters.released.load(Ordering::Relaxed);
        }
        stats
    }
}

impl std::fmt::Debug for TenantQuotaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantQuotaManager")
            .field("shards", &self.shards.len())
            .field("interval", &self.clock.interval())
            .field("default_limits", &self.default_limits)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn manager() -> TenantQuotaManager {
        TenantQuotaManager::new(QuotaConfig {
            default_limits: None,
            ..QuotaConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_admit_then_deny_over_quota() {
        let m = manager();
        m.register("t1", QuotaLimits::unlimited().with_max_bytes(1000));

        let r = m.admit("t1", Operation::Write, 600).unwrap();
        m.commit(r);

        let err = m.admit("t1", Operation::Write, 600).unwrap_err();
        assert_matches!(
            err,
            Error::QuotaExceeded {
                resource: QuotaResource::Storage,
                requested: 600,
                used: 600,
                limit: 1000,
                ..
            }
        );
        assert_eq!(m.usage("t1").unwrap().bytes_used, 600);
    }

    #[test]
    fn test_reservation_counts_against_concurrent_admission() {
        let m = manager();
        m.register("t1", QuotaLimits::unlimited().with_max_bytes(1000));
        let first = m.admit("t1", Operation::Write, 600).unwrap();
        assert!(m.admit("t1", Operation::Write, 600).is_err());
        m.release(first);
        assert!(m.admit("t1", Operation::Write, 600).is_ok());
    }

    #[test]
    fn test_dropped_reservation_is_released() {
        let m = manager();
        m.register("t1", QuotaLimits::unlimited().with_max_bytes(100));
        {
            let _r = m.admit("t1", Operation::Write, 100).unwrap();
            assert_eq!(m.usage("t1").unwrap().bytes_reserved, 100);
        }
        let usage = m.usage("t1").unwrap();
        assert_eq!(usage.bytes_reserved, 0);
        assert_eq!(usage.bytes_used, 0);
        assert_eq!(m.stats().released, 1);
    }

    #[test]
    fn test_unknown_tenant_without_defaults() {
        let m = manager();
        assert_matches!(
            m.admit("ghost", Operation::Read, 0),
            Err(Error::TenantNotFound(_))
        );
        assert!(m.usage("ghost").is_err());
    }

    #[test]
    fn test_unknown_tenant_with_defaults_is_registered() {
        let m = TenantQuotaManager::new(QuotaConfig {
            default_limits: Some(QuotaLimits::unlimited().with_max_bytes(10)),
            ..QuotaConfig::default()
        })
        .unwrap();
        m.admit("new", Operation::Write, 5).unwrap().commit();
        assert_eq!(m.tenants(), vec!["new".to_string()]);
        assert_eq!(m.limits("new").unwrap().max_bytes, 10);
    }

    #[test]
    fn test_object_limit() {
        let m = manager();
        m.register("t", QuotaLimits::unlimited().with_max_objects(1));
        m.admit("t", Operation::Write, 1).unwrap().commit();
        assert_matches!(
            m.admit("t", Operation::Write, 1),
            Err(Error::QuotaExceeded {
                resource: QuotaResource::Objects,
                ..
            })
        );
        // Overwrites do not add objects
        m.admit("t", Operation::Overwrite { previous_size: 1 }, 1)
            .unwrap()
            .commit();
    }

    #[test]
    fn test_overwrite_shrinks_usage() {
        let m = manager();
        m.register("t", QuotaLimits::unlimited().with_max_bytes(100));
        m.admit("t", Operation::Write, 80).unwrap().commit();
        let r = m
            .admit("t", Operation::Overwrite { previous_size: 80 }, 30)
            .unwrap();
        assert_eq!(r.reserved_bytes(), 0);
        r.commit();
        let usage = m.usage("t").unwrap();
        assert_eq!(usage.bytes_used, 30);
        assert_eq!(usage.objects, 1);
    }

    #[test]
    fn test_delete_never_goes_negative() {
        let m = manager();
        m.register("t", QuotaLimits::unlimited());
        m.admit("t", Operation::Write, 10).unwrap().commit();
        m.record("t", UsageDelta::delete(50)).unwrap();
        let usage = m.usage("t").unwrap();
        assert_eq!(usage.bytes_used, 0);
        assert_eq!(usage.objects, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bandwidth_window_resets() {
        let m = TenantQuotaManager::new(QuotaConfig {
            default_limits: None,
            bandwidth_interval_ms: 1000,
            ..QuotaConfig::default()
        })
        .unwrap();
        m.register("t", QuotaLimits::unlimited().with_max_bandwidth(100));

        m.admit("t", Operation::Read, 60).unwrap().commit();
        assert_matches!(
            m.admit("t", Operation::Read, 60),
            Err(Error::QuotaExceeded {
                resource: QuotaResource::Bandwidth,
                ..
            })
        );

        tokio::time::advance(Duration::from_millis(1001)).await;
        m.admit("t", Operation::Read, 60).unwrap().commit();
    }

    #[test]
    fn test_released_write_refunds_bandwidth() {
        let m = manager();
        m.register("t", QuotaLimits::unlimited().with_max_bandwidth(100));
        let r = m.admit("t", Operation::Write, 100).unwrap();
        m.release(r);
        assert!(m.admit("t", Operation::Write, 100).is_ok());
    }

    #[test]
    fn test_request_rate_limit() {
        let m = manager();
        m.register("t", QuotaLimits::unlimited().with_max_requests(2));
        m.admit("t", Operation::Read, 0).unwrap().commit();
        m.admit("t", Operation::Read, 0).unwrap().commit();
        assert_matches!(
            m.admit("t", Operation::Read, 0),
            Err(Error::QuotaExceeded {
                resource: QuotaResource::Requests,
                ..
            })
        );
        assert_eq!(m.usage("t").unwrap().total_requests, 3);
    }

    #[test]
    fn test_register_set_limits_remove() {
        let m = manager();
        assert!(m.register("t", QuotaLimits::unlimited()));
        assert!(!m.register("t", QuotaLimits::unlimited()));
        m.set_limits("t", QuotaLimits::unlimited().with_max_bytes(5))
            .unwrap();
        assert_eq!(m.limits("t").unwrap().max_bytes, 5);
        assert!(m.set_limits("x", QuotaLimits::unlimited()).is_err());
        assert!(m.remove("t").is_some());
        assert!(m.remove("t").is_none());
    }

    #[test]
    fn test_record_batch_skips_unknown() {
        let m = manager();
        m.register("a", QuotaLimits::unlimited());
        m.register("b", QuotaLimits::unlimited());
        let applied = m.record_batch(vec![
            ("a", UsageDelta::bandwidth(10)),
            ("zzz", UsageDelta::bandwidth(10)),
            ("b", UsageDelta::bandwidth(5)),
        ]);
        assert_eq!(applied, 2);
        assert_eq!(m.usage("a").unwrap().bandwidth_used, 10);
    }

    #[test]
    fn test_concurrent_admission_never_exceeds_limit() {
        let m = Arc::new(manager());
        m.register("t", QuotaLimits::unlimited().with_max_bytes(10_000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || {
                    let mut admitted = 0u64;
                    for _ in 0..200 {
                        if let Ok(r) = m.admit("t", Operation::Write, 37) {
                            let usage = m.usage("t").unwrap();
                            assert!(usage.bytes_used + usage.bytes_reserved <= 10_000);
                            r.commit();
                            admitted += 1;
                        }
                    }
                    admitted
                })
            })
            .collect();
        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        let usage = m.usage("t").unwrap();
        assert_eq!(usage.bytes_used, total * 37);
        assert!(usage.bytes_used <= 10_000);
        assert_eq!(total, 10_000 / 37);
    }
}
