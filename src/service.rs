//! Object Service
//!
//! Runs the read and write control flows across the cache, the quota
//! manager, the worker pool and the replication engine.
//!
//! # Write Flow
//!
//! ```text
//! lock key ──► admit ──► cache.put (dirty) ──► persist ──► mark_clean ──► enqueue ──► commit
//!                │             │                   │
//!                │             └──── rollback ◄────┤ error, timeout, cancel or newer version
//!                └──────────────── release ◄───────┘
//! ```
//!
//! Writes, deletes and inbound replicas of one object hold a striped key
//! lock from the previous-size lookup until the quota is settled.
//!
//! # Read Flow
//!
//! ```text
//! cache.get ──hit──► admit(read, size)
//!     │
//!    miss ──► admit(read) ──► store.get ──► populate ──► charge bandwidth
//! ```
//!
//! Backing-store calls run on the worker pool and are awaited under the
//! caller's [`OpContext`]. Dropping the awaiting future cancels the pooled
//! call, rolls back the dirty cache entry and releases the reservation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::{fold_index, CacheKey, Evicted, Lookup, RemoteApply, ShardedCache, Tier};
use crate::config::CoreConfig;
use crate::domain::ports::{BackingStore, Change, MetricsSink, ObjectMeta, PeerTransport};
use crate::error::{Error, Result};
use crate::monitoring::{HealthCheckResult, HealthReport, Readiness};
use crate::replication::{AbandonedTask, ReplicationEngine, TaskId};
use crate::tenant::{Operation, TenantQuotaManager, TenantUsage, UsageDelta};
use crate::workers::{ShutdownReport, WorkerPool};

/// Queue fill ratio above which the pool reports degraded.
const QUEUE_DEGRADED_RATIO: f64 = 0.9;

/// Service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Address the HTTP server binds to
    pub listen_addr: String,
    /// Upper bound on a backing-store write or delete
    pub persist_timeout_ms: u64,
    /// Upper bound on a backing-store read, head or list
    pub read_timeout_ms: u64,
    /// Deadline given to requests that carry none
    pub request_timeout_ms: u64,
    /// How long shutdown waits for queued work
    pub drain_timeout_ms: u64,
    /// Interval between metric gauge reports and TTL sweeps (0 disables)
    pub maintenance_interval_ms: u64,
    /// Prefix for exported metric names
    pub metrics_namespace: String,
    /// Locks serialising writes to the same object, keys hashed onto them
    pub key_lock_stripes: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9100".to_string(),
            persist_timeout_ms: 5_000,
            read_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
            drain_timeout_ms: 10_000,
            maintenance_interval_ms: 15_000,
            metrics_namespace: "couchestor".to_string(),
            key_lock_stripes: 4096,
        }
    }
}

impl ServiceConfig {
    pub fn with_persist_timeout(mut self, timeout: Duration) -> Self {
        self.persist_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn maintenance_interval(&self) -> Option<Duration> {
        (self.maintenance_interval_ms > 0).then(|| Duration::from_millis(self.maintenance_interval_ms))
    }

    pub fn validate(&self) -> Result<()> {
        if self.persist_timeout_ms == 0 || self.read_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(Error::Config("service timeouts must be non-zero".into()));
        }
        if self.key_lock_stripes == 0 {
            return Err(Error::Config("service.key_lock_stripes must be at least 1".into()));
        }
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(Error::Config(format!(
                "service.listen_addr '{}' is not a socket address",
                self.listen_addr
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Operation Context
// =============================================================================

/// Deadline and cancellation carried by every service call.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl OpContext {
    /// No deadline, never cancelled unless [`OpContext::cancel`] is called.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Share cancellation with an outer token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Time left before the deadline. `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail if the context is already cancelled or past its deadline.
    pub fn check(&self, op: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled(op.to_string()));
        }
        match self.remaining() {
            Some(left) if left.is_zero() => Err(Error::timeout(op, Duration::ZERO)),
            _ => Ok(()),
        }
    }

    /// Await `fut` for at most `bound` or the time left, whichever is
    /// shorter. Cancellation wins over completion.
    pub async fn run<T, F>(&self, op: &str, bound: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check(op)?;
        let limit = self.remaining().map_or(bound, |left| left.min(bound));
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled(op.to_string())),
            res = tokio::time::timeout(limit, fut) => match res {
                Ok(res) => res,
                Err(_) => Err(Error::timeout(op, limit)),
            },
        }
    }
}

// =============================================================================
// Results
// =============================================================================

/// Where a read was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadSource {
    Cache(Tier),
    Backend,
}

impl ReadSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadSource::Cache(tier) => tier.as_str(),
            ReadSource::Backend => "backend",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRead {
    pub value: Bytes,
    pub version: u64,
    pub source: ReadSource,
}

/// Acknowledgement of a durable write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PutReceipt {
    pub version: u64,
    pub size: u64,
    /// Replication task, if one was scheduled.
    pub replication: Option<TaskId>,
    /// Cache entries evicted to make room.
    pub evicted: usize,
}

/// Outcome of [`ObjectService::shutdown`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceShutdown {
    pub pool: ShutdownReport,
    /// Replication tasks that never reached every peer
    pub abandoned: Vec<AbandonedTask>,
}

/// Striped locks held across the head, admit and persist steps of a write
/// so two writers of one object never both charge against the same
/// previous size.
struct KeyLocks {
    stripes: Box<[Mutex<()>]>,
}

impl KeyLocks {
    fn new(count: usize) -> Self {
        Self {
            stripes: (0..count).map(|_| Mutex::new(())).collect(),
        }
    }

    async fn acquire(
        &self,
        ctx: &OpContext,
        bound: Duration,
        tenant: &str,
        key: &str,
    ) -> Result<MutexGuard<'_, ()>> {
        let index = fold_index(CacheKey::new(tenant, key).hash_value(), self.stripes.len());
        let stripe = &self.stripes[index];
        ctx.run("lock", bound, async { Ok(stripe.lock().await) }).await
    }
}

/// Removes a dirty cache entry unless the write it belongs to completes.
struct RollbackGuard<'a> {
    cache: &'a ShardedCache,
    tenant: &'a str,
    key: &'a str,
    version: u64,
    armed: bool,
}

impl<'a> RollbackGuard<'a> {
    fn new(cache: &'a ShardedCache, tenant: &'a str, key: &'a str, version: u64) -> Self {
        Self {
            cache,
            tenant,
            key,
            version,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RollbackGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.rollback(self.tenant, self.key, self.version);
        }
    }
}

// =============================================================================
// Service
// =============================================================================

/// Entry point for object operations.
pub struct ObjectService {
    config: ServiceConfig,
    cache: Arc<ShardedCache>,
    quotas: Arc<TenantQuotaManager>,
    pool: WorkerPool,
    replication: ReplicationEngine,
    store: Arc<dyn BackingStore>,
    metrics: Arc<dyn MetricsSink>,
    readiness: Readiness,
    locks: KeyLocks,
}

impl ObjectService {
    /// Build every component from configuration.
    ///
    /// Must be called inside a tokio runtime unless the pool is manual.
    pub fn new(
        config: CoreConfig,
        store: Arc<dyn BackingStore>,
        transport: Arc<dyn PeerTransport>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(ShardedCache::new(config.cache)?);
        let quotas = Arc::new(TenantQuotaManager::new(config.quota)?);
        let pool = WorkerPool::new(config.workers)?;
        let replication =
            ReplicationEngine::new(config.replication, pool.clone(), transport, metrics.clone())?;

        info!(
            shards = cache.shard_count(),
            workers = pool.worker_count(),
            peers = replication.peers().len(),
            "Object service initialized"
        );

        Ok(Self {
            locks: KeyLocks::new(config.service.key_lock_stripes),
            config: config.service,
            cache,
            quotas,
            pool,
            replication,
            store,
            metrics,
            readiness: Readiness::new(),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn cache(&self) -> &ShardedCache {
        &self.cache
    }

    pub fn quotas(&self) -> &TenantQuotaManager {
        &self.quotas
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn replication(&self) -> &ReplicationEngine {
        &self.replication
    }

    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    /// Context with the configured request timeout.
    pub fn context(&self) -> OpContext {
        OpContext::with_timeout(self.config.request_timeout())
    }

    /// Run a backing-store call on the worker pool under `ctx`.
    async fn io<T, F>(&self, ctx: &OpContext, op: &str, bound: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        ctx.check(op)?;
        let handle = self.pool.submit(fut)?;
        ctx.run(op, bound, async move { handle.await? }).await
    }

    async fn head(&self, ctx: &OpContext, tenant: &str, key: &str) -> Result<Option<ObjectMeta>> {
        let store = self.store.clone();
        let (t, k) = (tenant.to_string(), key.to_string());
        self.io(ctx, "head", self.config.read_timeout(), async move {
            store.head(&t, &k).await
        })
        .await
    }

    fn observe<T>(&self, op: &str, started: Instant, result: &Result<T>) {
        let outcome = match result {
            Ok(_) => "ok",
            Err(e) => e.kind().as_str(),
        };
        self.metrics
            .counter("requests_total", &[("op", op), ("outcome", outcome)], 1);
        self.metrics.histogram(
            "request_duration_seconds",
            &[("op", op)],
            started.elapsed().as_secs_f64(),
        );
    }

    fn log_evictions(&self, evicted: &[Evicted]) {
        for entry in evicted {
            if entry.dirty {
                warn!(
                    tenant = %entry.tenant,
                    key = %entry.key,
                    version = entry.version,
                    "Evicted cache entry before it was persisted"
                );
            }
        }
    }

    fn replicate(&self, tenant: &str, key: &str, change: Change) -> Option<TaskId> {
        match self.replication.enqueue(tenant, key, change) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(tenant, key, error = %e, "Replication not scheduled");
                self.metrics.counter(
                    "replication_rejected_total",
                    &[("reason", e.kind().as_str())],
                    1,
                );
                None
            }
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Store an object. Returns once it is durable in the backing store;
    /// replication continues in the background.
    #[instrument(skip(self, ctx, value), fields(size = value.len()))]
    pub async fn put(
        &self,
        ctx: &OpContext,
        tenant: &str,
        key: &str,
        value: Bytes,
    ) -> Result<PutReceipt> {
        let started = Instant::now();
        let result = self.put_inner(ctx, tenant, key, value).await;
        self.observe("put", started, &result);
        result
    }

    async fn put_inner(
        &self,
        ctx: &OpContext,
        tenant: &str,
        key: &str,
        value: Bytes,
    ) -> Result<PutReceipt> {
        ctx.check("put")?;
        let size = value.len() as u64;
        let limit = self.cache.max_entry_size();
        if size > limit {
            return Err(Error::EntryTooLarge { size, limit });
        }

        let _lock = self
            .locks
            .acquire(ctx, self.config.persist_timeout(), tenant, key)
            .await?;
        let op = match self.head(ctx, tenant, key).await? {
            Some(previous) => Operation::Overwrite {
                previous_size: previous.size,
            },
            None => Operation::Write,
        };
        let reservation = self.quotas.admit(tenant, op, size)?;

        let outcome = self.cache.put(tenant, key, value.clone())?;
        self.log_evictions(&outcome.evicted);
        let version = outcome.version;
        let guard = RollbackGuard::new(&self.cache, tenant, key, version);

        let store = self.store.clone();
        let (t, k, v) = (tenant.to_string(), key.to_string(), value.clone());
        let stored = self
            .io(ctx, "persist", self.config.persist_timeout(), async move {
                store.put(&t, &k, v, version).await
            })
            .await?;
        if stored.version != version {
            // A newer replica reached the store first
            debug!(tenant, key, version, current = stored.version, "Local write lost to newer version");
            return Err(Error::Conflict {
                key: format!("{}/{}", tenant, key),
                attempted: version,
                current: stored.version,
            });
        }

        guard.disarm();
        self.cache.mark_clean(tenant, key, version);
        let replication = self.replicate(tenant, key, Change::Put { value, version });
        reservation.commit();

        debug!(tenant, key, version, size, "Object stored");
        Ok(PutReceipt {
            version,
            size,
            replication,
            evicted: outcome.evicted.len(),
        })
    }

    /// Read an object, falling back to the backing store on a cache miss.
    #[instrument(skip(self, ctx))]
    pub async fn get(&self, ctx: &OpContext, tenant: &str, key: &str) -> Result<Option<ObjectRead>> {
        let started = Instant::now();
        let result = self.get_inner(ctx, tenant, key).await;
        self.observe("get", started, &result);
        result
    }

    async fn get_inner(
        &self,
        ctx: &OpContext,
        tenant: &str,
        key: &str,
    ) -> Result<Option<ObjectRead>> {
        ctx.check("get")?;

        match self.cache.get(tenant, key) {
            Lookup::Hit {
                value,
                tier,
                version,
            } => {
                // Size is known up front, so bandwidth is checked at admission
                self.quotas
                    .admit(tenant, Operation::Read, value.len() as u64)?
                    .commit();
                Ok(Some(ObjectRead {
                    value,
                    version,
                    source: ReadSource::Cache(tier),
                }))
            }
            Lookup::Miss => {
                let reservation = self.quotas.admit(tenant, Operation::Read, 0)?;
                let store = self.store.clone();
                let (t, k) = (tenant.to_string(), key.to_string());
                let fetched = self
                    .io(ctx, "fetch", self.config.read_timeout(), async move {
                        store.get(&t, &k).await
                    })
                    .await?;
                reservation.commit();
                let Some((value, meta)) = fetched else {
                    return Ok(None);
                };
                match self.cache.populate(tenant, key, value.clone(), meta.version) {
                    Ok(filled) => debug!(tenant, key, filled, "Cache miss served from backing store"),
                    Err(e) => debug!(tenant, key, error = %e, "Served uncached"),
                }
                self.quotas
                    .record(tenant, UsageDelta::bandwidth(value.len() as u64))?;
                Ok(Some(ObjectRead {
                    value,
                    version: meta.version,
                    source: ReadSource::Backend,
                }))
            }
        }
    }

    /// Delete an object. Returns whether it existed in the backing store.
    #[instrument(skip(self, ctx))]
    pub async fn delete(&self, ctx: &OpContext, tenant: &str, key: &str) -> Result<bool> {
        let started = Instant::now();
        let result = self.delete_inner(ctx, tenant, key).await;
        self.observe("delete", started, &result);
        result
    }

    async fn delete_inner(&self, ctx: &OpContext, tenant: &str, key: &str) -> Result<bool> {
        ctx.check("delete")?;
        let reservation = self.quotas.admit(tenant, Operation::Read, 0)?;
        let _lock = self
            .locks
            .acquire(ctx, self.config.persist_timeout(), tenant, key)
            .await?;
        let previous = self.head(ctx, tenant, key).await?;

        let (_, version) = self.cache.delete_versioned(tenant, key);
        let store = self.store.clone();
        let (t, k) = (tenant.to_string(), key.to_string());
        let existed = self
            .io(ctx, "delete", self.config.persist_timeout(), async move {
                store.delete(&t, &k).await
            })
            .await?;
        reservation.commit();

        if existed {
            let size = previous.map_or(0, |m| m.size);
            self.quotas.record(tenant, UsageDelta::delete(size))?;
            self.replicate(tenant, key, Change::Delete { version });
            debug!(tenant, key, version, "Object deleted");
        }
        Ok(existed)
    }

    /// List a tenant's objects by key prefix.
    pub async fn list(&self, ctx: &OpContext, tenant: &str, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let started = Instant::now();
        let result = self.list_inner(ctx, tenant, prefix).await;
        self.observe("list", started, &result);
        result
    }

    async fn list_inner(&self, ctx: &OpContext, tenant: &str, prefix: &str) -> Result<Vec<ObjectMeta>> {
        ctx.check("list")?;
        self.quotas.admit(tenant, Operation::Read, 0)?.commit();
        let store = self.store.clone();
        let (t, p) = (tenant.to_string(), prefix.to_string());
        self.io(ctx, "list", self.config.read_timeout(), async move {
            store.list(&t, &p).await
        })
        .await
    }

    pub fn usage(&self, tenant: &str) -> Result<TenantUsage> {
        self.quotas.usage(tenant)
    }

    /// Apply a change received from a peer.
    ///
    /// Replicated changes bypass admission but still update the tenant's
    /// usage. They are never replicated onward.
    #[instrument(skip(self, ctx, change), fields(version = change.version()))]
    pub async fn apply_replica(
        &self,
        ctx: &OpContext,
        tenant: &str,
        key: &str,
        change: Change,
    ) -> Result<RemoteApply> {
        let started = Instant::now();
        let result = self.apply_replica_inner(ctx, tenant, key, change).await;
        self.observe("replica", started, &result);
        result
    }

    async fn apply_replica_inner(
        &self,
        ctx: &OpContext,
        tenant: &str,
        key: &str,
        change: Change,
    ) -> Result<RemoteApply> {
        ctx.check("replica")?;
        let _lock = self
            .locks
            .acquire(ctx, self.config.persist_timeout(), tenant, key)
            .await?;
        let oversized = change.payload_len() > self.cache.max_entry_size();
        let applied = if oversized {
            RemoteApply::Applied
        } else {
            self.cache.apply_remote(tenant, key, change.clone())?
        };
        if let RemoteApply::Stale { current } = applied {
            debug!(tenant, key, current, "Ignored stale replica");
            return Ok(applied);
        }

        let previous = self.head(ctx, tenant, key).await?;
        let store = self.store.clone();
        let (t, k) = (tenant.to_string(), key.to_string());
        match change {
            Change::Put { value, version } => {
                let guard = (!oversized).then(|| RollbackGuard::new(&self.cache, tenant, key, version));
                let size = value.len() as u64;
                let stored = self
                    .io(ctx, "persist", self.config.persist_timeout(), async move {
                        store.put(&t, &k, value, version).await
                    })
                    .await?;
                if let Some(guard) = guard {
                    guard.disarm();
                    self.cache.mark_clean(tenant, key, version);
                }
                if stored.version != version {
                    return Ok(RemoteApply::Stale {
                        current: stored.version,
                    });
                }
                let delta = match previous {
                    Some(meta) => UsageDelta {
                        bytes: size as i64 - meta.size as i64,
                        objects: 0,
                        bandwidth: size,
                    },
                    None => UsageDelta {
                        bytes: size as i64,
                        objects: 1,
                        bandwidth: size,
                    },
                };
                self.quotas.record(tenant, delta)?;
            }
            Change::Delete { .. } => {
                let existed = self
                    .io(ctx, "delete", self.config.persist_timeout(), async move {
                        store.delete(&t, &k).await
                    })
                    .await?;
                if existed {
                    let size = previous.map_or(0, |m| m.size);
                    self.quotas.record(tenant, UsageDelta::delete(size))?;
                }
            }
        }
        Ok(RemoteApply::Applied)
    }

    // =========================================================================
    // Health and Metrics
    // =========================================================================

    /// Aggregate health of the backing store, worker pool and replication.
    pub async fn health(&self) -> HealthReport {
        let started = Instant::now();
        let store = self.store.clone();
        let store_check = match tokio::time::timeout(self.config.read_timeout(), store.health_check()).await {
            Ok(Ok(true)) => HealthCheckResult::healthy("backing_store"),
            Ok(Ok(false)) => HealthCheckResult::unhealthy("backing_store", "backend reports unhealthy"),
            Ok(Err(e)) => HealthCheckResult::unhealthy("backing_store", e.to_string()),
            Err(_) => HealthCheckResult::unhealthy("backing_store", "health check timed out"),
        }
        .with_duration(started.elapsed());

        HealthReport::new(
            vec![store_check, self.pool_health(), self.replication.health()],
            self.readiness.uptime(),
        )
    }

    fn pool_health(&self) -> HealthCheckResult {
        let stats = self.pool.stats();
        if self.pool.is_shutting_down() {
            return HealthCheckResult::unhealthy("worker_pool", "shutting down");
        }
        let fill = stats.queue_depth as f64 / stats.queue_capacity.max(1) as f64;
        if fill >= QUEUE_DEGRADED_RATIO {
            HealthCheckResult::degraded(
                "worker_pool",
                format!("queue {}/{} full", stats.queue_depth, stats.queue_capacity),
            )
        } else {
            HealthCheckResult::healthy("worker_pool")
        }
    }

    /// Push point-in-time gauges for every component to the metrics sink.
    pub fn report_metrics(&self) {
        let m = &self.metrics;

        let cache = self.cache.stats();
        for tier in Tier::ALL {
            let stats = cache.totals.tier(tier);
            let labels = [("tier", tier.as_str())];
            m.gauge("cache_items", &labels, stats.items as f64);
            m.gauge("cache_bytes", &labels, stats.bytes as f64);
            m.gauge("cache_hits", &labels, stats.hits as f64);
        }
        m.gauge("cache_misses", &[], cache.totals.misses as f64);
        m.gauge("cache_evictions", &[], cache.totals.evictions as f64);
        m.gauge("cache_hit_ratio", &[], cache.hit_ratio());
        let compression = self.cache.compression_stats();
        m.gauge("cache_compressed_values", &[], compression.compressed as f64);
        m.gauge("cache_compression_ratio", &[], compression.ratio());

        let quota = self.quotas.stats();
        m.gauge("quota_tenants", &[], quota.tenants as f64);
        m.gauge("quota_denied", &[], quota.denied as f64);

        let pool = self.pool.stats();
        m.gauge("pool_workers", &[], pool.workers as f64);
        m.gauge("pool_busy", &[], pool.busy as f64);
        m.gauge("pool_queue_depth", &[], pool.queue_depth as f64);
        m.gauge("pool_utilization", &[], pool.utilization());

        let replication = self.replication.status();
        m.gauge("replication_in_flight", &[], replication.in_flight as f64);
        m.gauge("replication_lag_millis", &[], replication.lag_millis as f64);
        m.gauge("replication_error_rate", &[], replication.error_rate);
    }

    /// Drop expired cache entries and refresh gauges.
    pub fn maintain(&self) -> usize {
        let purged = self.cache.purge_expired();
        if purged > 0 {
            debug!(purged, "Purged expired cache entries");
        }
        self.report_metrics();
        purged
    }

    /// Stop accepting work, stop replication retries and drain the pool.
    pub async fn shutdown(&self) -> ServiceShutdown {
        self.readiness.set_ready(false);
        self.replication.shutdown();
        let pool = self.pool.shutdown(self.config.drain_timeout()).await;
        // Attempts the pool dropped or cancelled never settle on their own
        self.replication.abandon_outstanding();
        let abandoned = self.replication.drain_abandoned();
        if !abandoned.is_empty() {
            warn!(count = abandoned.len(), "Replication tasks abandoned before shutdown");
        }
        info!(
            completed = pool.completed,
            dropped = pool.dropped,
            drained = pool.drained,
            "Object service stopped"
        );
        ServiceShutdown { pool, abandoned }
    }
}

impl std::fmt::Debug for ObjectService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectService")
            .field("cache", &self.cache)
            .field("quotas", &self.quotas)
            .field("pool", &self.pool)
            .field("replication", &self.replication)
            .finish()
    }
}
