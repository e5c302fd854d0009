//! Replication Engine
//!
//! Ships committed changes to peer nodes without ever blocking the local
//! write path. Every attempt runs as a worker-pool task; retries wait out an
//! exponential backoff on a timer and then re-enter the pool.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::circuit::{BreakerState, CircuitBreaker};
use super::task::{AbandonedTask, ReplicationTask, TaskId, TaskState, TaskStatus};
use super::ReplicationConfig;
use crate::domain::ports::{Change, MetricsSink, PeerId, PeerTransport, ReplicationMessage};
use crate::error::{Error, Result};
use crate::monitoring::HealthCheckResult;
use crate::workers::WorkerPool;

/// Reason recorded on tasks cut short by shutdown
pub const SHUTDOWN_REASON: &str = "shutdown";

/// Per-peer view in [`ReplicationStatus`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerStatus {
    pub id: String,
    pub breaker: BreakerState,
    pub trips: u64,
}

/// Engine-wide replication status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicationStatus {
    /// Tasks accepted but not yet completed or abandoned
    pub in_flight: usize,
    /// Largest time since local commit among in-flight tasks
    pub lag_millis: u64,
    /// Failed sends over all sends
    pub error_rate: f64,
    pub enqueued: u64,
    pub completed: u64,
    pub abandoned: u64,
    pub rejected: u64,
    pub peers: Vec<PeerStatus>,
}

#[derive(Debug, Default)]
struct EngineCounters {
    enqueued: AtomicU64,
    completed: AtomicU64,
    abandoned: AtomicU64,
    rejected: AtomicU64,
    sends: AtomicU64,
    failed_sends: AtomicU64,
}

struct Peer {
    id: PeerId,
    breaker: CircuitBreaker,
}

struct EngineInner {
    config: ReplicationConfig,
    backoff: Backoff,
    pool: WorkerPool,
    transport: Arc<dyn PeerTransport>,
    metrics: Arc<dyn MetricsSink>,
    peers: RwLock<Vec<Arc<Peer>>>,
    tasks: DashMap<TaskId, ReplicationTask>,
    /// Finished task ids, oldest first, bounded by `config.history`
    finished: Mutex<VecDeque<TaskId>>,
    abandoned: Mutex<Vec<AbandonedTask>>,
    acks: DashMap<(String, String), Duration>,
    /// Keys in `acks`, oldest first, bounded by `config.ack_history`
    ack_order: Mutex<VecDeque<(String, String)>>,
    in_flight: AtomicUsize,
    counters: EngineCounters,
    shutdown: CancellationToken,
}

impl EngineInner {
    fn peer(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.peers.read().iter().find(|p| &p.id == id).cloned()
    }

    async fn send_one(&self, target: &PeerId, message: &ReplicationMessage) -> Result<()> {
        let Some(peer) = self.peer(target) else {
            debug!(peer = %target, "Peer removed, dropping it from the task");
            return Ok(());
        };

        self.counters.sends.fetch_add(1, Ordering::Relaxed);
        if !peer.breaker.allow() {
            self.counters.failed_sends.fetch_add(1, Ordering::Relaxed);
            self.metrics.counter(
                "replication_sends_total",
                &[("peer", target.as_str()), ("outcome", "circuit_open")],
                1,
            );
            return Err(Error::CircuitOpen(target.to_string()));
        }

        let timeout = self.config.request_timeout();
        let result = match tokio::time::timeout(timeout, self.transport.send(target, message)).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!("replicate to {}", target), timeout)),
        };

        match &result {
            Ok(()) => {
                peer.breaker.record_success();
                self.metrics.counter(
                    "replication_sends_total",
                    &[("peer", target.as_str()), ("outcome", "ok")],
                    1,
                );
            }
            Err(e) => {
                self.counters.failed_sends.fetch_add(1, Ordering::Relaxed);
                self.metrics.counter(
                    "replication_sends_total",
                    &[("peer", target.as_str()), ("outcome", "error")],
                    1,
                );
                if peer.breaker.record_failure() {
                    warn!(peer = %target, error = %e, "Circuit opened for replication peer");
                }
            }
        }
        result
    }

    /// Settle one attempt: complete, abandon, or schedule the next try.
    fn finish_attempt(
        self: &Arc<Self>,
        id: TaskId,
        attempt: u32,
        failed: Vec<PeerId>,
        last_error: Option<String>,
    ) {
        let Some(mut task) = self.tasks.get_mut(&id) else {
            return;
        };
        if task.state.is_terminal() {
            return;
        }

        if failed.is_empty() {
            task.pending.clear();
            task.state = TaskState::Completed;
            task.finished_at = Some(Instant::now());
            task.last_error = None;
            let lag = task.lag();
            let key = (task.message.tenant.clone(), task.message.key.clone());
            drop(task);

            self.record_ack(key, lag);
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            self.counters.completed.fetch_add(1, Ordering::Relaxed);
            self.metrics
                .histogram("replication_lag_seconds", &[], lag.as_secs_f64());
            debug!(task = %id, attempt, lag_ms = lag.as_millis() as u64, "Replication acknowledged");
            self.retire(id);
            return;
        }

        task.pending = failed;
        task.last_error = last_error;

        if attempt >= self.config.max_attempts {
            let reason = task
                .last_error
                .clone()
                .unwrap_or_else(|| "unacknowledged".to_string());
            drop(task);
            self.abandon(id, reason);
            return;
        }

        task.state = TaskState::Backoff;
        let error = task.last_error.clone().unwrap_or_default();
        drop(task);

        let delay = self.backoff.delay(attempt);
        warn!(
            task = %id,
            attempt,
            max_attempts = self.config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Replication attempt failed, retrying"
        );
        self.schedule_retry(id, delay);
    }

    /// Move a live task to Abandoned. Returns false if it had already
    /// finished.
    fn abandon(&self, id: TaskId, reason: String) -> bool {
        let record = {
            let Some(mut task) = self.tasks.get_mut(&id) else {
                return false;
            };
            if task.state.is_terminal() {
                return false;
            }
            task.state = TaskState::Abandoned;
            task.finished_at = Some(Instant::now());
            task.abandoned(reason)
        };

        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
        self.metrics.counter("replication_abandoned_total", &[], 1);
        error!(
            task = %id,
            tenant = %record.tenant,
            key = %record.key,
            version = record.version,
            attempts = record.attempts,
            peers = ?record.peers,
            reason = %record.reason,
            "Replication abandoned"
        );
        self.abandoned.lock().push(record);
        self.retire(id);
        true
    }

    /// Abandon every live task matching `filter`.
    fn abandon_where(&self, reason: &str, filter: impl Fn(TaskState) -> bool) -> usize {
        let ids: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|t| !t.state.is_terminal() && filter(t.state))
            .map(|t| *t.key())
            .collect();
        ids.into_iter()
            .filter(|id| self.abandon(*id, reason.to_string()))
            .count()
    }

    fn record_ack(&self, key: (String, String), lag: Duration) {
        if self.acks.insert(key.clone(), lag).is_some() {
            return;
        }
        let mut order = self.ack_order.lock();
        order.push_back(key);
        while order.len() > self.config.ack_history {
            if let Some(old) = order.pop_front() {
                self.acks.remove(&old);
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, id: TaskId, delay: Duration) {
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = inner.shutdown.cancelled() => {
                    inner.abandon(id, SHUTDOWN_REASON.to_string());
                    return;
                }
            }
            if let Some(mut task) = inner.tasks.get_mut(&id) {
                task.state = TaskState::Queued;
            }
            if let Err(e) = dispatch(&inner, id) {
                // The attempt is spent without reaching any peer
                let consumed = inner.tasks.get_mut(&id).and_then(|mut task| {
                    if task.state.is_terminal() {
                        return None;
                    }
                    task.attempts += 1;
                    Some((task.attempts, task.pending.clone()))
                });
                if let Some((attempt, pending)) = consumed {
                    inner.finish_attempt(id, attempt, pending, Some(e.to_string()));
                }
            }
        });
    }

    /// Keep the finished record around for `task_status`, evicting the
    /// oldest once the history is full.
    fn retire(&self, id: TaskId) {
        let mut finished = self.finished.lock();
        finished.push_back(id);
        while finished.len() > self.config.history {
            if let Some(old) = finished.pop_front() {
                self.tasks.remove(&old);
            }
        }
    }
}

fn dispatch(inner: &Arc<EngineInner>, id: TaskId) -> Result<()> {
    inner
        .pool
        .submit(run_attempt(inner.clone(), id))?
        .detach();
    Ok(())
}

async fn run_attempt(inner: Arc<EngineInner>, id: TaskId) {
    let started = {
        let Some(mut task) = inner.tasks.get_mut(&id) else {
            return;
        };
        if task.state.is_terminal() {
            return;
        }
        task.attempts += 1;
        task.state = TaskState::Sending;
        (task.attempts, task.message.clone(), task.pending.clone())
    };
    let (attempt, message, targets) = started;

    let sends = targets.into_iter().map(|target| {
        let inner = inner.clone();
        let message = message.clone();
        async move {
            let result = inner.send_one(&target, &message).await;
            (target, result)
        }
    });
    let results = futures::future::join_all(sends).await;

    let mut failed = Vec::new();
    let mut last_error = None;
    for (target, result) in results {
        if let Err(e) = result {
            debug!(task = %id, peer = %target, attempt, error = %e, "Replication send failed");
            last_error = Some(format!("{}: {}", target, e));
            failed.push(target);
        }
    }
    inner.finish_attempt(id, attempt, failed, last_error);
}

/// Asynchronous replication to peer nodes. Cheap to clone.
#[derive(Clone)]
pub struct ReplicationEngine {
    inner: Arc<EngineInner>,
}

impl ReplicationEngine {
    pub fn new(
        config: ReplicationConfig,
        pool: WorkerPool,
        transport: Arc<dyn PeerTransport>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;
        let peers = config
            .peers
            .iter()
            .map(|p| {
                Arc::new(Peer {
                    id: p.peer_id(),
                    breaker: CircuitBreaker::new(config.breaker.clone()),
                })
            })
            .collect();

        Ok(Self {
            inner: Arc::new(EngineInner {
                backoff: config.backoff(),
                pool,
                transport,
                metrics,
                peers: RwLock::new(peers),
                tasks: DashMap::new(),
                finished: Mutex::new(VecDeque::new()),
                abandoned: Mutex::new(Vec::new()),
                acks: DashMap::new(),
                ack_order: Mutex::new(VecDeque::new()),
                in_flight: AtomicUsize::new(0),
                counters: EngineCounters::default(),
                shutdown: CancellationToken::new(),
                config,
            }),
        })
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.inner.config
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.peers.read().iter().map(|p| p.id.clone()).collect()
    }

    /// Returns false if the peer was already known.
    pub fn add_peer(&self, id: PeerId) -> bool {
        let mut peers = self.inner.peers.write();
        if peers.iter().any(|p| p.id == id) {
            return false;
        }
        info!(peer = %id, "Replication peer added");
        peers.push(Arc::new(Peer {
            id,
            breaker: CircuitBreaker::new(self.inner.config.breaker.clone()),
        }));
        true
    }

    /// Pending tasks stop waiting on a removed peer at their next attempt.
    pub fn remove_peer(&self, id: &PeerId) -> bool {
        let mut peers = self.inner.peers.write();
        let before = peers.len();
        peers.retain(|p| &p.id != id);
        let removed = peers.len() != before;
        if removed {
            info!(peer = %id, "Replication peer removed");
        }
        removed
    }

    /// Accept a committed change for replication to every current peer.
    ///
    /// Fails with [`Error::Backpressure`] when too many tasks are in flight
    /// or the worker pool queue is full. Never waits.
    pub fn enqueue(&self, tenant: &str, key: &str, change: Change) -> Result<TaskId> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown("replication engine stopped".into()));
        }

        let message = ReplicationMessage {
            tenant: tenant.to_string(),
            key: key.to_string(),
            change,
            origin: inner.config.node_id.clone(),
        };
        let mut task = ReplicationTask::new(message, self.peers());
        let id = task.id;

        if task.pending.is_empty() {
            task.state = TaskState::Completed;
            task.finished_at = Some(task.committed_at);
            inner.tasks.insert(id, task);
            inner.counters.enqueued.fetch_add(1, Ordering::Relaxed);
            inner.counters.completed.fetch_add(1, Ordering::Relaxed);
            inner.retire(id);
            return Ok(id);
        }

        let max = inner.config.max_in_flight;
        if inner.in_flight.fetch_add(1, Ordering::AcqRel) >= max {
            inner.in_flight.fetch_sub(1, Ordering::AcqRel);
            inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
            inner.metrics.counter("replication_rejected_total", &[], 1);
            return Err(Error::Backpressure(format!(
                "{} replication tasks in flight",
                max
            )));
        }

        inner.tasks.insert(id, task);
        if let Err(e) = dispatch(inner, id) {
            inner.tasks.remove(&id);
            inner.in_flight.fetch_sub(1, Ordering::AcqRel);
            inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
            inner.metrics.counter("replication_rejected_total", &[], 1);
            return Err(e);
        }

        inner.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        debug!(task = %id, tenant, key, "Replication enqueued");
        Ok(id)
    }

    pub fn status(&self) -> ReplicationStatus {
        let inner = &self.inner;
        let lag = inner
            .tasks
            .iter()
            .filter(|t| !t.state.is_terminal())
            .map(|t| t.lag())
            .max()
            .unwrap_or(Duration::ZERO);

        let sends = inner.counters.sends.load(Ordering::Relaxed);
        let failed = inner.counters.failed_sends.load(Ordering::Relaxed);
        let error_rate = if sends == 0 {
            0.0
        } else {
            failed as f64 / sends as f64
        };

        let peers = inner
            .peers
            .read()
            .iter()
            .map(|p| PeerStatus {
                id: p.id.to_string(),
                breaker: p.breaker.state(),
                trips: p.breaker.trips(),
            })
            .collect();

        ReplicationStatus {
            in_flight: inner.in_flight.load(Ordering::Acquire),
            lag_millis: lag.as_millis() as u64,
            error_rate,
            enqueued: inner.counters.enqueued.load(Ordering::Relaxed),
            completed: inner.counters.completed.load(Ordering::Relaxed),
            abandoned: inner.counters.abandoned.load(Ordering::Relaxed),
            rejected: inner.counters.rejected.load(Ordering::Relaxed),
            peers,
        }
    }

    /// Status of a live task or one of the most recently finished ones.
    pub fn task_status(&self, id: TaskId) -> Option<TaskStatus> {
        self.inner.tasks.get(&id).map(|t| t.status())
    }

    /// Commit-to-acknowledgement time of the last fully replicated change
    /// to this key.
    pub fn last_ack_lag(&self, tenant: &str, key: &str) -> Option<Duration> {
        self.inner
            .acks
            .get(&(tenant.to_string(), key.to_string()))
            .map(|lag| *lag)
    }

    /// Abandoned tasks not yet handed out. Each is returned once.
    pub fn drain_abandoned(&self) -> Vec<AbandonedTask> {
        std::mem::take(&mut *self.inner.abandoned.lock())
    }

    pub fn health(&self) -> HealthCheckResult {
        let status = self.status();
        let threshold = self.inner.config.lag_degraded_ms;
        let open: Vec<&str> = status
            .peers
            .iter()
            .filter(|p| p.breaker == BreakerState::Open)
            .map(|p| p.id.as_str())
            .collect();

        if status.lag_millis > threshold {
            HealthCheckResult::degraded(
                "replication",
                format!(
                    "lag {}ms exceeds {}ms with {} tasks in flight",
                    status.lag_millis, threshold, status.in_flight
                ),
            )
        } else if !open.is_empty() {
            HealthCheckResult::degraded(
                "replication",
                format!("circuit open for {}", open.join(", ")),
            )
        } else {
            HealthCheckResult::healthy("replication")
        }
    }

    /// Stop scheduling retries and refuse new tasks.
    ///
    /// Tasks waiting out a backoff are abandoned right away. Attempts already
    /// in the worker pool may still finish; call [`Self::abandon_outstanding`]
    /// once the pool has drained to surface the ones that did not.
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!(
            in_flight = self.inner.in_flight.load(Ordering::Acquire),
            "Replication engine stopping"
        );
        self.inner.shutdown.cancel();
        let abandoned = self
            .inner
            .abandon_where(SHUTDOWN_REASON, |state| state == TaskState::Backoff);
        if abandoned > 0 {
            warn!(abandoned, "Replication retries cut short by shutdown");
        }
    }

    /// Abandon every task that has not finished. Returns how many were.
    pub fn abandon_outstanding(&self) -> usize {
        self.inner.abandon_where(SHUTDOWN_REASON, |_| true)
    }
}

impl std::fmt::Debug for ReplicationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationEngine")
            .field("node_id", &self.inner.config.node_id)
            .field("peers", &self.peers())
            .field("in_flight", &self.inner.in_flight.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::NoopMetricsSink;
    use crate::monitoring::{HealthStatus, MetricsCollector};
    use crate::replication::{BreakerConfig, PeerConfig};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashMap;

    /// Fails the first `failures[peer]` sends to each peer.
    #[derive(Default)]
    struct MockTransport {
        calls: Mutex<HashMap<String, u32>>,
        failures: Mutex<HashMap<String, u32>>,
        delay: Option<Duration>,
    }

    impl MockTransport {
        fn failing(peer: &str, times: u32) -> Self {
            let t = Self::default();
            t.failures.lock().insert(peer.to_string(), times);
            t
        }

        fn calls(&self, peer: &str) -> u32 {
            self.calls.lock().get(peer).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl PeerTransport for MockTransport {
        async fn send(&self, peer: &PeerId, _message: &ReplicationMessage) -> Result<()> {
            *self.calls.lock().entry(peer.to_string()).or_default() += 1;
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut failures = self.failures.lock();
            match failures.get_mut(peer.as_str()) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    Err(Error::Transport {
                        peer: peer.to_string(),
                        reason: "connection refused".into(),
                    })
                }
                _ => Ok(()),
            }
        }
    }

    fn config(peers: &[&str]) -> ReplicationConfig {
        let mut config = ReplicationConfig::default()
            .with_node_id("a")
            .with_backoff(10, 50);
        for p in peers {
            config = config.with_peer(PeerConfig::new(*p, format!("http://{}", p)));
        }
        config
    }

    fn engine(config: ReplicationConfig, transport: Arc<MockTransport>) -> (ReplicationEngine, WorkerPool) {
        let pool = WorkerPool::manual(64).unwrap();
        let engine =
            ReplicationEngine::new(config, pool.clone(), transport, Arc::new(NoopMetricsSink)).unwrap();
        (engine, pool)
    }

    fn put(version: u64) -> Change {
        Change::Put {
            value: Bytes::from_static(b"payload"),
            version,
        }
    }

    /// Run queued attempts and let retry timers fire until nothing is in flight.
    async fn settle(engine: &ReplicationEngine, pool: &WorkerPool) {
        for _ in 0..100 {
            pool.run_pending().await;
            if engine.status().in_flight == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("replication did not settle: {:?}", engine.status());
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_replication_has_no_lag() {
        let transport = Arc::new(MockTransport::default());
        let (engine, pool) = engine(config(&["b", "c"]), transport.clone());

        let id = engine.enqueue("t1", "k", put(1)).unwrap();
        assert_eq!(engine.status().in_flight, 1);
        assert_eq!(engine.task_status(id).unwrap().state, TaskState::Queued);

        settle(&engine, &pool).await;
        let status = engine.status();
        assert_eq!(status.in_flight, 0);
        assert_eq!(status.lag_millis, 0);
        assert_eq!(status.completed, 1);
        assert_eq!(status.error_rate, 0.0);
        assert_eq!(transport.calls("b"), 1);
        assert_eq!(transport.calls("c"), 1);
        assert_eq!(engine.task_status(id).unwrap().state, TaskState::Completed);
        assert_eq!(engine.last_ack_lag("t1", "k"), Some(Duration::ZERO));
        assert!(engine.drain_abandoned().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lag_tracks_oldest_outstanding_task() {
        let transport = Arc::new(MockTransport::default());
        let (engine, pool) = engine(config(&["b"]), transport);

        engine.enqueue("t1", "old", put(1)).unwrap();
        tokio::time::advance(Duration::from_millis(250)).await;
        engine.enqueue("t1", "new", put(2)).unwrap();
        tokio::time::advance(Duration::from_millis(50)).await;

        assert_eq!(engine.status().lag_millis, 300);
        settle(&engine, &pool).await;
        assert_eq!(engine.status().lag_millis, 0);
        assert_eq!(engine.last_ack_lag("t1", "old"), Some(Duration::from_millis(300)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_after_max_attempts_and_reported_once() {
        let transport = Arc::new(MockTransport::failing("b", u32::MAX));
        let metrics = Arc::new(MetricsCollector::new());
        let pool = WorkerPool::manual(64).unwrap();
        let engine = ReplicationEngine::new(
            config(&["b"]),
            pool.clone(),
            transport.clone(),
            metrics.clone(),
        )
        .unwrap();

        let id = engine.enqueue("t1", "k", put(7)).unwrap();
        settle(&engine, &pool).await;

        assert_eq!(transport.calls("b"), 5);
        let status = engine.status();
        assert_eq!(status.abandoned, 1);
        assert_eq!(status.completed, 0);
        assert_eq!(status.error_rate, 1.0);

        let task = engine.task_status(id).unwrap();
        assert_eq!(task.state, TaskState::Abandoned);
        assert_eq!(task.attempts, 5);

        let abandoned = engine.drain_abandoned();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].version, 7);
        assert_eq!(abandoned[0].peers, vec!["b"]);
        assert_matches!(
            abandoned[0].to_error(),
            Error::ReplicationAbandoned { attempts: 5, .. }
        );
        assert!(engine.drain_abandoned().is_empty());
        assert_eq!(metrics.counter_value("replication_abandoned_total", &[]), 1);

        // Nothing is retried after abandonment
        tokio::time::sleep(Duration::from_secs(5)).await;
        pool.run_pending().await;
        assert_eq!(transport.calls("b"), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_targets_only_failed_peers() {
        let transport = Arc::new(MockTransport::failing("c", 2));
        let (engine, pool) = engine(config(&["b", "c"]), transport.clone());

        let id = engine.enqueue("t1", "k", put(1)).unwrap();
        settle(&engine, &pool).await;

        assert_eq!(transport.calls("b"), 1);
        assert_eq!(transport.calls("c"), 3);
        let task = engine.task_status(id).unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.attempts, 3);
        assert!(engine.last_ack_lag("t1", "k").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_counts_as_failed_attempt() {
        let mut config = config(&["b"]);
        config.breaker = BreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            open_timeout_ms: 60_000,
        };
        let transport = Arc::new(MockTransport::failing("b", u32::MAX));
        let (engine, pool) = engine(config, transport.clone());

        engine.enqueue("t1", "k", put(1)).unwrap();
        settle(&engine, &pool).await;

        // Two real sends open the circuit, the remaining attempts are refused
        assert_eq!(transport.calls("b"), 2);
        let status = engine.status();
        assert_eq!(status.abandoned, 1);
        assert_eq!(status.peers[0].breaker, BreakerState::Open);
        let health = engine.health();
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(engine.drain_abandoned()[0].reason.contains("Circuit open"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_peer_times_out() {
        let mut config = config(&["b"]).with_max_attempts(1);
        config.request_timeout_ms = 100;
        let transport = Arc::new(MockTransport {
            delay: Some(Duration::from_secs(10)),
            ..MockTransport::default()
        });
        let (engine, pool) = engine(config, transport);

        engine.enqueue("t1", "k", put(1)).unwrap();
        settle(&engine, &pool).await;
        let abandoned = engine.drain_abandoned();
        assert_eq!(abandoned.len(), 1);
        assert!(abandoned[0].reason.contains("timed out"));
    }

    #[tokio::test]
    async fn test_backpressure_on_in_flight_limit() {
        let transport = Arc::new(MockTransport::default());
        let (engine, _pool) = engine(config(&["b"]).with_max_in_flight(2), transport);

        engine.enqueue("t1", "a", put(1)).unwrap();
        engine.enqueue("t1", "b", put(2)).unwrap();
        assert_matches!(engine.enqueue("t1", "c", put(3)), Err(Error::Backpressure(_)));
        let status = engine.status();
        assert_eq!(status.in_flight, 2);
        assert_eq!(status.rejected, 1);
    }

    #[tokio::test]
    async fn test_backpressure_on_full_pool() {
        let pool = WorkerPool::manual(1).unwrap();
        let engine = ReplicationEngine::new(
            config(&["b"]),
            pool.clone(),
            Arc::new(MockTransport::default()),
            Arc::new(NoopMetricsSink),
        )
        .unwrap();

        engine.enqueue("t1", "a", put(1)).unwrap();
        assert_matches!(engine.enqueue("t1", "b", put(2)), Err(Error::Backpressure(_)));
        assert_eq!(engine.status().in_flight, 1);
        pool.run_pending().await;
        assert_eq!(engine.status().in_flight, 0);
    }

    #[tokio::test]
    async fn test_no_peers_completes_immediately() {
        let (engine, pool) = engine(config(&[]), Arc::new(MockTransport::default()));
        let id = engine.enqueue("t1", "k", put(1)).unwrap();
        assert_eq!(pool.queue_depth(), 0);
        assert_eq!(engine.task_status(id).unwrap().state, TaskState::Completed);
        assert_eq!(engine.status().in_flight, 0);
    }

    #[tokio::test]
    async fn test_added_peer_receives_new_tasks() {
        let transport = Arc::new(MockTransport::default());
        let (engine, pool) = engine(config(&["b"]), transport.clone());
        assert!(engine.add_peer(PeerId::new("c")));
        assert!(!engine.add_peer(PeerId::new("c")));

        engine.enqueue("t1", "k", put(1)).unwrap();
        pool.run_pending().await;
        assert_eq!(transport.calls("c"), 1);

        assert!(engine.remove_peer(&PeerId::new("b")));
        assert_eq!(engine.peers(), vec![PeerId::new("c")]);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_tasks() {
        let (engine, _pool) = engine(config(&["b"]), Arc::new(MockTransport::default()));
        engine.shutdown();
        assert_matches!(engine.enqueue("t1", "k", put(1)), Err(Error::ShuttingDown(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_task_in_backoff() {
        let transport = Arc::new(MockTransport::failing("b", u32::MAX));
        let (engine, pool) = engine(config(&["b"]), transport.clone());

        let id = engine.enqueue("t1", "k", put(3)).unwrap();
        pool.run_pending().await;
        assert_eq!(engine.task_status(id).unwrap().state, TaskState::Backoff);

        engine.shutdown();
        tokio::time::sleep(Duration::from_secs(60)).await;
        pool.run_pending().await;

        let status = engine.status();
        assert_eq!(status.in_flight, 0);
        assert_eq!(status.abandoned, 1);
        assert_eq!(transport.calls("b"), 1);
        assert_eq!(engine.task_status(id).unwrap().state, TaskState::Abandoned);

        let abandoned = engine.drain_abandoned();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].reason, SHUTDOWN_REASON);
        assert_eq!(abandoned[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_abandon_outstanding_surfaces_queued_tasks() {
        let transport = Arc::new(MockTransport::default());
        let (engine, _pool) = engine(config(&["b"]), transport.clone());

        engine.enqueue("t1", "a", put(1)).unwrap();
        engine.enqueue("t1", "b", put(2)).unwrap();
        engine.shutdown();
        assert_eq!(engine.status().in_flight, 2);

        assert_eq!(engine.abandon_outstanding(), 2);
        assert_eq!(engine.abandon_outstanding(), 0);
        assert_eq!(engine.status().in_flight, 0);
        assert_eq!(engine.drain_abandoned().len(), 2);
        assert_eq!(transport.calls("b"), 0);
    }

    #[tokio::test]
    async fn test_ack_lags_are_bounded() {
        let transport = Arc::new(MockTransport::default());
        let (engine, pool) = engine(config(&["b"]).with_ack_history(2), transport);

        for key in ["a", "b", "a", "c"] {
            engine.enqueue("t1", key, put(1)).unwrap();
            pool.run_pending().await;
        }

        assert!(engine.last_ack_lag("t1", "a").is_none());
        assert!(engine.last_ack_lag("t1", "b").is_some());
        assert!(engine.last_ack_lag("t1", "c").is_some());
        assert_eq!(engine.inner.acks.len(), 2);
        assert_eq!(engine.inner.ack_order.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let mut config = config(&[]);
        config.history = 2;
        let (engine, _pool) = engine(config, Arc::new(MockTransport::default()));
        let first = engine.enqueue("t1", "a", put(1)).unwrap();
        engine.enqueue("t1", "b", put(2)).unwrap();
        engine.enqueue("t1", "c", put(3)).unwrap();
        assert!(engine.task_status(first).is_none());
    }
}
