//! Bounded, self-scaling worker pool
//!
//! Tasks go into a fixed-capacity lock-free queue. A full queue rejects the
//! submission immediately with [`Error::Backpressure`]; memory never grows
//! past the configured bound. Workers are tokio tasks whose number moves
//! between the configured minimum and maximum under the control of
//! [`Scaler`].

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam::queue::ArrayQueue;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::scaler::{LoadSample, ScaleDecision, ScaleState, Scaler, ScalerConfig};
use super::WorkerPoolConfig;
use crate::error::{Error, Result};

/// Idle workers re-check for retirement at least this often.
const IDLE_RECHECK: Duration = Duration::from_millis(100);

/// Grace period for workers to exit once shutdown has cancelled their tasks.
const EXIT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Completed,
    Cancelled,
    Panicked,
}

struct Job {
    id: u64,
    token: CancellationToken,
    fut: BoxFuture<'static, JobOutcome>,
}

/// Handle to a submitted task.
///
/// Awaiting it yields the task's output. Dropping it before the task
/// finishes cancels the task; call [`TaskHandle::detach`] to let it run
/// unobserved instead.
#[must_use = "dropping a TaskHandle cancels the task"]
pub struct TaskHandle<T> {
    id: u64,
    rx: oneshot::Receiver<T>,
    token: Option<CancellationToken>,
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Let the task run to completion without a listener.
    pub fn detach(mut self) {
        self.token.take();
    }

    /// Cancel the task if it has not finished yet.
    pub fn cancel(&self) {
        if let Some(token) = &self.token {
            token.cancel();
        }
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(value)) => Poll::Ready(Ok(value)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Cancelled(format!(
                "task {} did not complete",
                self.id
            )))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for TaskHandle<T> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("detached", &self.token.is_none())
            .finish()
    }
}

/// Outcome of [`WorkerPool::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Tasks that finished over the pool's lifetime.
    pub completed: u64,
    /// Queued or running tasks cancelled because the drain timed out.
    pub dropped: u64,
    /// Whether the queue emptied before the drain timeout.
    pub drained: bool,
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub target_workers: usize,
    pub busy: usize,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub submitted: u64,
    pub completed: u64,
    pub rejected: u64,
    pub cancelled: u64,
    pub panicked: u64,
    pub scale_ups: u64,
    pub scale_downs: u64,
    pub scale_state: &'static str,
    pub last_scale_at: Option<DateTime<Utc>>,
}

impl PoolStats {
    pub fn utilization(&self) -> f64 {
        LoadSample {
            workers: self.workers,
            busy: self.busy,
            queue_depth: self.queue_depth,
        }
        .utilization()
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    cancelled: AtomicU64,
    panicked: AtomicU64,
    aborted: AtomicU64,
    scale_ups: AtomicU64,
    scale_downs: AtomicU64,
}

struct ScaleControl {
    scaler: Scaler,
    last_scale_at: Option<DateTime<Utc>>,
    handles: Vec<JoinHandle<()>>,
}

struct PoolInner {
    config: WorkerPoolConfig,
    queue: ArrayQueue<Job>,
    work_ready: Notify,
    drained: Notify,
    live: AtomicUsize,
    target: AtomicUsize,
    busy: AtomicUsize,
    accepting: AtomicBool,
    next_id: AtomicU64,
    root: CancellationToken,
    counters: PoolCounters,
    control: Mutex<ScaleControl>,
}

impl PoolInner {
    /// Claim a retirement slot if there are more workers than wanted.
    fn try_retire(&self) -> bool {
        loop {
            let live = self.live.load(Ordering::Acquire);
            if live <= self.target.load(Ordering::Acquire) {
                return false;
            }
            if self
                .live
                .compare_exchange(live, live - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.busy.load(Ordering::Acquire) == 0
    }

    /// Pop a job, counting it as busy before it leaves the queue so the
    /// pool never looks idle while a job is in hand.
    fn take(&self) -> Option<Job> {
        self.busy.fetch_add(1, Ordering::AcqRel);
        let job = self.queue.pop();
        if job.is_none() {
            self.busy.fetch_sub(1, Ordering::AcqRel);
        }
        job
    }

    /// Run a job obtained from [`PoolInner::take`].
    async fn run(&self, job: Job) {
        let outcome = if job.token.is_cancelled() {
            JobOutcome::Cancelled
        } else {
            job.fut.await
        };
        self.busy.fetch_sub(1, Ordering::AcqRel);
        if outcome == JobOutcome::Panicked {
            error!(task = job.id, "Worker task panicked");
        }
        self.record(outcome);
        if self.is_idle() {
            self.drained.notify_waiters();
        }
    }

    fn record(&self, outcome: JobOutcome) {
        let counter = match outcome {
            JobOutcome::Completed => &self.counters.completed,
            JobOutcome::Panicked => &self.counters.panicked,
            JobOutcome::Cancelled if self.root.is_cancelled() => &self.counters.aborted,
            JobOutcome::Cancelled => &self.counters.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn sample(&self) -> LoadSample {
        LoadSample {
            workers: self.live.load(Ordering::Acquire),
            busy: self.busy.load(Ordering::Acquire),
            queue_depth: self.queue.len(),
        }
    }
}

async fn worker_loop(inner: Arc<PoolInner>, worker: usize) {
    debug!(worker, "Worker started");
    loop {
        if inner.root.is_cancelled() {
            inner.live.fetch_sub(1, Ordering::AcqRel);
            break;
        }
        if inner.try_retire() {
            debug!(worker, "Worker retired");
            break;
        }
        match inner.take() {
            Some(job) => inner.run(job).await,
            None => {
                if !inner.accepting.load(Ordering::Acquire) {
                    inner.drained.notify_waiters();
                }
                tokio::select! {
                    _ = inner.work_ready.notified() => {}
                    _ = inner.root.cancelled() => {}
                    _ = tokio::time::sleep(IDLE_RECHECK) => {}
                }
            }
        }
    }
}

/// Bounded worker pool. Cheap to clone.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create a pool and start its minimum number of workers.
    ///
    /// Must be called inside a tokio runtime unless the pool is manual.
    pub fn new(config: WorkerPoolConfig) -> Result<Self> {
        config.validate()?;
        if !config.manual && tokio::runtime::Handle::try_current().is_err() {
            return Err(Error::Internal(
                "worker pool must be created inside a tokio runtime".into(),
            ));
        }

        let initial = if config.manual { 0 } else { config.min_workers };
        let inner = Arc::new(PoolInner {
            queue: ArrayQueue::new(config.queue_capacity),
            work_ready: Notify::new(),
            drained: Notify::new(),
            live: AtomicUsize::new(0),
            target: AtomicUsize::new(initial),
            busy: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            root: CancellationToken::new(),
            counters: PoolCounters::default(),
            control: Mutex::new(ScaleControl {
                scaler: Scaler::new(ScalerConfig::from(&config)),
                last_scale_at: None,
                handles: Vec::new(),
            }),
            config,
        });

        let pool = Self { inner };
        if !pool.inner.config.manual {
            pool.spawn_workers(initial);
            if let Some(interval) = pool.inner.config.scale_interval() {
                pool.spawn_ticker(interval);
            }
            info!(
                workers = initial,
                max = pool.inner.config.max_workers,
                queue_capacity = pool.inner.config.queue_capacity,
                "Worker pool started"
            );
        }
        Ok(pool)
    }

    /// A pool with no workers whose tasks run only via [`run_pending`].
    ///
    /// [`run_pending`]: WorkerPool::run_pending
    pub fn manual(queue_capacity: usize) -> Result<Self> {
        Self::new(WorkerPoolConfig {
            manual: true,
            queue_capacity,
            ..WorkerPoolConfig::default()
        })
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.inner.config
    }

    pub fn is_manual(&self) -> bool {
        self.inner.config.manual
    }

    fn spawn_workers(&self, count: usize) {
        let mut control = self.inner.control.lock();
        control.handles.retain(|h| !h.is_finished());
        for _ in 0..count {
            let worker = self.inner.live.fetch_add(1, Ordering::AcqRel);
            let inner = self.inner.clone();
            control
                .handles
                .push(tokio::spawn(worker_loop(inner, worker)));
        }
    }

    fn spawn_ticker(&self, interval: Duration) {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let root = self.inner.root.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = root.cancelled() => break,
                }
                let Some(inner) = weak.upgrade() else { break };
                WorkerPool { inner }.scale();
            }
        });
    }

    /// Queue a task. Fails fast when the queue is full.
    pub fn submit<F>(&self, fut: F) -> Result<TaskHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown("worker pool is shutting down".into()));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.inner.root.child_token();
        let (tx, rx) = oneshot::channel();

        let task_token = token.clone();
        let wrapped = async move {
            let guarded = AssertUnwindSafe(fut).catch_unwind();
            tokio::select! {
                biased;
                _ = task_token.cancelled() => JobOutcome::Cancelled,
                result = guarded => match result {
                    Ok(value) => {
                        let _ = tx.send(value);
                        JobOutcome::Completed
                    }
                    Err(_) => JobOutcome::Panicked,
                },
            }
        };

        let job = Job {
            id,
            token: token.clone(),
            fut: wrapped.boxed(),
        };

        if self.inner.queue.push(job).is_err() {
            self.inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(Error::Backpressure(format!(
                "worker pool queue full ({} tasks)",
                self.inner.config.queue_capacity
            )));
        }

        self.inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.inner.work_ready.notify_one();
        Ok(TaskHandle {
            id,
            rx,
            token: Some(token),
        })
    }

    /// Run queued tasks on the caller's task, in FIFO order, until the
    /// queue is empty. Returns how many ran.
    pub async fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Some(job) = self.inner.take() {
            self.inner.run(job).await;
            ran += 1;
        }
        ran
    }

    /// Run exactly one queued task, if any.
    pub async fn run_next(&self) -> bool {
        match self.inner.take() {
            Some(job) => {
                self.inner.run(job).await;
                true
            }
            None => false,
        }
    }

    /// Evaluate load once and grow or shrink the pool.
    pub fn scale(&self) -> ScaleDecision {
        if self.inner.config.manual || !self.inner.accepting.load(Ordering::Acquire) {
            return ScaleDecision::Hold;
        }

        let sample = self.inner.sample();
        let decision = {
            let mut control = self.inner.control.lock();
            let decision = control.scaler.evaluate(sample, Instant::now());
            if decision != ScaleDecision::Hold {
                control.last_scale_at = Some(Utc::now());
            }
            decision
        };

        match decision {
            ScaleDecision::Grow { target } => {
                self.inner.target.store(target, Ordering::Release);
                let live = self.inner.live.load(Ordering::Acquire);
                self.spawn_workers(target.saturating_sub(live));
                self.inner.counters.scale_ups.fetch_add(1, Ordering::Relaxed);
                info!(
                    from = sample.workers,
                    to = target,
                    busy = sample.busy,
                    queued = sample.queue_depth,
                    "Scaled worker pool up"
                );
            }
            ScaleDecision::Shrink { target } => {
                self.inner.target.store(target, Ordering::Release);
                self.inner.work_ready.notify_waiters();
                self.inner
                    .counters
                    .scale_downs
                    .fetch_add(1, Ordering::Relaxed);
                info!(from = sample.workers, to = target, "Scaled worker pool down");
            }
            ScaleDecision::Hold => {}
        }
        decision
    }

    /// Stop accepting tasks, wait up to `drain_timeout` for queued and
    /// running tasks, then cancel whatever is left.
    pub async fn shutdown(&self, drain_timeout: Duration) -> ShutdownReport {
        self.inner.accepting.store(false, Ordering::Release);
        self.inner.work_ready.notify_waiters();

        let drained = if self.inner.config.manual {
            self.inner.is_idle()
        } else {
            let inner = self.inner.clone();
            let wait = async move {
                loop {
                    let notified = inner.drained.notified();
                    if inner.is_idle() {
                        return;
                    }
                    notified.await;
                }
            };
            tokio::time::timeout(drain_timeout, wait).await.is_ok()
        };

        self.inner.root.cancel();

        let mut dropped = 0u64;
        while let Some(job) = self.inner.queue.pop() {
            drop(job);
            dropped += 1;
        }

        let handles = std::mem::take(&mut self.inner.control.lock().handles);
        for mut handle in handles {
            if tokio::time::timeout(EXIT_GRACE, &mut handle).await.is_err() {
                warn!("Worker did not exit after cancellation, aborting");
                handle.abort();
            }
        }

        dropped += self.inner.counters.aborted.load(Ordering::Relaxed);
        let completed = self.inner.counters.completed.load(Ordering::Relaxed);
        if dropped > 0 {
            warn!(dropped, completed, "Worker pool shut down with unfinished tasks");
        } else {
            info!(completed, "Worker pool drained and shut down");
        }

        ShutdownReport {
            completed,
            dropped,
            drained,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        !self.inner.accepting.load(Ordering::Acquire)
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn worker_count(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    pub fn scale_state(&self) -> ScaleState {
        self.inner.control.lock().scaler.state()
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.inner.counters;
        let (scale_state, last_scale_at) = {
            let control = self.inner.control.lock();
            (control.scaler.state().name(), control.last_scale_at)
        };
        PoolStats {
            workers: self.inner.live.load(Ordering::Acquire),
            target_workers: self.inner.target.load(Ordering::Acquire),
            busy: self.inner.busy.load(Ordering::Acquire),
            queue_depth: self.inner.queue.len(),
            queue_capacity: self.inner.config.queue_capacity,
            submitted: c.submitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            panicked: c.panicked.load(Ordering::Relaxed),
            scale_ups: c.scale_ups.load(Ordering::Relaxed),
            scale_downs: c.scale_downs.load(Ordering::Relaxed),
            scale_state,
            last_scale_at,
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.worker_count())
            .field("queue_depth", &self.queue_depth())
            .field("manual", &self.is_manual())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicUsize;

    fn auto_config(min: usize, max: usize, queue: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            min_workers: min,
            max_workers: max,
            queue_capacity: queue,
            scale_interval_ms: 0,
            sustain_ticks: 1,
            cooldown_ms: 0,
            ..WorkerPoolConfig::default()
        }
    }

    #[tokio::test]
    async fn test_manual_pool_runs_fifo() {
        let pool = WorkerPool::manual(8).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..3)
            .map(|i| {
                let order = order.clone();
                pool.submit(async move {
                    order.lock().push(i);
                    i * 10
                })
                .unwrap()
            })
            .collect();

        assert_eq!(pool.queue_depth(), 3);
        assert_eq!(pool.run_pending().await, 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }
        assert_eq!(results, vec![0, 10, 20]);
    }

    #[tokio::test]
    async fn test_backpressure_when_full() {
        let pool = WorkerPool::manual(2).unwrap();
        let _a = pool.submit(async {}).unwrap();
        let _b = pool.submit(async {}).unwrap();
        let err = pool.submit(async {}).unwrap_err();
        assert_matches!(err, Error::Backpressure(_));
        assert_eq!(pool.queue_depth(), 2);
        assert_eq!(pool.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_dropped_handle_cancels_task() {
        let pool = WorkerPool::manual(4).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        let handle = pool
            .submit(async move {
                r.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        drop(handle);
        pool.run_pending().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(pool.stats().cancelled, 1);
    }

    #[tokio::test]
    async fn test_detached_task_runs() {
        let pool = WorkerPool::manual(4).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        pool.submit(async move {
            r.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap()
        .detach();
        pool.run_pending().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_task_is_contained() {
        let pool = WorkerPool::manual(4).unwrap();
        let handle = pool.submit(async { panic!("boom") }).unwrap();
        let ok = pool.submit(async { 7 }).unwrap();
        pool.run_pending().await;
        assert!(handle.await.is_err());
        assert_eq!(ok.await.unwrap(), 7);
        assert_eq!(pool.stats().panicked, 1);
    }

    #[tokio::test]
    async fn test_workers_execute_tasks() {
        let pool = WorkerPool::new(auto_config(2, 4, 64)).unwrap();
        let handles: Vec<_> = (0..20u64)
            .map(|i| pool.submit(async move { i * 2 }).unwrap())
            .collect();
        let mut sum = 0;
        for h in handles {
            sum += h.await.unwrap();
        }
        assert_eq!(sum, (0..20u64).map(|i| i * 2).sum::<u64>());
        let report = pool.shutdown(Duration::from_secs(1)).await;
        assert_eq!(report.completed, 20);
        assert_eq!(report.dropped, 0);
        assert!(report.drained);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scale_up_under_load_then_down() {
        let pool = WorkerPool::new(auto_config(1, 4, 64)).unwrap();
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                pool.submit(async move {
                    let _permit = gate.acquire().await;
                })
                .unwrap()
            })
            .collect();

        // Give the single worker time to pick up a task
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_matches!(pool.scale(), ScaleDecision::Grow { target: 2 });
        assert_eq!(pool.worker_count(), 2);

        gate.add_permits(8);
        for h in handles {
            h.await.unwrap();
        }

        // Idle now: shrink back towards the minimum
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_matches!(pool.scale(), ScaleDecision::Shrink { target: 1 });
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while pool.worker_count() > 1 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(pool.worker_count(), 1);
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_reports_dropped() {
        let pool = WorkerPool::new(auto_config(1, 1, 16)).unwrap();
        let _stuck: Vec<_> = (0..3)
            .map(|_| {
                pool.submit(async {
                    futures::future::pending::<()>().await;
                })
                .unwrap()
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = pool.shutdown(Duration::from_millis(50)).await;
        assert!(!report.drained);
        // One running, two still queued
        assert_eq!(report.dropped, 3);
        assert_eq!(report.completed, 0);

        assert_matches!(pool.submit(async {}), Err(Error::ShuttingDown(_)));
    }

    #[tokio::test]
    async fn test_manual_shutdown_counts_queue() {
        let pool = WorkerPool::manual(4).unwrap();
        pool.submit(async {}).unwrap().detach();
        pool.submit(async {}).unwrap().detach();
        let report = pool.shutdown(Duration::from_millis(10)).await;
        assert_eq!(report.dropped, 2);
        assert!(!report.drained);
    }

    #[test]
    fn test_auto_pool_requires_runtime() {
        assert!(WorkerPool::new(auto_config(1, 2, 4)).is_err());
        assert!(WorkerPool::manual(4).is_ok());
    }
}
