//! Bounded Worker Pool
//!
//! Limits concurrency at every external I/O boundary: backing-store calls
//! and peer replication both run as pool tasks.
//!
//! # Lifecycle
//!
//! ```text
//! submit ──► [ bounded queue ] ──► worker 1..N ──► TaskHandle resolves
//!    │                                  ▲
//!    └─ Err(Backpressure) when full     │ scale() every tick
//!                                    Scaler (Steady/Rising/Falling/Cooldown)
//! ```

mod pool;
mod scaler;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use pool::{PoolStats, ShutdownReport, TaskHandle, WorkerPool};
pub use scaler::{LoadSample, ScaleDecision, ScaleState, Scaler, ScalerConfig};

use crate::error::{Error, Result};

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Maximum number of queued tasks
    pub queue_capacity: usize,
    /// Scaling evaluation period; 0 disables the periodic tick
    pub scale_interval_ms: u64,
    /// Grow when this fraction of workers is busy
    pub scale_up_utilization: f64,
    /// Shrink when at most this fraction is busy and nothing is queued
    pub scale_down_utilization: f64,
    /// Grow when this many tasks are queued per worker
    pub scale_up_backlog: f64,
    /// Consecutive ticks a condition must hold before acting
    pub sustain_ticks: u32,
    /// Quiet period after any scaling action
    pub cooldown_ms: u64,
    /// Run no workers; tasks execute only through `run_pending`
    pub manual: bool,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 4,
            max_workers: 64,
            queue_capacity: 4096,
            scale_interval_ms: 1000,
            scale_up_utilization: 0.8,
            scale_down_utilization: 0.25,
            scale_up_backlog: 2.0,
            sustain_ticks: 3,
            cooldown_ms: 5000,
            manual: false,
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_workers(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn manual(mut self) -> Self {
        self.manual = true;
        self
    }

    pub fn scale_interval(&self) -> Option<Duration> {
        (self.scale_interval_ms > 0).then(|| Duration::from_millis(self.scale_interval_ms))
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::Config("workers.queue_capacity must be at least 1".into()));
        }
        if !self.manual && self.max_workers == 0 {
            return Err(Error::Config("workers.max_workers must be at least 1".into()));
        }
        if self.min_workers > self.max_workers {
            return Err(Error::Config(format!(
                "workers.min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        if self.scale_down_utilization >= self.scale_up_utilization {
            return Err(Error::Config(
                "workers.scale_down_utilization must be below scale_up_utilization".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(WorkerPoolConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_configs() {
        assert!(WorkerPoolConfig::default()
            .with_queue_capacity(0)
            .validate()
            .is_err());
        assert!(WorkerPoolConfig::default()
            .with_workers(8, 4)
            .validate()
            .is_err());
        let inverted = WorkerPoolConfig {
            scale_up_utilization: 0.2,
            scale_down_utilization: 0.5,
            ..WorkerPoolConfig::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_scale_interval_disabled() {
        let config = WorkerPoolConfig {
            scale_interval_ms: 0,
            ..WorkerPoolConfig::default()
        };
        assert_eq!(config.scale_interval(), None);
    }
}
