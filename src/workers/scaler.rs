//! Worker auto-scaling state machine
//!
//! ```text
//!              high load               sustained
//!   Steady ───────────────► Rising ──────────────► (Grow) ──► Cooldown
//!     ▲   ───────────────► Falling ─────────────► (Shrink) ─►    │
//!     │        low load               sustained                  │
//!     └──────────────────────────────────────────────────────────┘
//!                            cooldown elapsed
//! ```
//!
//! Growth and shrink thresholds are distinct, a condition must hold for
//! several consecutive ticks before acting, and every change is followed by
//! a cooldown. Together these keep the pool from flapping.

use std::time::Duration;

use tokio::time::Instant;

use super::WorkerPoolConfig;

/// Load observed at one evaluation tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSample {
    pub workers: usize,
    pub busy: usize,
    pub queue_depth: usize,
}

impl LoadSample {
    /// Fraction of workers currently running a task.
    pub fn utilization(&self) -> f64 {
        if self.workers == 0 {
            return if self.busy > 0 || self.queue_depth > 0 {
                1.0
            } else {
                0.0
            };
        }
        self.busy as f64 / self.workers as f64
    }

    /// Queued tasks per worker.
    pub fn backlog(&self) -> f64 {
        if self.workers == 0 {
            return self.queue_depth as f64;
        }
        self.queue_depth as f64 / self.workers as f64
    }
}

/// Scaler phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleState {
    Steady,
    Rising { ticks: u32 },
    Falling { ticks: u32 },
    Cooldown { until: Instant },
}

impl ScaleState {
    pub fn name(&self) -> &'static str {
        match self {
            ScaleState::Steady => "steady",
            ScaleState::Rising { .. } => "rising",
            ScaleState::Falling { .. } => "falling",
            ScaleState::Cooldown { .. } => "cooldown",
        }
    }
}

/// What the pool should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Hold,
    Grow { target: usize },
    Shrink { target: usize },
}

/// Thresholds extracted from the pool configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalerConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub up_utilization: f64,
    pub down_utilization: f64,
    pub up_backlog: f64,
    pub sustain_ticks: u32,
    pub cooldown: Duration,
}

impl From<&WorkerPoolConfig> for ScalerConfig {
    fn from(c: &WorkerPoolConfig) -> Self {
        Self {
            min_workers: c.min_workers,
            max_workers: c.max_workers,
            up_utilization: c.scale_up_utilization,
            down_utilization: c.scale_down_utilization,
            up_backlog: c.scale_up_backlog,
            sustain_ticks: c.sustain_ticks.max(1),
            cooldown: Duration::from_millis(c.cooldown_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pressure {
    High,
    Normal,
    Low,
}

#[derive(Debug)]
pub struct Scaler {
    config: ScalerConfig,
    state: ScaleState,
}

impl Scaler {
    pub fn new(config: ScalerConfig) -> Self {
        Self {
            config,
            state: ScaleState::Steady,
        }
    }

    pub fn state(&self) -> ScaleState {
        self.state
    }

    fn pressure(&self, sample: &LoadSample) -> Pressure {
        let c = &self.config;
        if sample.utilization() >= c.up_utilization || sample.backlog() >= c.up_backlog {
            Pressure::High
        } else if sample.utilization() <= c.down_utilization && sample.queue_depth == 0 {
            Pressure::Low
        } else {
            Pressure::Normal
        }
    }

    fn grow_target(&self, workers: usize) -> usize {
        (workers * 2).max(workers + 1).min(self.config.max_workers)
    }

    fn shrink_target(&self, workers: usize) -> usize {
        (workers / 2).max(self.config.min_workers)
    }

    /// Advance the state machine by one tick.
    pub fn evaluate(&mut self, sample: LoadSample, now: Instant) -> ScaleDecision {
        if let ScaleState::Cooldown { until } = self.state {
            if now < until {
                return ScaleDecision::Hold;
            }
            self.state = ScaleState::Steady;
        }

        let pressure = self.pressure(&sample);
        let sustain = self.config.sustain_ticks;

        let (next, decision) = match (self.state, pressure) {
            (ScaleState::Rising { ticks }, Pressure::High) => (ticks + 1, Pressure::High),
            (ScaleState::Falling { ticks }, Pressure::Low) => (ticks + 1, Pressure::Low),
            (_, Pressure::High) | (_, Pressure::Low) => (1, pressure),
            (_, Pressure::Normal) => (0, Pressure::Normal),
        };

        match decision {
            Pressure::Normal => {
                self.state = ScaleState::Steady;
                ScaleDecision::Hold
            }
            Pressure::High => {
                let target = self.grow_target(sample.workers);
                if target <= sample.workers {
                    self.state = ScaleState::Steady;
                    ScaleDecision::Hold
                } else if next >= sustain {
                    self.state = ScaleState::Cooldown {
                        until: now + self.config.cooldown,
                    };
                    ScaleDecision::Grow { target }
                } else {
                    self.state = ScaleState::Rising { ticks: next };
                    ScaleDecision::Hold
                }
            }
            Pressure::Low => {
                let target = self.shrink_target(sample.workers);
                if target >= sample.workers {
                    self.state = ScaleState::Steady;
                    ScaleDecision::Hold
                } else if next >= sustain {
                    self.state = ScaleState::Cooldown {
                        until: now + self.config.cooldown,
                    };
                    ScaleDecision::Shrink { target }
                } else {
                    self.state = ScaleState::Falling { ticks: next };
                    ScaleDecision::Hold
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scaler(sustain: u32, cooldown_ms: u64) -> Scaler {
        Scaler::new(ScalerConfig {
            min_workers: 2,
            max_workers: 16,
            up_utilization: 0.8,
            down_utilization: 0.2,
            up_backlog: 2.0,
            sustain_ticks: sustain,
            cooldown: Duration::from_millis(cooldown_ms),
        })
    }

    fn sample(workers: usize, busy: usize, queue_depth: usize) -> LoadSample {
        LoadSample {
            workers,
            busy,
            queue_depth,
        }
    }

    #[test]
    fn test_grow_after_sustained_load() {
        let mut s = scaler(2, 0);
        let now = Instant::now();
        assert_eq!(s.evaluate(sample(4, 4, 0), now), ScaleDecision::Hold);
        assert_eq!(s.state(), ScaleState::Rising { ticks: 1 });
        assert_eq!(
            s.evaluate(sample(4, 4, 0), now),
            ScaleDecision::Grow { target: 8 }
        );
    }

    #[test]
    fn test_backlog_triggers_growth() {
        let mut s = scaler(1, 0);
        assert_eq!(
            s.evaluate(sample(4, 1, 8), Instant::now()),
            ScaleDecision::Grow { target: 8 }
        );
    }

    #[test]
    fn test_blip_resets_counter() {
        let mut s = scaler(2, 0);
        let now = Instant::now();
        s.evaluate(sample(4, 4, 0), now);
        // Normal load between the thresholds resets
        s.evaluate(sample(4, 2, 0), now);
        assert_eq!(s.state(), ScaleState::Steady);
        assert_eq!(s.evaluate(sample(4, 4, 0), now), ScaleDecision::Hold);
    }

    #[test]
    fn test_shrink_to_min() {
        let mut s = scaler(1, 0);
        assert_eq!(
            s.evaluate(sample(3, 0, 0), Instant::now()),
            ScaleDecision::Shrink { target: 2 }
        );
        let mut s = scaler(1, 0);
        assert_eq!(s.evaluate(sample(2, 0, 0), Instant::now()), ScaleDecision::Hold);
    }

    #[test]
    fn test_queued_work_blocks_shrink() {
        let mut s = scaler(1, 0);
        assert_eq!(s.evaluate(sample(8, 0, 1), Instant::now()), ScaleDecision::Hold);
    }

    #[test]
    fn test_grow_capped_at_max() {
        let mut s = scaler(1, 0);
        assert_eq!(
            s.evaluate(sample(12, 12, 0), Instant::now()),
            ScaleDecision::Grow { target: 16 }
        );
        let mut s = scaler(1, 0);
        assert_eq!(s.evaluate(sample(16, 16, 50), Instant::now()), ScaleDecision::Hold);
    }

    #[test]
    fn test_cooldown_holds() {
        let mut s = scaler(1, 1000);
        let now = Instant::now();
        assert!(matches!(
            s.evaluate(sample(4, 4, 0), now),
            ScaleDecision::Grow { .. }
        ));
        assert_eq!(
            s.evaluate(sample(8, 8, 0), now + Duration::from_millis(500)),
            ScaleDecision::Hold
        );
        assert!(matches!(
            s.evaluate(sample(8, 8, 0), now + Duration::from_millis(1001)),
            ScaleDecision::Grow { target: 16 }
        ));
    }

    #[test]
    fn test_idle_pool_with_no_workers_grows_on_backlog() {
        let mut s = scaler(1, 0);
        assert_eq!(
            s.evaluate(sample(0, 0, 3), Instant::now()),
            ScaleDecision::Grow { target: 1 }
        );
    }
}
