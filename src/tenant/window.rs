//! Fixed-interval rate counters
//!
//! Bandwidth and request-rate budgets reset at interval boundaries aligned
//! to the manager's start instant, so every tenant's window rolls over at
//! the same moment.

use std::time::Duration;

use tokio::time::Instant;

/// Clock shared by every window of one manager.
#[derive(Debug, Clone, Copy)]
pub struct WindowClock {
    epoch: Instant,
    interval: Duration,
}

impl WindowClock {
    pub fn new(interval: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Index of the interval `now` falls in.
    pub fn current(&self) -> u64 {
        let elapsed = Instant::now().saturating_duration_since(self.epoch);
        (elapsed.as_nanos() / self.interval.as_nanos()) as u64
    }
}

/// Counter that resets when the interval index moves on.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntervalCounter {
    window: u64,
    used: u64,
}

impl IntervalCounter {
    fn roll(&mut self, window: u64) {
        if window != self.window {
            self.window = window;
            self.used = 0;
        }
    }

    /// Amount consumed in `window`.
    pub fn used(&mut self, window: u64) -> u64 {
        self.roll(window);
        self.used
    }

    /// Whether `amount` more fits under `limit` in `window`.
    ///
    /// A zero-sized request is refused only once the window is exhausted.
    pub fn fits(&mut self, window: u64, amount: u64, limit: u64) -> bool {
        self.roll(window);
        if amount == 0 {
            return self.used < limit;
        }
        self.used.saturating_add(amount) <= limit
    }

    pub fn consume(&mut self, window: u64, amount: u64) {
        self.roll(window);
        self.used = self.used.saturating_add(amount);
    }

    /// Give back `amount` if the window it was taken from is still open.
    pub fn refund(&mut self, window: u64, amount: u64) {
        if window == self.window {
            self.used = self.used.saturating_sub(amount);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_rolls_over() {
        let mut c = IntervalCounter::default();
        assert!(c.fits(0, 100, 100));
        c.consume(0, 100);
        assert!(!c.fits(0, 1, 100));
        assert!(!c.fits(0, 0, 100));
        assert!(c.fits(1, 100, 100));
        assert_eq!(c.used(1), 0);
    }

    #[test]
    fn test_refund_only_same_window() {
        let mut c = IntervalCounter::default();
        c.consume(3, 50);
        c.refund(3, 20);
        assert_eq!(c.used(3), 30);
        c.refund(2, 30);
        assert_eq!(c.used(3), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_advances_by_interval() {
        let clock = WindowClock::new(Duration::from_secs(1));
        assert_eq!(clock.current(), 0);
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(clock.current(), 1);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(clock.current(), 2);
    }
}
