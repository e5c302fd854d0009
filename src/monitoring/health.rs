//! Health Checks
//!
//! Component checks roll up into a single report served by `/healthz`.
//! `/readyz` follows the readiness flag flipped by the binary once wiring
//! is complete.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Health status, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Serving, but a component is behind or failing over
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Healthy or degraded
    pub fn is_operational(&self) -> bool {
        !matches!(self, HealthStatus::Unhealthy)
    }

    pub fn is_healthy(&self) -> bool {
        *self == HealthStatus::Healthy
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    /// The worse of two statuses.
    pub fn worst(self, other: HealthStatus) -> HealthStatus {
        self.max(other)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one component check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub duration_ms: u64,
}

impl HealthCheckResult {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            message: None,
            duration_ms: 0,
        }
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            duration_ms: 0,
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            duration_ms: 0,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }
}

/// Aggregated health report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Worst status among the checks
    pub status: HealthStatus,
    pub checks: Vec<HealthCheckResult>,
    pub version: String,
    pub uptime_seconds: u64,
}

impl HealthReport {
    pub fn new(checks: Vec<HealthCheckResult>, uptime: Duration) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);

        Self {
            status,
            checks,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime.as_secs(),
        }
    }

    pub fn check(&self, name: &str) -> Option<&HealthCheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }
}

/// Process liveness and readiness flags
#[derive(Debug)]
pub struct Readiness {
    started: Instant,
    live: AtomicBool,
    ready: AtomicBool,
}

impl Readiness {
    /// Live but not yet ready.
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_ready(&self) -> bool {
        self.live.load(Ordering::Relaxed) && self.ready.load(Ordering::Relaxed)
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Relaxed);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn readiness_check(&self) -> HealthCheckResult {
        if self.is_ready() {
            HealthCheckResult::healthy("readiness")
        } else {
            HealthCheckResult::unhealthy("readiness", "service not ready")
        }
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ordering() {
        assert_eq!(
            HealthStatus::Healthy.worst(HealthStatus::Degraded),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthStatus::Unhealthy.worst(HealthStatus::Degraded),
            HealthStatus::Unhealthy
        );
        assert!(HealthStatus::Degraded.is_operational());
        assert!(!HealthStatus::Unhealthy.is_operational());
    }

    #[test]
    fn test_report_takes_worst() {
        let report = HealthReport::new(
            vec![
                HealthCheckResult::healthy("cache"),
                HealthCheckResult::degraded("replication", "lag 12s"),
            ],
            Duration::from_secs(60),
        );
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.uptime_seconds, 60);
        assert_eq!(
            report.check("replication").and_then(|c| c.message.as_deref()),
            Some("lag 12s")
        );
    }

    #[test]
    fn test_empty_report_is_healthy() {
        let report = HealthReport::new(Vec::new(), Duration::ZERO);
        assert!(report.status.is_healthy());
    }

    #[test]
    fn test_readiness_flags() {
        let r = Readiness::new();
        assert!(r.is_live());
        assert!(!r.is_ready());
        r.set_ready(true);
        assert!(r.is_ready());
        r.set_live(false);
        assert!(!r.is_ready());
        assert_eq!(r.readiness_check().status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_serialization() {
        let json = serde_json::to_string(&HealthCheckResult::healthy("cache")).unwrap();
        assert!(json.contains("\"healthy\""));
        assert!(!json.contains("message"));
    }
}
