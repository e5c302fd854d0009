//! Observability
//!
//! ```text
//! ┌──────────────┐  MetricsSink  ┌────────────────────┐
//! │ ObjectService│ ────────────► │ PrometheusSink     │ (registry, /metrics)
//! │ Replication  │               │ MetricsCollector   │ (in-process)
//! └──────────────┘               └────────────────────┘
//!        │ health()
//!        ▼
//!   HealthReport ◄── worst of component checks
//! ```

mod collector;
mod health;

pub use collector::{Counter, Gauge, Histogram, MetricsCollector, SeriesKey};
pub use health::{HealthCheckResult, HealthReport, HealthStatus, Readiness};
