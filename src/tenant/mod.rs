//! Multi-Tenant Quota Enforcement
//!
//! Every read and write is admitted against the tenant's storage, object,
//! bandwidth and request-rate limits before it runs.
//!
//! # Admission Protocol
//!
//! ```text
//! admit(tenant, op, size) ──► Reservation ──┬── commit()   usage += delta
//!        │                                  └── release()  reserve returned
//!        └── Err(QuotaExceeded)                 (or drop)
//! ```
//!
//! The check and the reserve happen under the tenant's lock, so two
//! concurrent writes can never both fit into the last slice of a quota.

mod manager;
mod proptest;
mod usage;
mod window;

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use manager::{QuotaStats, Reservation, TenantQuotaManager};
pub use usage::{Operation, TenantUsage, UsageDelta};
pub use window::{IntervalCounter, WindowClock};

use crate::error::{Error, Result};

/// Default number of tenant shards
pub const DEFAULT_QUOTA_SHARDS: usize = 64;

/// Default bandwidth and request-rate interval (1 second)
pub const DEFAULT_INTERVAL_MS: u64 = 1000;

/// Per-tenant limits. `u64::MAX` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaLimits {
    /// Stored bytes
    pub max_bytes: u64,
    /// Stored objects
    pub max_objects: u64,
    /// Bytes transferred per interval, reads and writes combined
    pub max_bandwidth: u64,
    /// Requests per interval
    pub max_requests: u64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl QuotaLimits {
    pub const fn unlimited() -> Self {
        Self {
            max_bytes: u64::MAX,
            max_objects: u64::MAX,
            max_bandwidth: u64::MAX,
            max_requests: u64::MAX,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_max_objects(mut self, max_objects: u64) -> Self {
        self.max_objects = max_objects;
        self
    }

    pub fn with_max_bandwidth(mut self, max_bandwidth: u64) -> Self {
        self.max_bandwidth = max_bandwidth;
        self
    }

    pub fn with_max_requests(mut self, max_requests: u64) -> Self {
        self.max_requests = max_requests;
        self
    }
}

/// Quota manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Number of tenant shards
    pub shard_count: usize,
    /// Bandwidth and request-rate interval
    pub bandwidth_interval_ms: u64,
    /// Limits for tenants seen for the first time. `None` rejects them.
    pub default_limits: Option<QuotaLimits>,
    /// Tenants registered at startup
    pub tenants: HashMap<String, QuotaLimits>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            shard_count: DEFAULT_QUOTA_SHARDS,
            bandwidth_interval_ms: DEFAULT_INTERVAL_MS,
            default_limits: Some(QuotaLimits::unlimited()),
            tenants: HashMap::new(),
        }
    }
}

impl QuotaConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.bandwidth_interval_ms)
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>, limits: QuotaLimits) -> Self {
        self.tenants.insert(tenant.into(), limits);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(Error::Config("quota.shard_count must be at least 1".into()));
        }
        if self.bandwidth_interval_ms == 0 {
            return Err(Error::Config(
                "quota.bandwidth_interval_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_builder() {
        let l = QuotaLimits::unlimited()
            .with_max_bytes(1)
            .with_max_objects(2)
            .with_max_bandwidth(3)
            .with_max_requests(4);
        assert_eq!(
            (l.max_bytes, l.max_objects, l.max_bandwidth, l.max_requests),
            (1, 2, 3, 4)
        );
    }

    #[test]
    fn test_preconfigured_tenants() {
        let config =
            QuotaConfig::default().with_tenant("acme", QuotaLimits::unlimited().with_max_bytes(42));
        let m = TenantQuotaManager::new(config).unwrap();
        assert_eq!(m.limits("acme").unwrap().max_bytes, 42);
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
shard_count: 8
default_limits:
  max_bytes: 1000
tenants:
  t1:
    max_bytes: 500
    max_objects: 10
"#;
        let config: QuotaConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.shard_count, 8);
        assert_eq!(config.bandwidth_interval_ms, DEFAULT_INTERVAL_MS);
        let defaults = config.default_limits.unwrap();
        assert_eq!(defaults.max_bytes, 1000);
        assert_eq!(defaults.max_bandwidth, u64::MAX);
        assert_eq!(config.tenants["t1"].max_objects, 10);
    }

    #[test]
    fn test_invalid_config() {
        let config = QuotaConfig {
            bandwidth_interval_ms: 0,
            ..QuotaConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
