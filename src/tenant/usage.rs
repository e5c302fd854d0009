//! Tenant usage records and snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::window::IntervalCounter;
use super::QuotaLimits;

/// What a request wants to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Operation {
    /// Read `size` bytes (0 when unknown up front).
    Read,
    /// Store a new object.
    Write,
    /// Replace an object currently holding `previous_size` bytes.
    Overwrite { previous_size: u64 },
}

impl Operation {
    /// Storage and object-count deltas this operation would apply.
    pub(crate) fn storage_delta(&self, size: u64) -> (i64, i64) {
        match self {
            Operation::Read => (0, 0),
            Operation::Write => (size as i64, 1),
            Operation::Overwrite { previous_size } => (size as i64 - *previous_size as i64, 0),
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, Operation::Read)
    }
}

/// Signed adjustment applied outside admission (deletes, read bandwidth).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageDelta {
    pub bytes: i64,
    pub objects: i64,
    pub bandwidth: u64,
}

impl UsageDelta {
    /// Release the storage held by a deleted object.
    pub fn delete(size: u64) -> Self {
        Self {
            bytes: -(size as i64),
            objects: -1,
            bandwidth: 0,
        }
    }

    pub fn bandwidth(bytes: u64) -> Self {
        Self {
            bandwidth: bytes,
            ..Self::default()
        }
    }
}

/// Mutable per-tenant state, guarded by the tenant's own mutex.
#[derive(Debug)]
pub(crate) struct TenantRecord {
    pub limits: QuotaLimits,
    pub bytes_used: u64,
    pub bytes_reserved: u64,
    pub objects: u64,
    pub objects_reserved: u64,
    pub bandwidth: IntervalCounter,
    pub requests: IntervalCounter,
    pub total_requests: u64,
    pub created_at: DateTime<Utc>,
}

impl TenantRecord {
    pub fn new(limits: QuotaLimits) -> Self {
        Self {
            limits,
            bytes_used: 0,
            bytes_reserved: 0,
            objects: 0,
            objects_reserved: 0,
            bandwidth: IntervalCounter::default(),
            requests: IntervalCounter::default(),
            total_requests: 0,
            created_at: Utc::now(),
        }
    }

    /// Apply a signed delta, clamping at zero.
    pub fn apply(&mut self, bytes: i64, objects: i64) {
        self.bytes_used = add_signed(self.bytes_used, bytes);
        self.objects = add_signed(self.objects, objects);
    }

    pub fn snapshot(&mut self, tenant: &str, window: u64) -> TenantUsage {
        TenantUsage {
            tenant: tenant.to_string(),
            bytes_used: self.bytes_used,
            bytes_reserved: self.bytes_reserved,
            objects: self.objects,
            objects_reserved: self.objects_reserved,
            bandwidth_used: self.bandwidth.used(window),
            requests_in_window: self.requests.used(window),
            total_requests: self.total_requests,
            limits: self.limits,
            created_at: self.created_at,
        }
    }
}

pub(crate) fn add_signed(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

/// Point-in-time view of one tenant's usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantUsage {
    pub tenant: String,
    pub bytes_used: u64,
    pub bytes_reserved: u64,
    pub objects: u64,
    pub objects_reserved: u64,
    /// Bytes transferred in the current bandwidth interval.
    pub bandwidth_used: u64,
    pub requests_in_window: u64,
    pub total_requests: u64,
    pub limits: QuotaLimits,
    pub created_at: DateTime<Utc>,
}

impl TenantUsage {
    /// Fraction of the storage quota in use.
    pub fn storage_utilization(&self) -> f64 {
        if self.limits.max_bytes == 0 || self.limits.max_bytes == u64::MAX {
            return 0.0;
        }
        self.bytes_used as f64 / self.limits.max_bytes as f64
    }
}
