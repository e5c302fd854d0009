//! Domain Ports (Port/Adapter Pattern)
//!
//! The hot-path core depends on three external collaborators. Each one is a
//! trait here; infrastructure adapters in [`crate::adapters`] provide the
//! concrete implementations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Core                                 │
//! │   ShardedCache │ TenantQuotaManager │ ReplicationEngine      │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │   BackingStore  │  PeerTransport  │  MetricsSink     │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  InMemoryBackingStore │ HttpPeerTransport │ PrometheusSink   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// Peer node identifier (value object).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Metadata describing a durably stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub tenant: String,
    pub key: String,
    pub size: u64,
    pub version: u64,
    pub modified: DateTime<Utc>,
}

/// A change shipped to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Put { value: Bytes, version: u64 },
    Delete { version: u64 },
}

impl Change {
    pub fn version(&self) -> u64 {
        match self {
            Change::Put { version, .. } | Change::Delete { version } => *version,
        }
    }

    pub fn payload_len(&self) -> u64 {
        match self {
            Change::Put { value, .. } => value.len() as u64,
            Change::Delete { .. } => 0,
        }
    }
}

/// Replication message sent from the local node to one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationMessage {
    pub tenant: String,
    pub key: String,
    pub change: Change,
    /// Node that originated the write.
    pub origin: String,
}

/// Metric label set: `(name, value)` pairs.
pub type Labels<'a> = &'a [(&'a str, &'a str)];

// =============================================================================
// Port Traits
// =============================================================================

/// Durable object storage behind the cache.
///
/// Keys are tenant-scoped: two tenants may hold the same key independently.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Durably store an object, replacing any previous value.
    async fn put(&self, tenant: &str, key: &str, value: Bytes, version: u64) -> Result<ObjectMeta>;

    /// Fetch an object's bytes.
    async fn get(&self, tenant: &str, key: &str) -> Result<Option<(Bytes, ObjectMeta)>>;

    /// Delete an object. Returns whether it existed.
    async fn delete(&self, tenant: &str, key: &str) -> Result<bool>;

    /// Fetch metadata without the body.
    async fn head(&self, tenant: &str, key: &str) -> Result<Option<ObjectMeta>>;

    /// List a tenant's objects whose key starts with `prefix`.
    async fn list(&self, tenant: &str, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Check backend reachability.
    async fn health_check(&self) -> Result<bool>;
}

/// Request/response channel to peer nodes.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Deliver one change to one peer. Returns once the peer has acknowledged.
    async fn send(&self, peer: &PeerId, message: &ReplicationMessage) -> Result<()>;
}

/// Sink for counters, gauges and histograms.
///
/// Calls are synchronous and must not block; implementations buffer or
/// update in-memory state only.
pub trait MetricsSink: Send + Sync {
    fn counter(&self, name: &str, labels: Labels<'_>, value: u64);

    fn gauge(&self, name: &str, labels: Labels<'_>, value: f64);

    fn histogram(&self, name: &str, labels: Labels<'_>, value: f64);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn counter(&self, _name: &str, _labels: Labels<'_>, _value: u64) {}

    fn gauge(&self, _name: &str, _labels: Labels<'_>, _value: f64) {}

    fn histogram(&self, _name: &str, _labels: Labels<'_>, _value: f64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id() {
        let id = PeerId::new("eu-west-1");
        assert_eq!(id.as_str(), "eu-west-1");
        assert_eq!(id.to_string(), "eu-west-1");
        assert_eq!(PeerId::from("eu-west-1"), id);
    }

    #[test]
    fn test_change_version_and_len() {
        let put = Change::Put {
            value: Bytes::from_static(b"hello"),
            version: 7,
        };
        assert_eq!(put.version(), 7);
        assert_eq!(put.payload_len(), 5);

        let del = Change::Delete { version: 9 };
        assert_eq!(del.version(), 9);
        assert_eq!(del.payload_len(), 0);
    }
}
