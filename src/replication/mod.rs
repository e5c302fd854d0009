//! Asynchronous Cross-Node Replication
//!
//! Local writes are acknowledged before replication runs. Each accepted
//! change becomes a [`ReplicationTask`] that the engine ships to every peer
//! through the worker pool.
//!
//! # Task Lifecycle
//!
//! ```text
//! enqueue ─► Queued ─► Sending ──all peers acked──► Completed
//!               ▲         │
//!               │         └─ some peer failed ─► Backoff ─(delay)─┐
//!               └─────────────────────────────────────────────────┘
//!                          attempts == max_attempts ─► Abandoned
//! ```
//!
//! Abandonment happens once per task: it is logged, counted and handed out
//! by [`ReplicationEngine::drain_abandoned`] exactly once.

mod backoff;
mod circuit;
mod engine;
mod task;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use backoff::Backoff;
pub use circuit::{BreakerState, CircuitBreaker};
pub use engine::{ReplicationEngine, ReplicationStatus, SHUTDOWN_REASON};
pub use task::{AbandonedTask, ReplicationTask, TaskId, TaskState, TaskStatus};

use crate::domain::ports::PeerId;
use crate::error::{Error, Result};

/// A replication target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    /// Base URL, e.g. `http://10.0.0.2:9100`
    pub endpoint: String,
    /// Pooled connections to keep for this peer
    #[serde(default = "default_connections")]
    pub connections: usize,
    /// Speak HTTP/2 without upgrade negotiation so each pooled connection
    /// multiplexes concurrent sends
    #[serde(default = "default_http2")]
    pub http2: bool,
}

fn default_connections() -> usize {
    4
}

fn default_http2() -> bool {
    true
}

impl PeerConfig {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            connections: default_connections(),
            http2: default_http2(),
        }
    }

    /// Fall back to HTTP/1.1 for peers behind proxies that lack HTTP/2.
    pub fn with_http1(mut self) -> Self {
        self.http2 = false;
        self
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::new(self.id.clone())
    }
}

/// Per-peer circuit breaker thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Successes in half-open state that close it again
    pub success_threshold: u32,
    /// Time the circuit stays open before a trial send is allowed
    pub open_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 3,
            open_timeout_ms: 10_000,
        }
    }
}

impl BreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

/// Replication engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Identifier stamped on outgoing messages as their origin
    pub node_id: String,
    pub peers: Vec<PeerConfig>,
    /// Attempts per task, the first one included
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Deadline for a single send to a single peer
    pub request_timeout_ms: u64,
    /// Outstanding tasks beyond which enqueue applies backpressure
    pub max_in_flight: usize,
    /// Finished task records kept for `task_status`
    pub history: usize,
    /// Keys whose last acknowledgement lag is kept for `last_ack_lag`
    pub ack_history: usize,
    /// Lag above which health reports degraded
    pub lag_degraded_ms: u64,
    pub breaker: BreakerConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            node_id: "local".to_string(),
            peers: Vec::new(),
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            request_timeout_ms: 5_000,
            max_in_flight: 10_000,
            history: 1024,
            ack_history: 65_536,
            lag_degraded_ms: 30_000,
            breaker: BreakerConfig::default(),
        }
    }
}

impl ReplicationConfig {
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn with_peer(mut self, peer: PeerConfig) -> Self {
        self.peers.push(peer);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.initial_backoff_ms = initial_ms;
        self.max_backoff_ms = max_ms;
        self
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    pub fn with_ack_history(mut self, keys: usize) -> Self {
        self.ack_history = keys;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn lag_degraded(&self) -> Duration {
        Duration::from_millis(self.lag_degraded_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            self.backoff_multiplier,
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("replication.max_attempts must be at least 1".into()));
        }
        if self.max_in_flight == 0 {
            return Err(Error::Config("replication.max_in_flight must be at least 1".into()));
        }
        if self.ack_history == 0 {
            return Err(Error::Config("replication.ack_history must be at least 1".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::Config(
                "replication.request_timeout_ms must be non-zero".into(),
            ));
        }
        if !(self.backoff_multiplier >= 1.0) {
            return Err(Error::Config(
                "replication.backoff_multiplier must be at least 1.0".into(),
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(Error::Config(
                "replication.initial_backoff_ms exceeds max_backoff_ms".into(),
            ));
        }
        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return Err(Error::Config("replication.breaker thresholds must be non-zero".into()));
        }
        let mut ids: Vec<&str> = self.peers.iter().map(|p| p.id.as_str()).collect();
        ids.sort_unstable();
        if let Some(dup) = ids.windows(2).find(|w| w[0] == w[1]) {
            return Err(Error::Config(format!("duplicate replication peer '{}'", dup[0])));
        }
        if let Some(peer) = self.peers.iter().find(|p| p.connections == 0) {
            return Err(Error::Config(format!(
                "replication peer '{}' needs at least one connection",
                peer.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ReplicationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.breaker.failure_threshold, 10);
    }

    #[test]
    fn test_duplicate_peers_rejected() {
        let config = ReplicationConfig::default()
            .with_peer(PeerConfig::new("b", "http://b"))
            .with_peer(PeerConfig::new("b", "http://b2"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        assert!(ReplicationConfig::default()
            .with_backoff(500, 100)
            .validate()
            .is_err());
        let config = ReplicationConfig {
            backoff_multiplier: 0.5,
            ..ReplicationConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
node_id: edge-1
max_attempts: 3
peers:
  - id: edge-2
    endpoint: http://10.0.0.2:9100
  - id: edge-3
    endpoint: http://10.0.0.3:9100
    connections: 8
"#;
        let config: ReplicationConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.node_id, "edge-1");
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.peers[0].connections, 4);
        assert_eq!(config.peers[1].connections, 8);
        assert!(config.peers[0].http2);
        assert_eq!(config.initial_backoff_ms, 100);
        assert!(config.validate().is_ok());
    }
}
