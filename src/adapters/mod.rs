//! Infrastructure Adapters
//!
//! Concrete implementations of the domain ports.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Ports (domain::ports)                         │
//! │      BackingStore    │    PeerTransport    │    MetricsSink      │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  InMemoryBackingStore │ HttpPeerTransport │ PrometheusSink       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use couchestor_edge::adapters::{HttpPeerTransport, InMemoryBackingStore, PrometheusSink};
//!
//! let store = Arc::new(InMemoryBackingStore::new());
//! let transport = Arc::new(HttpPeerTransport::new(&config.replication.peers, timeout)?);
//! let metrics = Arc::new(PrometheusSink::new("couchestor"));
//! ```

mod http_peer;
mod memory;
mod prometheus_sink;

pub use http_peer::{HttpPeerTransport, ORIGIN_HEADER, VERSION_HEADER};
pub use memory::{InMemoryBackingStore, MemoryStoreStats};
pub use prometheus_sink::PrometheusSink;
