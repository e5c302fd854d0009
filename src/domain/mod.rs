//! Domain Layer
//!
//! Port traits and value objects shared between the core components and
//! the infrastructure adapters.
//!
//! # Usage
//!
//! ```ignore
//! use couchestor_edge::domain::ports::{BackingStore, PeerTransport};
//!
//! async fn persist<B: BackingStore>(store: &B, tenant: &str, key: &str, body: Bytes) -> Result<()> {
//!     store.put(tenant, key, body, 1).await?;
//!     Ok(())
//! }
//! ```

pub mod ports;

pub use ports::{
    BackingStore, Change, Labels, MetricsSink, NoopMetricsSink, ObjectMeta, PeerId, PeerTransport,
    ReplicationMessage,
};
