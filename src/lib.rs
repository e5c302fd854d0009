//! CoucheStor Edge - Hot-Path Core for an S3-Compatible Object Store
//!
//! The in-memory layer that sits in front of durable object storage on every
//! node: a sharded tiered cache, per-tenant quota enforcement, a bounded
//! self-scaling worker pool and asynchronous replication to peer nodes.
//!
//! # Architecture
//!
//! ```text
//! request ──► ObjectService
//!               │  admit ──────────► TenantQuotaManager
//!               │  get / put ──────► ShardedCache (Hot → Warm → Cold)
//!               │  persist ────────► WorkerPool ──► BackingStore
//!               └  enqueue ────────► ReplicationEngine ──► WorkerPool ──► peers
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Infrastructure adapters implementing domain ports
//! - [`cache`] - Sharded Hot/Warm/Cold cache
//! - [`config`] - YAML node configuration
//! - [`domain`] - Port traits and value objects
//! - [`error`] - Error types
//! - [`monitoring`] - Health checks and an in-process metrics collector
//! - [`replication`] - Asynchronous peer replication
//! - [`server`] - HTTP endpoints
//! - [`service`] - Read and write control flows
//! - [`tenant`] - Per-tenant quotas
//! - [`workers`] - Bounded auto-scaling worker pool

pub mod adapters;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod monitoring;
pub mod replication;
pub mod server;
pub mod service;
pub mod tenant;
pub mod workers;

// Re-export commonly used types
pub use cache::{CacheConfig, Lookup, ShardedCache, Tier};
pub use config::CoreConfig;
pub use error::{Error, ErrorKind, Result};
pub use replication::{ReplicationConfig, ReplicationEngine, ReplicationStatus};
pub use service::{
    ObjectRead, ObjectService, OpContext, PutReceipt, ReadSource, ServiceConfig, ServiceShutdown,
};
pub use tenant::{Operation, QuotaConfig, QuotaLimits, TenantQuotaManager, TenantUsage};
pub use workers::{WorkerPool, WorkerPoolConfig};
