//! HTTP Peer Transport
//!
//! Ships replication messages to peers over HTTP. Every peer gets its own
//! connection pool: a fixed set of `reqwest` clients picked round-robin,
//! with a semaphore bounding concurrent requests. Peers speak HTTP/2 with
//! prior knowledge by default, so each client holds one multiplexed
//! connection and the semaphore allows `STREAMS_PER_CONNECTION` requests on
//! it. HTTP/1.1 peers get one request per client.
//!
//! # Wire Format
//!
//! ```text
//! PUT    {endpoint}/replicate/{tenant}/{key}   body = object bytes
//! DELETE {endpoint}/replicate/{tenant}/{key}
//!        x-object-version: <u64>
//!        x-origin-node:    <node id>
//! ```
//!
//! `409 Conflict` means the peer already holds a newer version and counts
//! as an acknowledgement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::domain::ports::{Change, PeerId, PeerTransport, ReplicationMessage};
use crate::error::{Error, Result};
use crate::replication::PeerConfig;

pub const VERSION_HEADER: &str = "x-object-version";
pub const ORIGIN_HEADER: &str = "x-origin-node";

/// Idle connections are closed after this long.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Concurrent requests allowed on one HTTP/2 connection.
const STREAMS_PER_CONNECTION: usize = 16;

/// Connection pool for one peer
struct PeerPool {
    endpoint: String,
    clients: Vec<Client>,
    next: AtomicUsize,
    permits: Semaphore,
    http2: bool,
}

impl PeerPool {
    fn new(peer: &PeerConfig, request_timeout: Duration) -> Result<Self> {
        let size = peer.connections.max(1);
        let clients = (0..size)
            .map(|_| {
                let builder = Client::builder()
                    .timeout(request_timeout)
                    .pool_idle_timeout(IDLE_TIMEOUT)
                    .pool_max_idle_per_host(1);
                let builder = if peer.http2 {
                    builder.http2_prior_knowledge()
                } else {
                    builder.http1_only()
                };
                builder
                    .build()
                    .map_err(|e| Error::Config(format!("peer {}: {}", peer.id, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let streams = if peer.http2 { STREAMS_PER_CONNECTION } else { 1 };
        Ok(Self {
            endpoint: peer.endpoint.trim_end_matches('/').to_string(),
            clients,
            next: AtomicUsize::new(0),
            permits: Semaphore::new(size * streams),
            http2: peer.http2,
        })
    }

    fn client(&self) -> &Client {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        &self.clients[i]
    }

    fn url(&self, message: &ReplicationMessage) -> String {
        format!(
            "{}/replicate/{}/{}",
            self.endpoint,
            urlencoding::encode(&message.tenant),
            urlencoding::encode(&message.key)
        )
    }
}

/// [`PeerTransport`] over HTTP with per-peer connection pools.
pub struct HttpPeerTransport {
    pools: RwLock<HashMap<PeerId, Arc<PeerPool>>>,
    request_timeout: Duration,
}

impl HttpPeerTransport {
    pub fn new(peers: &[PeerConfig], request_timeout: Duration) -> Result<Self> {
        let transport = Self {
            pools: RwLock::new(HashMap::new()),
            request_timeout,
        };
        for peer in peers {
            transport.add_peer(peer)?;
        }
        Ok(transport)
    }

    /// Register or replace the pool for a peer.
    pub fn add_peer(&self, peer: &PeerConfig) -> Result<()> {
        let pool = Arc::new(PeerPool::new(peer, self.request_timeout)?);
        info!(
            peer = %peer.id,
            endpoint = %pool.endpoint,
            connections = pool.clients.len(),
            http2 = pool.http2,
            "Peer connection pool created"
        );
        self.pools.write().insert(peer.peer_id(), pool);
        Ok(())
    }

    pub fn remove_peer(&self, peer: &PeerId) -> bool {
        self.pools.write().remove(peer).is_some()
    }

    pub fn peer_count(&self) -> usize {
        self.pools.read().len()
    }

    /// Request URL for a message, if the peer is known.
    pub fn url_for(&self, peer: &PeerId, message: &ReplicationMessage) -> Option<String> {
        self.pools.read().get(peer).map(|p| p.url(message))
    }
}

impl std::fmt::Debug for HttpPeerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPeerTransport")
            .field("peers", &self.peer_count())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[async_trait]
impl PeerTransport for HttpPeerTransport {
    async fn send(&self, peer: &PeerId, message: &ReplicationMessage) -> Result<()> {
        let pool = self
            .pools
            .read()
            .get(peer)
            .cloned()
            .ok_or_else(|| Error::Transport {
                peer: peer.to_string(),
                reason: "no connection pool for peer".into(),
            })?;

        let _permit = pool
            .permits
            .acquire()
            .await
            .map_err(|_| Error::ShuttingDown(format!("peer pool {} closed", peer)))?;

        let url = pool.url(message);
        let version = message.change.version().to_string();
        let request = match &message.change {
            Change::Put { value, .. } => pool.client().put(&url).body(value.clone()),
            Change::Delete { .. } => pool.client().delete(&url),
        }
        .header(VERSION_HEADER, version)
        .header(ORIGIN_HEADER, &message.origin);

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::timeout(format!("replicate to {}", peer), self.request_timeout)
            } else {
                Error::Transport {
                    peer: peer.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if status.is_success() || status == StatusCode::CONFLICT {
            debug!(peer = %peer, %status, key = %message.key, "Peer acknowledged");
            return Ok(());
        }
        Err(Error::Transport {
            peer: peer.to_string(),
            reason: format!("peer answered {}", status),
        })
    }
}
