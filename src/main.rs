//! CoucheStor Edge Node
//!
//! Wires the hot-path core to an in-memory backing store, HTTP peer
//! replication and a Prometheus registry, then serves it over HTTP.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        couchestor-edge                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │   HTTP server ──► ObjectService ──► ShardedCache                 │
//! │                        │        ──► TenantQuotaManager           │
//! │                        │        ──► WorkerPool                   │
//! │                        └──────────► ReplicationEngine ──► peers  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use couchestor_edge::adapters::{HttpPeerTransport, InMemoryBackingStore, PrometheusSink};
use couchestor_edge::config::CoreConfig;
use couchestor_edge::server::{Router, Server};
use couchestor_edge::service::ObjectService;

// =============================================================================
// CLI Arguments
// =============================================================================

/// CoucheStor Edge - cache, quota and replication node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, short, env = "EDGE_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP bind address (overrides service.listen_addr)
    #[arg(long, env = "LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// Node identifier (overrides replication.node_id)
    #[arg(long, env = "NODE_ID")]
    node_id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let mut config = match &args.config {
        Some(path) => CoreConfig::load(path)?,
        None => CoreConfig::default(),
    };
    if let Some(addr) = &args.listen_addr {
        config.service.listen_addr = addr.clone();
    }
    if let Some(node_id) = &args.node_id {
        config.replication.node_id = node_id.clone();
    }
    config.validate().context("invalid configuration")?;

    if args.print_config {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }

    info!("Starting CoucheStor Edge");
    info!("  Node: {}", config.replication.node_id);
    info!("  Cache shards: {}", config.cache.shard_count);
    info!(
        "  Workers: {}-{} (queue {})",
        config.workers.min_workers, config.workers.max_workers, config.workers.queue_capacity
    );
    info!("  Peers: {}", config.replication.peers.len());

    let metrics = Arc::new(PrometheusSink::new(config.service.metrics_namespace.clone()));
    let transport = Arc::new(
        HttpPeerTransport::new(&config.replication.peers, config.replication.request_timeout())
            .context("failed to build peer transport")?,
    );
    let store = Arc::new(InMemoryBackingStore::new());

    let listen_addr = config.service.listen_addr.clone();
    let maintenance = config.service.maintenance_interval();
    let service = Arc::new(
        ObjectService::new(config, store, transport, metrics.clone())
            .context("failed to build object service")?,
    );

    let shutdown = CancellationToken::new();
    let server = Server::bind(&listen_addr, Router::new(service.clone(), metrics))
        .await
        .with_context(|| format!("failed to bind {}", listen_addr))?;
    let server_task = tokio::spawn(server.serve(shutdown.clone()));

    if let Some(interval) = maintenance {
        let service = service.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        service.maintain();
                        for task in service.replication().drain_abandoned() {
                            warn!(task = %task.id, key = %task.key, "Replication abandoned");
                        }
                    }
                }
            }
        });
    }

    service.readiness().set_ready(true);
    info!("Node ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    shutdown.cancel();
    let report = service.shutdown().await;
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("HTTP server error: {}", e),
        Err(e) => error!("HTTP server task failed: {}", e),
    }

    if report.pool.dropped > 0 {
        warn!(dropped = report.pool.dropped, "Tasks dropped during shutdown");
    }
    for task in &report.abandoned {
        warn!(
            tenant = %task.tenant,
            key = %task.key,
            version = task.version,
            reason = %task.reason,
            "Change not replicated before shutdown"
        );
    }
    info!("Node shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}
