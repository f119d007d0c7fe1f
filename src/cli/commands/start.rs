//! The `start` command: run a node until interrupted.

use crate::cli::StartArgs;
use crate::control::ring::HashRing;
use crate::core::config::Config;
use crate::engine::store::Engine;
use crate::net::{Lane, MeshConfig, TcpMesh};
use crate::ops::metrics::EngineMetrics;
use crate::sync::manager::SyncManager;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Load the configuration and run the node.
///
/// Shutdown order on SIGINT/SIGTERM: stop the gossip loop, stop the mesh,
/// flush the WAL. Every record whose append succeeded is on disk when this
/// returns.
pub async fn run_start(args: StartArgs) -> Result<()> {
    let config = Config::from_file(&args.config)?;
    info!(node_id = config.node.id, "starting node");

    if let Some(parent) = config.node.wal_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create wal directory {}", parent.display()))?;
        }
    }

    let metrics = Arc::new(EngineMetrics::default());

    let ring = match &config.ring {
        Some(ring_config) => Some(Arc::new(HashRing::new(
            &ring_config.members,
            ring_config.vnodes,
        )?)),
        None => None,
    };

    let engine = Arc::new(Engine::open(
        &config.node.wal_path,
        config.node.id,
        ring,
        Arc::clone(&metrics),
    )?);

    let mesh = TcpMesh::bind(
        config.node.id,
        MeshConfig {
            bind_addr: config.mesh_bind_addr()?,
        },
        Arc::clone(&metrics),
    )
    .await?;

    for peer in &config.mesh.peers {
        let addr = peer
            .addr
            .parse()
            .with_context(|| format!("peer {} address is invalid: {}", peer.id, peer.addr))?;
        if let Err(e) = mesh.connect(peer.id, addr).await {
            // Peers come up in arbitrary order; the other side will dial us.
            warn!(peer = peer.id, error = %e, "initial peer dial failed");
        }
    }

    let sync = SyncManager::new(
        Arc::clone(&engine),
        Arc::clone(&mesh),
        Duration::from_millis(config.sync.interval_ms),
    );

    let dispatcher = Arc::clone(&sync);
    mesh.set_on_message(Arc::new(move |_from, lane, payload| {
        // The sync protocol runs on Control with bulk replies on Heavy.
        if matches!(lane, Lane::Control | Lane::Heavy) {
            dispatcher.handle_message(&payload);
        }
    }));

    let gossip_task = sync.start();

    info!("node running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("shutting down");
    sync.stop();
    let _ = gossip_task.await;
    mesh.shutdown();
    engine.flush().context("final wal flush failed")?;

    let wal_stats = engine.wal_stats();
    info!(
        records = wal_stats.records_appended,
        flushes = wal_stats.flushes,
        "shutdown complete"
    );
    Ok(())
}
