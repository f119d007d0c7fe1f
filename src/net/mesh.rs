//! TCP mesh transport.
//!
//! One duplex TCP connection per peer. A connection opens with a one-time
//! `[node_id:u32 le]` identification, then carries frames of
//! `[lane:u32 le][len:u32 le][body]`. Outbound payloads are queued per
//! lane and drained by a single writer task whose biased select always
//! prefers Control over Express over Standard over Heavy, so queued bulk
//! transfer cannot starve gossip.
//!
//! Delivery is best-effort on top of TCP: no retries, no dedup, no
//! cross-lane ordering. Incoming frames are handed to the registered
//! callback from the connection's reader task; the callback must be safe
//! to invoke concurrently.

use crate::net::{Lane, Mesh, NodeId};
use crate::ops::metrics::EngineMetrics;
use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Upper bound on a single frame body (64 MiB); larger frames indicate a
/// corrupt or hostile peer and close the connection.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Callback invoked for each received payload.
pub type MessageCallback = Arc<dyn Fn(NodeId, Lane, Vec<u8>) + Send + Sync>;

/// Mesh transport configuration.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Local bind address for inbound peers.
    pub bind_addr: SocketAddr,
}

struct PeerHandle {
    /// Connection generation, so tasks of a replaced connection do not
    /// deregister their successor.
    serial: u64,
    lanes: [UnboundedSender<Vec<u8>>; 4],
}

/// TCP implementation of the [`Mesh`] capability.
pub struct TcpMesh {
    node_id: NodeId,
    local_addr: SocketAddr,
    peers: RwLock<HashMap<NodeId, PeerHandle>>,
    on_message: RwLock<Option<MessageCallback>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    next_serial: AtomicU64,
    metrics: Arc<EngineMetrics>,
}

impl TcpMesh {
    /// Bind the listener and start accepting inbound peers.
    pub async fn bind(
        node_id: NodeId,
        config: MeshConfig,
        metrics: Arc<EngineMetrics>,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .with_context(|| format!("failed to bind mesh listener on {}", config.bind_addr))?;
        let local_addr = listener
            .local_addr()
            .context("failed to read mesh listener address")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mesh = Arc::new(Self {
            node_id,
            local_addr,
            peers: RwLock::new(HashMap::new()),
            on_message: RwLock::new(None),
            shutdown_tx,
            shutdown_rx,
            next_serial: AtomicU64::new(1),
            metrics,
        });

        let accept_mesh = Arc::clone(&mesh);
        tokio::spawn(async move {
            accept_mesh.accept_loop(listener).await;
        });

        info!(node_id, addr = %local_addr, "mesh listening");
        Ok(mesh)
    }

    /// Dial a peer and register the connection under its id.
    pub async fn connect(self: &Arc<Self>, peer_id: NodeId, addr: SocketAddr) -> Result<()> {
        let mut stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to peer {peer_id} at {addr}"))?;
        let _ = stream.set_nodelay(true);

        stream
            .write_all(&self.node_id.to_le_bytes())
            .await
            .context("failed to send identification preamble")?;

        self.register_connection(peer_id, stream);
        info!(peer_id, %addr, "mesh peer connected");
        Ok(())
    }

    /// Register the callback receiving inbound payloads.
    pub fn set_on_message(&self, callback: MessageCallback) {
        *self.on_message.write() = Some(callback);
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the accept loop and all connection tasks.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.peers.write().clear();
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((mut stream, addr)) => {
                            let _ = stream.set_nodelay(true);
                            // Inbound handshake off the accept path, so an
                            // unidentified peer cannot stall new connections.
                            let mesh = Arc::clone(&self);
                            tokio::spawn(async move {
                                let mut id_bytes = [0u8; 4];
                                match stream.read_exact(&mut id_bytes).await {
                                    Ok(_) => {
                                        let peer_id = u32::from_le_bytes(id_bytes);
                                        info!(peer_id, %addr, "mesh peer accepted");
                                        mesh.register_connection(peer_id, stream);
                                    }
                                    Err(e) => {
                                        warn!(%addr, error = %e, "peer closed before identifying");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "mesh accept failed");
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        }
                    }
                }
                _ = shutdown_rx.changed() => return,
            }
        }
    }

    fn register_connection(self: &Arc<Self>, peer_id: NodeId, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();

        let mut lanes_tx = Vec::with_capacity(4);
        let mut lanes_rx = Vec::with_capacity(4);
        for _ in 0..4 {
            let (tx, rx) = unbounded_channel();
            lanes_tx.push(tx);
            lanes_rx.push(rx);
        }
        let lanes: [UnboundedSender<Vec<u8>>; 4] = match lanes_tx.try_into() {
            Ok(lanes) => lanes,
            Err(_) => return,
        };

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        self.peers
            .write()
            .insert(peer_id, PeerHandle { serial, lanes });

        let writer_mesh = Arc::clone(self);
        tokio::spawn(async move {
            writer_mesh
                .write_loop(peer_id, serial, write_half, lanes_rx)
                .await;
        });

        let reader_mesh = Arc::clone(self);
        tokio::spawn(async move {
            reader_mesh.read_loop(peer_id, serial, read_half).await;
        });
    }

    /// Drop a peer registration, but only if it still belongs to the
    /// connection generation that failed.
    fn deregister(&self, peer_id: NodeId, serial: u64) {
        let mut peers = self.peers.write();
        if peers.get(&peer_id).is_some_and(|h| h.serial == serial) {
            peers.remove(&peer_id);
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        peer_id: NodeId,
        serial: u64,
        mut write_half: OwnedWriteHalf,
        mut lanes: Vec<UnboundedReceiver<Vec<u8>>>,
    ) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let (mut heavy, mut standard, mut express, mut control) = match (
            lanes.pop(),
            lanes.pop(),
            lanes.pop(),
            lanes.pop(),
        ) {
            (Some(a), Some(b), Some(c), Some(d)) => (a, b, c, d),
            _ => return,
        };

        loop {
            // Biased select: Control always drains first. A closed lane
            // means the peer was replaced or the mesh shut down.
            let (lane, payload) = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => return,
                p = control.recv() => match p {
                    Some(p) => (Lane::Control, p),
                    None => return,
                },
                p = express.recv() => match p {
                    Some(p) => (Lane::Express, p),
                    None => return,
                },
                p = standard.recv() => match p {
                    Some(p) => (Lane::Standard, p),
                    None => return,
                },
                p = heavy.recv() => match p {
                    Some(p) => (Lane::Heavy, p),
                    None => return,
                },
            };

            let bytes = payload.len() as u64;
            let mut frame = Vec::with_capacity(8 + payload.len());
            frame.extend_from_slice(&(lane as u32).to_le_bytes());
            frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            frame.extend_from_slice(&payload);

            if let Err(e) = write_half.write_all(&frame).await {
                debug!(peer_id, error = %e, "mesh write failed; dropping peer");
                self.deregister(peer_id, serial);
                return;
            }
            self.metrics.record_mesh_sent(lane, bytes);
        }
    }

    async fn read_loop(self: Arc<Self>, peer_id: NodeId, serial: u64, mut read_half: OwnedReadHalf) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            let mut header = [0u8; 8];
            let read = tokio::select! {
                r = read_half.read_exact(&mut header) => r,
                _ = shutdown_rx.changed() => return,
            };
            if read.is_err() {
                debug!(peer_id, "mesh connection closed");
                self.deregister(peer_id, serial);
                return;
            }

            let lane_raw = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

            if len > MAX_FRAME_LEN {
                warn!(peer_id, len, "oversized mesh frame; dropping peer");
                self.deregister(peer_id, serial);
                return;
            }

            let mut body = vec![0u8; len as usize];
            if read_half.read_exact(&mut body).await.is_err() {
                debug!(peer_id, "mesh connection closed mid-frame");
                self.deregister(peer_id, serial);
                return;
            }

            let Some(lane) = Lane::from_u32(lane_raw) else {
                warn!(peer_id, lane = lane_raw, "unknown mesh lane; dropping frame");
                continue;
            };

            self.metrics.record_mesh_received(lane, body.len() as u64);
            let callback = self.on_message.read().clone();
            if let Some(cb) = callback {
                cb(peer_id, lane, body);
            }
        }
    }
}

impl Mesh for TcpMesh {
    fn send(&self, peer: NodeId, lane: Lane, payload: Vec<u8>) -> bool {
        let peers = self.peers.read();
        let Some(handle) = peers.get(&peer) else {
            return false;
        };
        handle.lanes[lane as usize].send(payload).is_ok()
    }

    fn active_peers(&self) -> Vec<NodeId> {
        self.peers.read().keys().copied().collect()
    }
}
