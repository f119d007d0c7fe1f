//! Anti-entropy state machine.
//!
//! Every gossip tick (2 s, jittered) a random peer receives the local
//! Merkle root. A root mismatch starts a descent: each reply carries 16
//! child hashes, mismatching interior children recurse one level down, and
//! mismatching leaves identify divergent buckets. Divergent buckets are
//! diffed key-by-key on byte-hash, and differing keys are repaired by
//! transporting `(metadata, value)` pairs that re-enter the engine as
//! remote mutations under last-writer-wins.
//!
//! The protocol is request/response driven; the tick is the only
//! self-scheduled event. Descent depth is bounded by the tree height, so a
//! divergent pair converges in O(buckets × 4) messages. Peer errors and
//! malformed messages never stop the loop.

use crate::core::clock::Timestamp;
use crate::core::error::EngineError;
use crate::engine::blob::DocBuffer;
use crate::engine::store::{Engine, Mutation, META_SUFFIX};
use crate::net::{Lane, Mesh, NodeId};
use crate::ops::metrics::EngineMetrics;
use crate::sync::wire::{self, Envelope, SyncMessage, NODE_CHILDREN};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Default gossip period.
pub const DEFAULT_GOSSIP_INTERVAL: Duration = Duration::from_millis(2000);

/// Maximum jitter applied to each tick, in either direction.
const GOSSIP_JITTER_MS: u64 = 250;

/// Tree depth at which children are leaf buckets.
const LEAF_LEVEL: u8 = 4;

/// Background reconciliation driver.
pub struct SyncManager<M: Mesh> {
    engine: Arc<Engine>,
    mesh: Arc<M>,
    metrics: Arc<EngineMetrics>,
    interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<M: Mesh> SyncManager<M> {
    /// Create a manager for `engine` gossiping over `mesh`.
    pub fn new(engine: Arc<Engine>, mesh: Arc<M>, interval: Duration) -> Arc<Self> {
        let metrics = engine.metrics().clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            engine,
            mesh,
            metrics,
            interval,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Spawn the gossip loop. Returns its join handle.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            info!(interval_ms = manager.interval.as_millis() as u64, "gossip loop started");
            let mut shutdown_rx = manager.shutdown_rx.clone();
            loop {
                let sleep = jittered(manager.interval);
                tokio::select! {
                    _ = tokio::time::sleep(sleep) => {
                        manager.trigger_gossip();
                    }
                    _ = shutdown_rx.changed() => {
                        info!("gossip loop stopped");
                        return;
                    }
                }
            }
        })
    }

    /// Signal the gossip loop to stop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Send one SYNC_INIT to a uniformly random active peer.
    pub fn trigger_gossip(&self) {
        let peers = self.mesh.active_peers();
        if peers.is_empty() {
            return;
        }
        let pick = pseudo_random() as usize % peers.len();
        self.initiate_sync(peers[pick]);
    }

    /// Open a sync round with a specific peer.
    pub fn initiate_sync(&self, peer: NodeId) {
        let root = self.engine.root_hash();
        self.send(peer, Lane::Control, &SyncMessage::Init { root });
    }

    /// Dispatch one incoming mesh payload.
    ///
    /// Safe to call concurrently from transport threads. Malformed
    /// payloads are dropped with a warning.
    pub fn handle_message(&self, payload: &[u8]) {
        let Some(Envelope { sender, message }) = wire::decode(payload) else {
            self.metrics.record_sync_malformed();
            warn!(len = payload.len(), "dropping malformed sync message");
            return;
        };
        self.metrics.record_sync_received();

        match message {
            SyncMessage::Init { root } => self.on_init(sender, root),
            SyncMessage::ReqNode { level, parent } => self.on_req_node(sender, level, parent),
            SyncMessage::RepNode {
                level,
                parent,
                children,
            } => self.on_rep_node(sender, level, parent, &children),
            SyncMessage::ReqBucket { bucket } => self.on_req_bucket(sender, bucket),
            SyncMessage::RepBucket { bucket, entries } => {
                self.on_rep_bucket(sender, bucket, entries)
            }
            SyncMessage::GetVal { key } => self.on_get_val(sender, &key),
            SyncMessage::PutVal { key, meta, value } => self.on_put_val(sender, key, meta, value),
        }
    }

    fn on_init(&self, from: NodeId, their_root: u64) {
        let my_root = self.engine.root_hash();
        if my_root == their_root {
            // In sync; the 8-byte exchange is the steady state.
            return;
        }
        debug!(peer = from, my_root, their_root, "merkle root mismatch; descending");
        self.send(
            from,
            Lane::Control,
            &SyncMessage::ReqNode { level: 1, parent: 0 },
        );
    }

    fn on_req_node(&self, from: NodeId, level: u8, parent: u32) {
        if level == 0 || level > LEAF_LEVEL {
            return;
        }
        // Force propagation so the reply is self-consistent.
        self.engine.root_hash();

        let mut children = [0u64; NODE_CHILDREN];
        for (i, child) in children.iter_mut().enumerate() {
            *child = self
                .engine
                .merkle_node(level, parent as usize * NODE_CHILDREN + i);
        }
        self.send(
            from,
            Lane::Control,
            &SyncMessage::RepNode {
                level,
                parent,
                children,
            },
        );
    }

    fn on_rep_node(&self, from: NodeId, level: u8, parent: u32, theirs: &[u64; NODE_CHILDREN]) {
        if level == 0 || level > LEAF_LEVEL {
            return;
        }
        self.engine.root_hash();

        for (i, their_hash) in theirs.iter().enumerate() {
            let child_idx = parent as usize * NODE_CHILDREN + i;
            let my_hash = self.engine.merkle_node(level, child_idx);
            if my_hash == *their_hash {
                continue;
            }
            if level == LEAF_LEVEL {
                self.metrics.record_divergent_bucket();
                self.send(
                    from,
                    Lane::Control,
                    &SyncMessage::ReqBucket {
                        bucket: child_idx as u32,
                    },
                );
            } else {
                self.send(
                    from,
                    Lane::Control,
                    &SyncMessage::ReqNode {
                        level: level + 1,
                        parent: child_idx as u32,
                    },
                );
            }
        }
    }

    fn on_req_bucket(&self, from: NodeId, bucket: u32) {
        if bucket > u32::from(u16::MAX) {
            return;
        }
        let entries = self.engine.bucket_keys(bucket as u16);
        self.send(
            from,
            Lane::Heavy,
            &SyncMessage::RepBucket { bucket, entries },
        );
    }

    fn on_rep_bucket(&self, from: NodeId, bucket: u32, entries: Vec<(String, u64)>) {
        debug!(peer = from, bucket, count = entries.len(), "bucket listing received");
        for (key, their_hash) in entries {
            let local = self.engine.get(&key);
            let my_hash = if local.is_empty() { 0 } else { local.byte_hash() };
            if my_hash != their_hash {
                self.metrics.record_value_requested();
                self.send(from, Lane::Heavy, &SyncMessage::GetVal { key });
            }
        }
    }

    fn on_get_val(&self, from: NodeId, key: &str) {
        let meta = self.engine.get(&format!("{key}{META_SUFFIX}"));
        if meta.is_empty() {
            // Nothing to offer; the peer may have a key we never saw.
            return;
        }
        let value = self.engine.get(key);
        self.send(
            from,
            Lane::Heavy,
            &SyncMessage::PutVal {
                key: key.to_owned(),
                meta: meta.bytes().to_vec(),
                value: value.bytes().to_vec(),
            },
        );
    }

    fn on_put_val(&self, from: NodeId, key: String, meta: Vec<u8>, value: Vec<u8>) {
        let meta_doc = DocBuffer::from_bytes(meta);
        let Some(timestamp) = parse_meta_timestamp(&meta_doc) else {
            self.metrics.record_sync_malformed();
            warn!(peer = from, key = %key, "value transfer with unparseable metadata; dropping");
            return;
        };
        let is_delete = meta_doc.get_bool("tombstone").unwrap_or(false);

        let mutation = Mutation {
            key,
            value,
            is_delete,
            timestamp,
        };
        match self.engine.apply_mutation(&mutation) {
            Ok(outcome) if outcome.is_applied() => {
                self.metrics.record_key_repaired();
            }
            Ok(_) => {}
            Err(EngineError::WalAppend(e)) => {
                warn!(key = %mutation.key, error = %e, "repair mutation failed to log");
            }
            Err(e) => {
                warn!(key = %mutation.key, error = %e, "repair mutation rejected");
            }
        }
    }

    fn send(&self, peer: NodeId, lane: Lane, message: &SyncMessage) {
        let payload = wire::encode(self.engine.node_id(), message);
        if self.mesh.send(peer, lane, payload) {
            self.metrics.record_sync_sent();
        } else {
            debug!(peer, "sync send to unknown peer dropped");
        }
    }
}

/// Parse the timestamp triple out of a metadata document. `ts` encoded as
/// a float is accepted.
fn parse_meta_timestamp(meta: &DocBuffer) -> Option<Timestamp> {
    let wall = meta.get_i64("ts")?;
    Some(Timestamp {
        wall,
        logical: meta.get_i64("l").unwrap_or(0) as u32,
        node: meta.get_i64("n").unwrap_or(0) as u32,
    })
}

/// Jitter an interval by up to ±250 ms using subsecond nanos as the
/// entropy source.
fn jittered(base: Duration) -> Duration {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let jitter = nanos % (2 * GOSSIP_JITTER_MS + 1);
    let base_ms = base.as_millis() as u64;
    Duration::from_millis(base_ms.saturating_sub(GOSSIP_JITTER_MS) + jitter)
}

fn pseudo_random() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64
}
