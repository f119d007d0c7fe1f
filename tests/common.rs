//! Common test utilities.
//!
//! Shared helpers for integration tests: engine builders backed by temp
//! directories and an in-memory mesh hub for multi-node scenarios.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use l3kv::engine::store::Engine;
use l3kv::net::{Lane, Mesh, NodeId};
use l3kv::ops::metrics::EngineMetrics;
use l3kv::sync::manager::SyncManager;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Open an engine on a fresh WAL inside `dir`.
pub fn open_engine(dir: &TempDir, node_id: u32) -> Arc<Engine> {
    open_engine_at(dir, node_id, "node.wal")
}

/// Open an engine on a named WAL inside `dir`, so restarts can reuse it.
pub fn open_engine_at(dir: &TempDir, node_id: u32, file: &str) -> Arc<Engine> {
    Arc::new(
        Engine::open(
            dir.path().join(file),
            node_id,
            None,
            Arc::new(EngineMetrics::default()),
        )
        .expect("failed to open engine"),
    )
}

/// A queued, undelivered mesh message.
pub type QueuedMessage = (NodeId, Lane, Vec<u8>);

/// Shared state of the in-memory mesh: per-node inbound queues and the set
/// of partitioned nodes.
#[derive(Default)]
pub struct MeshHub {
    queues: Mutex<HashMap<NodeId, VecDeque<QueuedMessage>>>,
    partitioned: Mutex<HashSet<NodeId>>,
    /// Optional per-message delivery delay, for latency experiments.
    delivery_delay: Mutex<Option<Duration>>,
}

impl MeshHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a node and hand back its mesh endpoint.
    pub fn join(self: &Arc<Self>, node: NodeId) -> Arc<HubMesh> {
        self.queues.lock().entry(node).or_default();
        Arc::new(HubMesh {
            node,
            hub: Arc::clone(self),
        })
    }

    /// Drop all traffic to and from `node` until healed.
    pub fn partition(&self, node: NodeId) {
        self.partitioned.lock().insert(node);
    }

    /// Restore traffic for `node`.
    pub fn heal(&self, node: NodeId) {
        self.partitioned.lock().remove(&node);
    }

    /// Delay every delivered message by `delay`.
    pub fn set_delivery_delay(&self, delay: Option<Duration>) {
        *self.delivery_delay.lock() = delay;
    }

    fn is_partitioned(&self, node: NodeId) -> bool {
        self.partitioned.lock().contains(&node)
    }

    /// Pop one queued message for any node.
    fn pop(&self) -> Option<(NodeId, QueuedMessage)> {
        let mut queues = self.queues.lock();
        for (node, queue) in queues.iter_mut() {
            if let Some(message) = queue.pop_front() {
                return Some((*node, message));
            }
        }
        None
    }
}

/// One node's view of the in-memory mesh.
pub struct HubMesh {
    node: NodeId,
    hub: Arc<MeshHub>,
}

impl Mesh for HubMesh {
    fn send(&self, peer: NodeId, lane: Lane, payload: Vec<u8>) -> bool {
        let mut queues = self.hub.queues.lock();
        let Some(queue) = queues.get_mut(&peer) else {
            return false;
        };
        // Best-effort delivery: a partition silently eats the message.
        if !self.hub.is_partitioned(self.node) && !self.hub.is_partitioned(peer) {
            queue.push_back((self.node, lane, payload));
        }
        true
    }

    fn active_peers(&self) -> Vec<NodeId> {
        self.hub
            .queues
            .lock()
            .keys()
            .copied()
            .filter(|&n| n != self.node)
            .collect()
    }
}

/// A cluster node for sync tests.
pub struct TestNode {
    pub id: NodeId,
    pub engine: Arc<Engine>,
    pub sync: Arc<SyncManager<HubMesh>>,
    _dir: TempDir,
}

/// Build a cluster of engines joined through one hub.
pub fn build_cluster(hub: &Arc<MeshHub>, ids: &[NodeId]) -> Vec<TestNode> {
    ids.iter()
        .map(|&id| {
            let dir = TempDir::new().expect("failed to create temp dir");
            let engine = open_engine(&dir, id);
            let mesh = hub.join(id);
            let sync = SyncManager::new(
                Arc::clone(&engine),
                mesh,
                Duration::from_millis(2000),
            );
            TestNode {
                id,
                engine,
                sync,
                _dir: dir,
            }
        })
        .collect()
}

/// Deliver queued messages until the mesh is quiescent.
///
/// Handlers send follow-up messages synchronously, so this drains the
/// request/response cascade of a full sync round. The iteration cap guards
/// against a protocol that fails to converge.
pub fn pump(hub: &Arc<MeshHub>, nodes: &[TestNode]) {
    let by_id: HashMap<NodeId, &TestNode> = nodes.iter().map(|n| (n.id, n)).collect();
    for _ in 0..1_000_000 {
        let Some((target, (_from, _lane, payload))) = hub.pop() else {
            return;
        };
        if let Some(delay) = *hub.delivery_delay.lock() {
            std::thread::sleep(delay);
        }
        if let Some(node) = by_id.get(&target) {
            node.sync.handle_message(&payload);
        }
    }
    panic!("mesh did not quiesce; sync protocol is not converging");
}

/// One full gossip round: every node initiates a sync with every peer, and
/// the resulting cascade is drained.
pub fn gossip_round(hub: &Arc<MeshHub>, nodes: &[TestNode]) {
    for node in nodes {
        for peer in nodes {
            if node.id != peer.id {
                node.sync.initiate_sync(peer.id);
            }
        }
    }
    pump(hub, nodes);
}
