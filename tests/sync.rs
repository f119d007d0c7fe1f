//! Multi-engine convergence over an in-memory mesh.
//!
//! These tests drive the full anti-entropy protocol (Merkle descent,
//! bucket diff, value repair) with deterministic message delivery instead
//! of TCP: every queued message is handed to the target's sync manager
//! until the mesh is quiescent.

mod common;

use common::{build_cluster, gossip_round, pump, MeshHub};
use std::time::Duration;

// ============================================================================
// Pairwise repair
// ============================================================================

#[test]
fn fresh_peer_pulls_everything() {
    let hub = MeshHub::new();
    let nodes = build_cluster(&hub, &[1, 2]);

    for i in 0..20 {
        nodes[0]
            .engine
            .put(&format!("user:{i}"), format!("{{\"v\":{i}}}").as_bytes())
            .unwrap();
    }
    assert_ne!(nodes[0].engine.root_hash(), nodes[1].engine.root_hash());

    // The receiver of SYNC_INIT descends into the initiator's tree and
    // pulls what it lacks, so node 1 announcing its root is what makes
    // node 2 fetch the missing keys. The reverse direction is a no-op.
    nodes[1].sync.initiate_sync(1);
    nodes[0].sync.initiate_sync(2);
    pump(&hub, &nodes);

    assert_eq!(nodes[0].engine.root_hash(), nodes[1].engine.root_hash());
    for i in 0..20 {
        assert_eq!(
            nodes[1].engine.get(&format!("user:{i}")).get_i64("v"),
            Some(i)
        );
    }
}

#[test]
fn identical_roots_exchange_one_message() {
    let hub = MeshHub::new();
    let nodes = build_cluster(&hub, &[1, 2]);

    nodes[0].engine.put("k", b"{\"v\":1}").unwrap();
    gossip_round(&hub, &nodes);
    assert_eq!(nodes[0].engine.root_hash(), nodes[1].engine.root_hash());

    let sent_before = nodes[0].engine.metrics().snapshot().sync_sent;
    nodes[0].sync.initiate_sync(2);
    pump(&hub, &nodes);
    let sent_after = nodes[0].engine.metrics().snapshot().sync_sent;

    // Steady state: a single 13-byte SYNC_INIT, no descent.
    assert_eq!(sent_after - sent_before, 1);
}

#[test]
fn conflicting_writes_resolve_to_the_highest_timestamp() {
    let hub = MeshHub::new();
    let nodes = build_cluster(&hub, &[1, 2]);

    nodes[0].engine.put("x", b"{\"v\":\"first\"}").unwrap();
    std::thread::sleep(Duration::from_millis(2));
    nodes[1].engine.put("x", b"{\"v\":\"second\"}").unwrap();

    for _ in 0..4 {
        gossip_round(&hub, &nodes);
    }

    for node in &nodes {
        assert_eq!(
            node.engine.get("x").get_str("v").as_deref(),
            Some("second"),
            "node {} did not converge",
            node.id
        );
    }
    assert_eq!(nodes[0].engine.root_hash(), nodes[1].engine.root_hash());
    assert_eq!(
        nodes[0].engine.local_timestamp("x"),
        nodes[1].engine.local_timestamp("x")
    );
}

// ============================================================================
// Split brain (three nodes)
// ============================================================================

#[test]
fn split_brain_converges_to_the_partitioned_writer() {
    let hub = MeshHub::new();
    let nodes = build_cluster(&hub, &[1, 2, 3]);

    // Everyone agrees on the initial value.
    nodes[0].engine.put("x", b"{\"v\":\"A\"}").unwrap();
    gossip_round(&hub, &nodes);
    for node in &nodes {
        assert_eq!(node.engine.get("x").get_str("v").as_deref(), Some("A"));
    }

    // Partition node 3, then write B at node 1 and, later, C at node 3.
    hub.partition(3);
    nodes[0].engine.put("x", b"{\"v\":\"B\"}").unwrap();
    std::thread::sleep(Duration::from_millis(50));
    nodes[2].engine.put("x", b"{\"v\":\"C\"}").unwrap();

    // Nodes 1 and 2 converge on B while 3 is cut off.
    gossip_round(&hub, &nodes[..2]);
    assert_eq!(nodes[1].engine.get("x").get_str("v").as_deref(), Some("B"));
    assert_eq!(nodes[2].engine.get("x").get_str("v").as_deref(), Some("C"));

    // Heal and gossip; C has the strictly greater timestamp and wins
    // everywhere.
    hub.heal(3);
    for _ in 0..10 {
        gossip_round(&hub, &nodes);
    }

    for node in &nodes {
        assert_eq!(
            node.engine.get("x").get_str("v").as_deref(),
            Some("C"),
            "node {} did not converge on C",
            node.id
        );
    }
    let root = nodes[0].engine.root_hash();
    assert_eq!(nodes[1].engine.root_hash(), root);
    assert_eq!(nodes[2].engine.root_hash(), root);
}

#[test]
fn tombstone_reaches_a_node_that_never_saw_the_value() {
    let hub = MeshHub::new();
    let nodes = build_cluster(&hub, &[1, 2]);

    // Node 1 creates and deletes the key before node 2 hears anything, so
    // node 2 receives only the tombstone.
    nodes[0].engine.put("ghost", b"{\"v\":1}").unwrap();
    nodes[0].engine.del("ghost").unwrap();

    for _ in 0..4 {
        gossip_round(&hub, &nodes);
    }

    assert!(nodes[1].engine.get("ghost").is_empty());
    assert!(nodes[1].engine.is_tombstoned("ghost"));
    assert_eq!(nodes[0].engine.root_hash(), nodes[1].engine.root_hash());

    // With equal roots the steady state is a single INIT per round.
    let sent_before = nodes[0].engine.metrics().snapshot().sync_sent;
    nodes[0].sync.initiate_sync(2);
    pump(&hub, &nodes);
    assert_eq!(nodes[0].engine.metrics().snapshot().sync_sent - sent_before, 1);
}

#[test]
fn tombstones_propagate_to_every_node() {
    let hub = MeshHub::new();
    let nodes = build_cluster(&hub, &[1, 2, 3]);

    nodes[0].engine.put("x", b"{\"v\":\"C\"}").unwrap();
    for _ in 0..3 {
        gossip_round(&hub, &nodes);
    }

    nodes[0].engine.del("x").unwrap();
    for _ in 0..5 {
        gossip_round(&hub, &nodes);
    }

    for node in &nodes {
        assert!(
            node.engine.get("x").is_empty(),
            "node {} still has a value",
            node.id
        );
        assert!(
            node.engine.is_tombstoned("x"),
            "node {} lost the tombstone",
            node.id
        );
    }
    let root = nodes[0].engine.root_hash();
    assert_eq!(nodes[1].engine.root_hash(), root);
    assert_eq!(nodes[2].engine.root_hash(), root);
}

// ============================================================================
// Robustness
// ============================================================================

#[test]
fn malformed_messages_are_dropped_silently() {
    let hub = MeshHub::new();
    let nodes = build_cluster(&hub, &[1, 2]);

    nodes[0].sync.handle_message(&[]);
    nodes[0].sync.handle_message(&[0x01]);
    nodes[0].sync.handle_message(&[0xFF, 1, 0, 0, 0, 9]);
    nodes[0].sync.handle_message(&[0x05, 1, 0, 0, 0, 1]);

    assert!(nodes[0].engine.metrics().snapshot().sync_malformed >= 3);

    // The manager still works afterwards.
    nodes[0].engine.put("k", b"{\"v\":1}").unwrap();
    gossip_round(&hub, &nodes);
    assert_eq!(nodes[1].engine.get("k").get_i64("v"), Some(1));
}

#[test]
fn convergence_survives_slow_links() {
    let hub = MeshHub::new();
    let nodes = build_cluster(&hub, &[1, 2]);
    hub.set_delivery_delay(Some(Duration::from_micros(200)));

    nodes[0].engine.put("slow:1", b"{\"v\":1}").unwrap();
    nodes[1].engine.put("slow:2", b"{\"v\":2}").unwrap();

    for _ in 0..4 {
        gossip_round(&hub, &nodes);
    }

    assert_eq!(nodes[0].engine.root_hash(), nodes[1].engine.root_hash());
    assert_eq!(nodes[1].engine.get("slow:1").get_i64("v"), Some(1));
    assert_eq!(nodes[0].engine.get("slow:2").get_i64("v"), Some(2));
}

#[test]
fn many_divergent_keys_converge() {
    let hub = MeshHub::new();
    let nodes = build_cluster(&hub, &[1, 2]);

    for i in 0..200 {
        nodes[0]
            .engine
            .put(&format!("left:{i}"), format!("{{\"v\":{i}}}").as_bytes())
            .unwrap();
        nodes[1]
            .engine
            .put(&format!("right:{i}"), format!("{{\"v\":{i}}}").as_bytes())
            .unwrap();
    }

    for _ in 0..6 {
        gossip_round(&hub, &nodes);
    }

    assert_eq!(nodes[0].engine.root_hash(), nodes[1].engine.root_hash());
    for i in 0..200 {
        assert_eq!(
            nodes[0].engine.get(&format!("right:{i}")).get_i64("v"),
            Some(i)
        );
        assert_eq!(
            nodes[1].engine.get(&format!("left:{i}")).get_i64("v"),
            Some(i)
        );
    }
    assert!(nodes[0].engine.metrics().keys_repaired_count() > 0);
}
