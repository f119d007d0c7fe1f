//! Engine-wide counters.
//!
//! One [`EngineMetrics`] per process, created at startup and passed by
//! `Arc` into the engine, mesh, and sync manager. Counters are plain
//! relaxed atomics; [`EngineMetrics::snapshot`] produces a serialisable
//! point-in-time copy for the status surface.

use crate::net::Lane;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Local writes accepted (put).
    puts: AtomicU64,
    /// Local in-place patches accepted.
    patches: AtomicU64,
    /// Local deletes accepted.
    deletes: AtomicU64,
    /// Remote mutations applied.
    mutations_applied: AtomicU64,
    /// Remote mutations dropped as stale (lost last-writer-wins).
    mutations_stale: AtomicU64,
    /// Writes refused because another node owns the key.
    not_owner_rejections: AtomicU64,

    /// Sync messages sent, by direction.
    sync_sent: AtomicU64,
    /// Sync messages received and dispatched.
    sync_received: AtomicU64,
    /// Sync messages dropped as malformed.
    sync_malformed: AtomicU64,
    /// Divergent buckets detected during Merkle descent.
    divergent_buckets: AtomicU64,
    /// Values requested from peers after bucket diffing.
    values_requested: AtomicU64,
    /// Keys repaired by applying a peer's value.
    keys_repaired: AtomicU64,

    /// Mesh payload bytes sent, per lane.
    mesh_bytes_sent: [AtomicU64; 4],
    /// Mesh payload bytes received, per lane.
    mesh_bytes_received: [AtomicU64; 4],
}

impl EngineMetrics {
    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_patch(&self) {
        self.patches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mutation_applied(&self) {
        self.mutations_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mutation_stale(&self) {
        self.mutations_stale.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_not_owner(&self) {
        self.not_owner_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync_sent(&self) {
        self.sync_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync_received(&self) {
        self.sync_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync_malformed(&self) {
        self.sync_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_divergent_bucket(&self) {
        self.divergent_buckets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_value_requested(&self) {
        self.values_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_key_repaired(&self) {
        self.keys_repaired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mesh_sent(&self, lane: Lane, bytes: u64) {
        self.mesh_bytes_sent[lane as usize].fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_mesh_received(&self, lane: Lane, bytes: u64) {
        self.mesh_bytes_received[lane as usize].fetch_add(bytes, Ordering::Relaxed);
    }

    /// Number of stale mutations dropped so far.
    pub fn mutations_stale_count(&self) -> u64 {
        self.mutations_stale.load(Ordering::Relaxed)
    }

    /// Number of keys repaired so far.
    pub fn keys_repaired_count(&self) -> u64 {
        self.keys_repaired.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let lane_totals = |counters: &[AtomicU64; 4]| LaneBytes {
            control: counters[0].load(Ordering::Relaxed),
            express: counters[1].load(Ordering::Relaxed),
            standard: counters[2].load(Ordering::Relaxed),
            heavy: counters[3].load(Ordering::Relaxed),
        };

        MetricsSnapshot {
            puts: self.puts.load(Ordering::Relaxed),
            patches: self.patches.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            mutations_applied: self.mutations_applied.load(Ordering::Relaxed),
            mutations_stale: self.mutations_stale.load(Ordering::Relaxed),
            not_owner_rejections: self.not_owner_rejections.load(Ordering::Relaxed),
            sync_sent: self.sync_sent.load(Ordering::Relaxed),
            sync_received: self.sync_received.load(Ordering::Relaxed),
            sync_malformed: self.sync_malformed.load(Ordering::Relaxed),
            divergent_buckets: self.divergent_buckets.load(Ordering::Relaxed),
            values_requested: self.values_requested.load(Ordering::Relaxed),
            keys_repaired: self.keys_repaired.load(Ordering::Relaxed),
            mesh_bytes_sent: lane_totals(&self.mesh_bytes_sent),
            mesh_bytes_received: lane_totals(&self.mesh_bytes_received),
        }
    }
}

/// Per-lane byte totals.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LaneBytes {
    pub control: u64,
    pub express: u64,
    pub standard: u64,
    pub heavy: u64,
}

/// Serialisable copy of [`EngineMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub puts: u64,
    pub patches: u64,
    pub deletes: u64,
    pub mutations_applied: u64,
    pub mutations_stale: u64,
    pub not_owner_rejections: u64,
    pub sync_sent: u64,
    pub sync_received: u64,
    pub sync_malformed: u64,
    pub divergent_buckets: u64,
    pub values_requested: u64,
    pub keys_repaired: u64,
    pub mesh_bytes_sent: LaneBytes,
    pub mesh_bytes_received: LaneBytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = EngineMetrics::default();
        metrics.record_put();
        metrics.record_put();
        metrics.record_mutation_stale();
        metrics.record_mesh_sent(Lane::Control, 13);
        metrics.record_mesh_sent(Lane::Heavy, 100);

        let snap = metrics.snapshot();
        assert_eq!(snap.puts, 2);
        assert_eq!(snap.mutations_stale, 1);
        assert_eq!(snap.mesh_bytes_sent.control, 13);
        assert_eq!(snap.mesh_bytes_sent.heavy, 100);
        assert_eq!(snap.mesh_bytes_received.control, 0);
    }
}
