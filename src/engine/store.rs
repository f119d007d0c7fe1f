//! Sharded document store.
//!
//! 64 independent shards, each a reader/writer-locked map from key to
//! [`DocBuffer`]. Every user key has a metadata sibling stored under
//! `<key>:meta` holding the hybrid-logical-clock triple of the last
//! accepted mutation (plus a tombstone flag after a delete); the sibling is
//! sharded by its base key so a mutation touches exactly one shard.
//!
//! Mutation order per operation: stamp with the clock, append a WAL batch
//! (a failed append leaves memory untouched), apply in-memory under the
//! shard write lock while computing the old/new byte-hash delta, release
//! the lock, then XOR the delta into the Merkle summary. A reader may see a
//! new buffer before its bucket hash has propagated; anti-entropy
//! convergence covers the window.
//!
//! Deletes never remove entries: the value becomes the empty buffer and the
//! metadata records `tombstone: true`, so replays of older writes cannot
//! resurrect a deleted key.

use crate::control::ring::HashRing;
use crate::core::clock::{HybridLogicalClock, Timestamp};
use crate::core::error::{ApplyOutcome, EngineError, EngineResult};
use crate::engine::blob::DocBuffer;
use crate::engine::merkle::{bucket_of_key, fnv1a_64, MerkleSummary};
use crate::ops::metrics::EngineMetrics;
use crate::storage::wal::{BatchOp, WalOp, WalStatsSnapshot, WriteAheadLog};
use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Number of in-memory shards.
pub const SHARD_COUNT: usize = 64;

/// Suffix of metadata sibling keys.
pub const META_SUFFIX: &str = ":meta";

/// A replicated change to one key.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub key: String,
    /// Value bytes; empty together with `is_delete` for a tombstone.
    pub value: Vec<u8>,
    pub is_delete: bool,
    pub timestamp: Timestamp,
}

/// Whether a key is a metadata sibling.
pub fn is_meta_key(key: &str) -> bool {
    key.ends_with(META_SUFFIX)
}

/// Strip a metadata suffix, yielding the user key both entries share.
fn base_key(key: &str) -> &str {
    key.strip_suffix(META_SUFFIX).unwrap_or(key)
}

/// Canonical metadata document for a timestamp.
fn meta_document(ts: Timestamp, tombstone: bool) -> Vec<u8> {
    let value = if tombstone {
        json!({ "ts": ts.wall, "l": ts.logical, "n": ts.node, "tombstone": true })
    } else {
        json!({ "ts": ts.wall, "l": ts.logical, "n": ts.node })
    };
    DocBuffer::from_value(&value).bytes().to_vec()
}

struct Shard {
    map: RwLock<HashMap<String, DocBuffer>>,
}

/// Shards plus the Merkle summary: everything the WAL replay path and the
/// runtime mutation path share.
struct Store {
    shards: Vec<Shard>,
    merkle: MerkleSummary,
}

impl Store {
    fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| Shard {
                    map: RwLock::new(HashMap::new()),
                })
                .collect(),
            merkle: MerkleSummary::new(),
        }
    }

    fn shard(&self, key: &str) -> &Shard {
        let idx = (fnv1a_64(base_key(key).as_bytes()) % SHARD_COUNT as u64) as usize;
        &self.shards[idx]
    }

    fn get(&self, key: &str) -> DocBuffer {
        let map = self.shard(key).map.read();
        map.get(key).cloned().unwrap_or_default()
    }

    /// Overwrite a key with a request body.
    fn apply_put(&self, key: &str, body: &[u8]) {
        let mut map = self.shard(key).map.write();
        let old_hash = map.get(key).map(DocBuffer::byte_hash).unwrap_or(0);
        let buffer = DocBuffer::from_body(body);
        let new_hash = buffer.byte_hash();
        map.insert(key.to_owned(), buffer);
        drop(map);

        if !is_meta_key(key) {
            self.merkle.apply_delta(key.as_bytes(), old_hash ^ new_hash);
        }
    }

    fn apply_patch_i64(&self, key: &str, field: &str, value: i64) {
        let mut map = self.shard(key).map.write();
        // Absent hashes as 0, not as the empty buffer's hash; read before
        // the entry is materialised.
        let old_hash = map.get(key).map(DocBuffer::byte_hash).unwrap_or(0);
        let entry = map.entry(key.to_owned()).or_default();
        entry.set_i64(field, value);
        let new_hash = entry.byte_hash();
        drop(map);

        if !is_meta_key(key) {
            self.merkle.apply_delta(key.as_bytes(), old_hash ^ new_hash);
        }
    }

    /// Apply a string patch.
    ///
    /// On a metadata sibling the payload value is a `wall:logical:node`
    /// triple and the whole metadata document is rebuilt from it (a patch
    /// is a write, so any tombstone flag is cleared); the field name only
    /// records which user field the patch touched. On a user key this is a
    /// plain field write.
    fn apply_patch_str(&self, key: &str, field: &str, value: &str) {
        if is_meta_key(key) {
            match parse_timestamp_triple(value) {
                Some(ts) => self.apply_put(key, &meta_document(ts, false)),
                None => warn!(key, field, "malformed metadata patch payload; skipping"),
            }
            return;
        }

        let mut map = self.shard(key).map.write();
        let old_hash = map.get(key).map(DocBuffer::byte_hash).unwrap_or(0);
        let entry = map.entry(key.to_owned()).or_default();
        entry.set_str(field, value);
        let new_hash = entry.byte_hash();
        drop(map);

        self.merkle.apply_delta(key.as_bytes(), old_hash ^ new_hash);
    }

    /// Replace a value with the empty buffer (tombstone body).
    fn apply_delete(&self, key: &str) {
        let mut map = self.shard(key).map.write();
        let old_hash = map.get(key).map(DocBuffer::byte_hash).unwrap_or(0);
        let buffer = DocBuffer::empty();
        let new_hash = buffer.byte_hash();
        map.insert(key.to_owned(), buffer);
        drop(map);

        if !is_meta_key(key) {
            self.merkle.apply_delta(key.as_bytes(), old_hash ^ new_hash);
        }
    }

    /// Route one recovered WAL record through the runtime apply path.
    ///
    /// Malformed records are skipped with a warning; recovery never aborts.
    fn replay(&self, op: WalOp, key: &[u8], payload: &[u8]) {
        let key = match std::str::from_utf8(key) {
            Ok(k) => k,
            Err(_) => {
                warn!("wal record with non-utf8 key; skipping");
                return;
            }
        };

        match op {
            WalOp::Put => self.apply_put(key, payload),
            WalOp::Delete => self.apply_delete(key),
            WalOp::PatchI64 => match parse_patch_payload(payload) {
                Some((field, value)) => match value.parse::<i64>() {
                    Ok(v) => self.apply_patch_i64(key, field, v),
                    Err(_) => warn!(key, "malformed integer patch payload; skipping"),
                },
                None => warn!(key, "malformed patch payload; skipping"),
            },
            WalOp::PatchStr => match parse_patch_payload(payload) {
                Some((field, value)) => self.apply_patch_str(key, field, value),
                None => warn!(key, "malformed patch payload; skipping"),
            },
            WalOp::Batch => {
                // Recovery flattens batches before dispatching.
                warn!(key, "unexpected nested batch record; skipping");
            }
        }
    }
}

/// Split a `field ":" value` patch payload.
fn parse_patch_payload(payload: &[u8]) -> Option<(&str, &str)> {
    std::str::from_utf8(payload).ok()?.split_once(':')
}

/// Parse a `wall:logical:node` triple.
fn parse_timestamp_triple(s: &str) -> Option<Timestamp> {
    let mut parts = s.splitn(3, ':');
    let wall = parts.next()?.parse().ok()?;
    let logical = parts.next()?.parse().ok()?;
    let node = parts.next()?.parse().ok()?;
    Some(Timestamp {
        wall,
        logical,
        node,
    })
}

/// The engine: sharded store, WAL, clock, and Merkle summary.
pub struct Engine {
    store: Store,
    wal: WriteAheadLog,
    clock: Arc<HybridLogicalClock>,
    ring: Option<Arc<HashRing>>,
    metrics: Arc<EngineMetrics>,
    node_id: u32,
}

impl Engine {
    /// Open the engine, replaying the WAL at `wal_path` into memory.
    ///
    /// Fails if the WAL cannot be opened for writing or is locked by
    /// another engine instance.
    pub fn open<P: AsRef<Path>>(
        wal_path: P,
        node_id: u32,
        ring: Option<Arc<HashRing>>,
        metrics: Arc<EngineMetrics>,
    ) -> Result<Self> {
        let store = Store::new();
        let wal = WriteAheadLog::open(&wal_path, |op, key, payload| {
            store.replay(op, key, payload);
        })
        .with_context(|| {
            format!(
                "failed to initialise wal at {}",
                wal_path.as_ref().display()
            )
        })?;

        Ok(Self {
            store,
            wal,
            clock: Arc::new(HybridLogicalClock::new(node_id)),
            ring,
            metrics,
            node_id,
        })
    }

    /// This node's id.
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// The engine's clock. Shared so transports can fold received
    /// timestamps into it.
    pub fn clock(&self) -> &Arc<HybridLogicalClock> {
        &self.clock
    }

    /// Read a key. Returns a cheap clone of the stored buffer; empty iff
    /// the key is absent or tombstoned.
    pub fn get(&self, key: &str) -> DocBuffer {
        self.store.get(key)
    }

    /// Write a full value.
    pub fn put(&self, key: &str, body: &[u8]) -> EngineResult<Timestamp> {
        self.check_owner(key)?;
        let ts = self.clock.now();
        let meta_key = format!("{key}{META_SUFFIX}");
        let meta = meta_document(ts, false);

        self.wal.append_batch(&[
            BatchOp::put(key.as_bytes(), body),
            BatchOp::put(meta_key.as_bytes(), meta.as_slice()),
        ])?;

        self.store.apply_put(key, body);
        self.store.apply_put(&meta_key, &meta);
        self.metrics.record_put();
        Ok(ts)
    }

    /// Patch one integer field in place.
    pub fn patch_int(&self, key: &str, field: &str, value: i64) -> EngineResult<Timestamp> {
        self.check_owner(key)?;
        let ts = self.clock.now();
        let meta_key = format!("{key}{META_SUFFIX}");
        let ts_triple = format!("{}:{}:{}", ts.wall, ts.logical, ts.node);

        self.wal.append_batch(&[
            BatchOp::patch_i64(key.as_bytes(), field, value),
            BatchOp::patch_str(meta_key.as_bytes(), field, &ts_triple),
        ])?;

        self.store.apply_patch_i64(key, field, value);
        self.store.apply_patch_str(&meta_key, field, &ts_triple);
        self.metrics.record_patch();
        Ok(ts)
    }

    /// Patch one string field in place.
    pub fn patch_str(&self, key: &str, field: &str, value: &str) -> EngineResult<Timestamp> {
        self.check_owner(key)?;
        let ts = self.clock.now();
        let meta_key = format!("{key}{META_SUFFIX}");
        let ts_triple = format!("{}:{}:{}", ts.wall, ts.logical, ts.node);

        self.wal.append_batch(&[
            BatchOp::patch_str(key.as_bytes(), field, value),
            BatchOp::patch_str(meta_key.as_bytes(), field, &ts_triple),
        ])?;

        self.store.apply_patch_str(key, field, value);
        self.store.apply_patch_str(&meta_key, field, &ts_triple);
        self.metrics.record_patch();
        Ok(ts)
    }

    /// Delete a key, leaving a tombstone.
    pub fn del(&self, key: &str) -> EngineResult<Timestamp> {
        self.check_owner(key)?;
        let ts = self.clock.now();
        let meta_key = format!("{key}{META_SUFFIX}");
        let meta = meta_document(ts, true);

        self.wal.append_batch(&[
            BatchOp::delete(key.as_bytes()),
            BatchOp::put(meta_key.as_bytes(), meta.as_slice()),
        ])?;

        self.store.apply_delete(key);
        self.store.apply_put(&meta_key, &meta);
        self.metrics.record_delete();
        Ok(ts)
    }

    /// Apply a remote mutation under last-writer-wins.
    ///
    /// The mutation's timestamp is folded into the clock first (receive
    /// event), then compared against the key's local metadata; mutations
    /// that are not strictly newer are dropped. Re-applying an already
    /// accepted mutation is therefore a no-op.
    pub fn apply_mutation(&self, m: &Mutation) -> EngineResult<ApplyOutcome> {
        self.clock.update(m.timestamp);

        let local = self.local_timestamp(&m.key);
        if m.timestamp <= local {
            debug!(key = %m.key, incoming = %m.timestamp, local = %local, "dropping stale mutation");
            self.metrics.record_mutation_stale();
            return Ok(ApplyOutcome::Stale);
        }

        let meta_key = format!("{}{META_SUFFIX}", m.key);
        let meta = meta_document(m.timestamp, m.is_delete);

        let user_op = if m.is_delete {
            BatchOp::delete(m.key.as_bytes())
        } else {
            BatchOp::put(m.key.as_bytes(), m.value.as_slice())
        };
        self.wal
            .append_batch(&[user_op, BatchOp::put(meta_key.as_bytes(), meta.as_slice())])?;

        if m.is_delete {
            self.store.apply_delete(&m.key);
        } else {
            self.store.apply_put(&m.key, &m.value);
        }
        self.store.apply_put(&meta_key, &meta);
        self.metrics.record_mutation_applied();
        Ok(ApplyOutcome::Applied)
    }

    /// The metadata timestamp of a key; zero when absent.
    pub fn local_timestamp(&self, key: &str) -> Timestamp {
        let meta = self.store.get(&format!("{key}{META_SUFFIX}"));
        read_meta_timestamp(&meta).unwrap_or(Timestamp::ZERO)
    }

    /// Whether a key is currently tombstoned.
    pub fn is_tombstoned(&self, key: &str) -> bool {
        let meta = self.store.get(&format!("{key}{META_SUFFIX}"));
        meta.get_bool("tombstone").unwrap_or(false)
    }

    /// Current Merkle root. Forces propagation of pending leaf updates.
    pub fn root_hash(&self) -> u64 {
        self.store.merkle.root()
    }

    /// Cached Merkle node hash. Call [`Self::root_hash`] first when the
    /// value must be consistent with a peer exchange.
    pub fn merkle_node(&self, level: u8, index: usize) -> u64 {
        self.store.merkle.node(level, index)
    }

    /// Enumerate user keys in a Merkle bucket with their byte-hashes.
    ///
    /// Tombstoned entries are included (their empty-body hash participates
    /// in divergence detection); metadata siblings are not.
    pub fn bucket_keys(&self, bucket: u16) -> Vec<(String, u64)> {
        let mut result = Vec::new();
        for shard in &self.store.shards {
            let map = shard.map.read();
            for (key, buffer) in map.iter() {
                if is_meta_key(key) {
                    continue;
                }
                if bucket_of_key(key.as_bytes()) == bucket {
                    result.push((key.clone(), buffer.byte_hash()));
                }
            }
        }
        result
    }

    /// Whether this node owns `key`. Always true without a ring.
    pub fn is_owner(&self, key: &str) -> bool {
        match &self.ring {
            Some(ring) => ring.owner(key.as_bytes()) == self.node_id,
            None => true,
        }
    }

    /// Drain the WAL buffer and sync to disk.
    pub fn flush(&self) -> std::io::Result<()> {
        self.wal.flush()
    }

    /// WAL counters.
    pub fn wal_stats(&self) -> WalStatsSnapshot {
        self.wal.stats()
    }

    /// Shared metrics handle.
    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    fn check_owner(&self, key: &str) -> EngineResult<()> {
        if let Some(ring) = &self.ring {
            let owner = ring.owner(key.as_bytes());
            if owner != self.node_id {
                self.metrics.record_not_owner();
                return Err(EngineError::NotOwner {
                    key: key.to_owned(),
                    owner,
                });
            }
        }
        Ok(())
    }
}

/// Read the `ts`/`l`/`n` triple out of a metadata document.
///
/// Integers encoded as floats are accepted (JSON-only producers).
fn read_meta_timestamp(meta: &DocBuffer) -> Option<Timestamp> {
    if meta.is_empty() {
        return None;
    }
    let wall = meta.get_i64("ts")?;
    let logical = meta.get_i64("l").unwrap_or(0) as u32;
    let node = meta.get_i64("n").unwrap_or(0) as u32;
    Some(Timestamp {
        wall,
        logical,
        node,
    })
}
