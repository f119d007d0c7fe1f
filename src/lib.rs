//! L3KV - persistent, sharded, multi-master key-value store.
//!
//! L3KV accepts JSON-like document writes, in-place field patches, reads,
//! and deletes on its hot path, and propagates changes across a cluster
//! with eventual consistency. Writes are stamped by a hybrid logical clock
//! and resolved last-writer-wins; background anti-entropy compares Merkle
//! summaries between random peers and repairs divergent keys.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Frontend (external)                    │
//! │            routes via the consistent-hash ring                  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                             Engine                              │
//! │   64 shards │ document buffers │ HLC stamps │ LWW metadata      │
//! └─────────────────────────────────────────────────────────────────┘
//!              │                                      │
//! ┌─────────────────────────┐        ┌────────────────────────────────┐
//! │     Write-ahead log     │        │         Merkle summary         │
//! │  framed records + CRC   │        │  65,536 leaves, lazy recompute │
//! └─────────────────────────┘        └────────────────────────────────┘
//!                                                     │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                SyncManager  ◄──►  Peer mesh (4 lanes)           │
//! │        gossip tick │ Merkle descent │ bucket diff │ repair      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - [`core::clock`] - Hybrid logical clock and thread-local allocator
//! - [`core::config`] - TOML configuration
//! - [`core::error`] - Engine error taxonomy
//! - [`storage::wal`] - Write-ahead log with CRC framing and batches
//! - [`engine::blob`] - Document buffer capability
//! - [`engine::merkle`] - Merkle summary of the key space
//! - [`engine::store`] - Sharded store and mutation contracts
//! - [`sync::wire`] - Anti-entropy wire format
//! - [`sync::manager`] - Gossip state machine
//! - [`net`] - Peer mesh capability and TCP transport
//! - [`control::ring`] - Consistent-hash routing table
//! - [`ops::metrics`] - Process-wide counters
//! - [`cli`] - Command-line interface
//!
//! # Key Invariants
//!
//! - **HLC-MONOTONE**: timestamps from one clock are strictly increasing,
//!   and a received timestamp is dominated by every later local stamp
//! - **LWW**: a key's state is the mutation with the highest
//!   `(wall, logical, node)` triple, regardless of arrival order
//! - **WAL-FIRST**: in-memory state mutates only after the WAL append
//!   succeeds; recovery replays through the same apply path
//! - **BATCH-ATOMIC**: a WAL batch replays entirely or not at all
//! - **MERKLE-XOR**: every accepted mutation XORs its byte-hash delta into
//!   the key's bucket, so the root is order-independent
//! - **TOMBSTONE**: deletes persist as empty values plus flagged metadata
//!   and are never resurrected by older writes

pub mod cli;
pub mod control;
pub mod core;
pub mod engine;
pub mod net;
pub mod ops;
pub mod storage;
pub mod sync;

pub use crate::core::clock::{HybridLogicalClock, ThreadLocalClock, Timestamp};
pub use crate::core::config::Config;
pub use crate::core::error::{ApplyOutcome, EngineError, EngineResult};
pub use crate::engine::blob::DocBuffer;
pub use crate::engine::store::{Engine, Mutation};
pub use crate::net::{Lane, Mesh, NodeId};
