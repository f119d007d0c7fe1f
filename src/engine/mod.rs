//! The storage engine: document buffers, the sharded store, and the
//! Merkle summary used for anti-entropy.

pub mod blob;
pub mod merkle;
pub mod store;
