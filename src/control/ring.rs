//! Consistent-hash routing table.
//!
//! A stateless map from key to owning node id, used by the frontend to
//! redirect requests and by the engine to refuse writes for keys it does
//! not own. Each physical node contributes a number of virtual nodes
//! (default 100) to smooth the key distribution; membership is fixed at
//! construction.

use anyhow::{bail, Result};
use std::collections::BTreeMap;
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Default virtual nodes per physical node.
pub const DEFAULT_VNODES: u32 = 100;

/// Seed for ring position and key hashing. Part of the routing contract:
/// every node in a cluster must use the same seed.
const RING_HASH_SEED: u64 = 0;

fn ring_hash(bytes: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(RING_HASH_SEED);
    hasher.write(bytes);
    hasher.finish()
}

/// Immutable consistent-hash ring.
#[derive(Debug, Clone)]
pub struct HashRing {
    points: BTreeMap<u64, u32>,
    vnodes: u32,
    members: Vec<u32>,
}

impl HashRing {
    /// Build a ring over `members` with `vnodes` virtual nodes each.
    pub fn new(members: &[u32], vnodes: u32) -> Result<Self> {
        if members.is_empty() {
            bail!("hash ring requires at least one member node");
        }
        if vnodes == 0 {
            bail!("hash ring requires at least one virtual node per member");
        }

        let mut points = BTreeMap::new();
        let mut sorted: Vec<u32> = members.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        for &node in &sorted {
            for replica in 0..vnodes {
                let mut vnode_key = [0u8; 8];
                vnode_key[..4].copy_from_slice(&node.to_le_bytes());
                vnode_key[4..].copy_from_slice(&replica.to_le_bytes());
                points.insert(ring_hash(&vnode_key), node);
            }
        }

        Ok(Self {
            points,
            vnodes,
            members: sorted,
        })
    }

    /// Build a ring with the default virtual-node count.
    pub fn with_default_vnodes(members: &[u32]) -> Result<Self> {
        Self::new(members, DEFAULT_VNODES)
    }

    /// Owning node for a key: the first virtual node at or after the key's
    /// hash, wrapping around the ring.
    pub fn owner(&self, key: &[u8]) -> u32 {
        let h = ring_hash(key);
        self.points
            .range(h..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, node)| *node)
            .unwrap_or(0)
    }

    /// Member node ids, sorted.
    pub fn members(&self) -> &[u32] {
        &self.members
    }

    /// Virtual nodes per member.
    pub fn vnodes_per_member(&self) -> u32 {
        self.vnodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_membership_is_rejected() {
        assert!(HashRing::new(&[], DEFAULT_VNODES).is_err());
        assert!(HashRing::new(&[1], 0).is_err());
    }

    #[test]
    fn single_node_owns_everything() {
        let ring = HashRing::with_default_vnodes(&[7]).unwrap();
        for i in 0..100 {
            assert_eq!(ring.owner(format!("key:{i}").as_bytes()), 7);
        }
    }

    #[test]
    fn ownership_is_deterministic() {
        let a = HashRing::with_default_vnodes(&[1, 2, 3]).unwrap();
        let b = HashRing::with_default_vnodes(&[3, 1, 2]).unwrap();
        for i in 0..1000 {
            let key = format!("user:{i}");
            assert_eq!(a.owner(key.as_bytes()), b.owner(key.as_bytes()));
        }
    }

    #[test]
    fn keys_spread_across_members() {
        let ring = HashRing::with_default_vnodes(&[1, 2, 3]).unwrap();
        let mut counts: HashMap<u32, usize> = HashMap::new();
        for i in 0..3000 {
            *counts.entry(ring.owner(format!("k{i}").as_bytes())).or_default() += 1;
        }
        // With 100 vnodes each node should land well away from 0% and 100%.
        for node in [1, 2, 3] {
            let share = counts.get(&node).copied().unwrap_or(0);
            assert!(share > 300, "node {node} owns only {share}/3000 keys");
            assert!(share < 2000, "node {node} owns {share}/3000 keys");
        }
    }
}
