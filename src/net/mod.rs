//! Peer mesh networking.
//!
//! The engine core exchanges opaque byte payloads with its peers over a
//! lane-prioritised duplex channel. The transport is a capability: the sync
//! manager is generic over [`Mesh`], the TCP implementation lives in
//! [`mesh`], and tests substitute an in-memory transport.

pub mod mesh;

pub use mesh::{MeshConfig, TcpMesh};

/// Cluster-unique node identifier.
pub type NodeId = u32;

/// Priority class for a mesh message.
///
/// Control outranks Express outranks Standard outranks Heavy; the transport
/// must not head-of-line block Control traffic behind queued Heavy bulk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Lane {
    /// Gossip and cluster management.
    Control = 0,
    /// Latency-sensitive metadata.
    Express = 1,
    /// Regular traffic.
    Standard = 2,
    /// Bulk transfer.
    Heavy = 3,
}

impl Lane {
    /// Decode a lane from its wire value.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Control),
            1 => Some(Self::Express),
            2 => Some(Self::Standard),
            3 => Some(Self::Heavy),
            _ => None,
        }
    }

    /// Lane name for logs and metrics.
    pub fn name(self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Express => "express",
            Self::Standard => "standard",
            Self::Heavy => "heavy",
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Transport capability consumed by the sync manager.
///
/// Delivery is best-effort: no retries, no dedup, in-order within a lane
/// only. `send` returns `false` for unknown peers and the caller does not
/// retry.
pub trait Mesh: Send + Sync + 'static {
    /// Queue a payload to a peer on a lane. `false` if the peer is unknown.
    fn send(&self, peer: NodeId, lane: Lane, payload: Vec<u8>) -> bool;

    /// Peers currently reachable.
    fn active_peers(&self) -> Vec<NodeId>;
}
