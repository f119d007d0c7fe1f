//! Node configuration.
//!
//! Loaded from a TOML file at startup and read-only afterwards. Peer
//! identity and ring membership are fixed for the process lifetime; there
//! is no hot reconfiguration.
//!
//! ```toml
//! [node]
//! id = 1
//! wal_path = "data/node1.wal"
//!
//! [mesh]
//! bind = "127.0.0.1:7401"
//! peers = [ { id = 2, addr = "127.0.0.1:7402" } ]
//!
//! [sync]
//! interval_ms = 2000
//!
//! [ring]
//! vnodes = 100
//! members = [1, 2]
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local node identity and storage.
    pub node: NodeConfig,

    /// Mesh transport settings.
    pub mesh: MeshSection,

    /// Anti-entropy settings.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Optional consistent-hash ring for sharded clusters.
    #[serde(default)]
    pub ring: Option<RingConfig>,
}

/// Local node settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Cluster-unique node id. Zero is reserved.
    pub id: u32,

    /// Path of this node's write-ahead log.
    pub wal_path: PathBuf,
}

/// Mesh transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshSection {
    /// Bind address for inbound peer connections.
    pub bind: String,

    /// Peers to dial at startup.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

/// One statically configured peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: u32,
    pub addr: String,
}

/// Anti-entropy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Gossip period in milliseconds.
    #[serde(default = "default_sync_interval_ms")]
    pub interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_sync_interval_ms(),
        }
    }
}

fn default_sync_interval_ms() -> u64 {
    2000
}

/// Consistent-hash ring settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingConfig {
    /// Virtual nodes per member.
    #[serde(default = "default_vnodes")]
    pub vnodes: u32,

    /// Member node ids (must include the local node).
    pub members: Vec<u32>,
}

fn default_vnodes() -> u32 {
    crate::control::ring::DEFAULT_VNODES
}

impl Config {
    /// Load and validate a configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {}", path.as_ref().display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.as_ref().display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.node.id == 0 {
            bail!("node.id must be nonzero");
        }
        if self.node.wal_path.as_os_str().is_empty() {
            bail!("node.wal_path must not be empty");
        }

        self.mesh
            .bind
            .parse::<SocketAddr>()
            .with_context(|| format!("mesh.bind is not a valid socket address: {}", self.mesh.bind))?;

        let mut seen = HashSet::new();
        for peer in &self.mesh.peers {
            if peer.id == self.node.id {
                bail!("mesh.peers must not contain the local node id {}", peer.id);
            }
            if !seen.insert(peer.id) {
                bail!("duplicate peer id {} in mesh.peers", peer.id);
            }
            peer.addr
                .parse::<SocketAddr>()
                .with_context(|| format!("peer {} address is invalid: {}", peer.id, peer.addr))?;
        }

        if self.sync.interval_ms < 100 {
            bail!("sync.interval_ms must be at least 100");
        }

        if let Some(ring) = &self.ring {
            if ring.members.is_empty() {
                bail!("ring.members must not be empty");
            }
            if !ring.members.contains(&self.node.id) {
                bail!("ring.members must include the local node id {}", self.node.id);
            }
            if ring.vnodes == 0 {
                bail!("ring.vnodes must be at least 1");
            }
        }

        Ok(())
    }

    /// Parsed mesh bind address. Only valid after [`Self::validate`].
    pub fn mesh_bind_addr(&self) -> Result<SocketAddr> {
        self.mesh
            .bind
            .parse()
            .with_context(|| format!("mesh.bind is not a valid socket address: {}", self.mesh.bind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        toml::from_str(
            r#"
[node]
id = 1
wal_path = "data/node1.wal"

[mesh]
bind = "127.0.0.1:7401"
"#,
        )
        .unwrap()
    }

    #[test]
    fn minimal_config_validates() {
        let config = minimal();
        config.validate().unwrap();
        assert_eq!(config.sync.interval_ms, 2000);
        assert!(config.ring.is_none());
    }

    #[test]
    fn zero_node_id_is_rejected() {
        let mut config = minimal();
        config.node.id = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_peer_ids_are_rejected() {
        let mut config = minimal();
        config.mesh.peers = vec![
            PeerConfig {
                id: 2,
                addr: "127.0.0.1:7402".into(),
            },
            PeerConfig {
                id: 2,
                addr: "127.0.0.1:7403".into(),
            },
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn ring_must_include_local_node() {
        let mut config = minimal();
        config.ring = Some(RingConfig {
            vnodes: 100,
            members: vec![2, 3],
        });
        assert!(config.validate().is_err());

        config.ring = Some(RingConfig {
            vnodes: 100,
            members: vec![1, 2, 3],
        });
        config.validate().unwrap();
    }
}
