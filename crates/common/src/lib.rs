//! quorumkv-common: shared types for the quorumkv project.
//!
//! Provides replica identifiers, partition identifiers, the static
//! `Peer` descriptor and the [`VersionVector`] used for causality tracking.

pub mod version_vector;

pub use version_vector::{Causality, VersionVector};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::net::SocketAddr;

// ---------------------------------------------------------------------------
// NodeId
// ---------------------------------------------------------------------------

/// Identifier of a replica node (e.g. `"n1"`). Also the key used in
/// version vectors.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// PartitionId
// ---------------------------------------------------------------------------

/// Identifier of a data partition. Hints are filed under one and
/// reconciliation runs per partition.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(String);

impl PartitionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PartitionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Debug for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartitionId({})", self.0)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

/// A statically configured replica: its id and the address its HTTP
/// server listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl Peer {
    pub fn new(id: impl Into<NodeId>, addr: SocketAddr) -> Self {
        Self {
            id: id.into(),
            addr,
        }
    }

    /// A peer with a placeholder address, for in-process tests where the
    /// transport never dials.
    pub fn with_dummy_addr(id: impl Into<NodeId>) -> Self {
        Self::new(id, SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    /// Base URL of the peer's HTTP API.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Pick the partition a key belongs to: SHA-1 of the key, first 8 bytes
/// read big-endian, modulo the partition count. `None` if there are no
/// partitions.
pub fn partition_for_key<'a>(key: &str, partitions: &'a [PartitionId]) -> Option<&'a PartitionId> {
    if partitions.is_empty() {
        return None;
    }
    let hash = Sha1::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash[..8]);
    let idx = u64::from_be_bytes(prefix) % partitions.len() as u64;
    partitions.get(idx as usize)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
