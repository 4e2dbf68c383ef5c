//! Abstraction over replica-to-replica RPCs.
//!
//! Concrete implementation lives in `quorumkv-net::replica_client`.

use quorumkv_common::{NodeId, Peer, VersionVector};
use quorumkv_storage::VersionedEntry;
use serde::{Deserialize, Serialize};

/// One replication attempt of an entry to a follower.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationRequest {
    pub request_id: String,
    pub entry: VersionedEntry,
    /// Leadership epoch of the sender. Opaque to the core.
    pub generation_id: u64,
}

impl ReplicationRequest {
    pub fn new(entry: VersionedEntry, generation_id: u64) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            entry,
            generation_id,
        }
    }
}

/// A follower's answer to a [`ReplicationRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationResponse {
    pub request_id: String,
    pub success: bool,
    pub node_id: NodeId,
    pub version: Option<VersionVector>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ReplicaError {
    #[error("replica unreachable: {0}")]
    Unreachable(String),
    #[error("timeout")]
    Timeout,
    #[error("RPC failed: {0}")]
    RpcFailed(String),
    #[error("replica rejected write: {0}")]
    Rejected(String),
    #[error("circuit open for node {0}")]
    CircuitOpen(NodeId),
}

/// Transport for replica RPCs (replicate, health probe).
///
/// A trait in the domain crate with an HTTP implementation in the `net`
/// crate, so coordinators can be driven by in-memory or chaos clients.
#[async_trait::async_trait]
pub trait ReplicaClient: Send + Sync + 'static {
    /// Send a versioned entry to a follower. `Ok` means the follower
    /// stored it.
    async fn replicate(
        &self,
        target: &Peer,
        request: &ReplicationRequest,
    ) -> Result<ReplicationResponse, ReplicaError>;

    /// Probe a node's health endpoint. `Ok(true)` when it reports `UP`.
    async fn health(&self, target: &Peer) -> Result<bool, ReplicaError>;
}
