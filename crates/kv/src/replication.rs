//! Replication coordinator: drives a write to the configured replica set
//! under a write quorum.
//!
//! The coordinator:
//! 1. Writes locally (the local write is one acknowledgement)
//! 2. Sends the versioned entry to every follower in parallel
//! 3. Waits for all followers or the replication deadline, whichever is first
//! 4. Counts each follower once, at its first observed successful completion
//! 5. Hands followers that did not acknowledge to the hint manager
//! 6. Reports quorum success or shortfall (never a hard error once the
//!    local write has succeeded)

use crate::hint_manager::HintManager;
use crate::replica_client::{ReplicaClient, ReplicationRequest, ReplicationResponse};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use quorumkv_common::{partition_for_key, NodeId, PartitionId, Peer, VersionVector};
use quorumkv_storage::{NodeStatus, StorageEngine, StorageError, VersionedEntry};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

/// Quorum and replication configuration.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Replication factor (N), counting the local node.
    pub replication_factor: usize,
    /// Acknowledgements needed, local write included (W).
    pub write_quorum: usize,
    /// Deadline for the follower fan-out.
    pub timeout: Duration,
    /// Whether to store hints for followers that missed the write.
    pub hinted_handoff: bool,
    /// Epoch stamped on outgoing replication requests.
    pub generation_id: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            write_quorum: 2,
            timeout: Duration::from_secs(5),
            hinted_handoff: true,
            generation_id: 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] StorageError),
    #[error("quorum not reached: need {needed}, got {got}")]
    QuorumNotReached { needed: usize, got: usize },
}

/// Result of a client write through the coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct WriteOutcome {
    pub quorum_reached: bool,
    /// Acknowledgements, local write included.
    pub acks: usize,
    pub required: usize,
    pub version_vector: VersionVector,
    pub entry: VersionedEntry,
    /// Followers a hint was stored for.
    pub hinted: Vec<NodeId>,
}

impl WriteOutcome {
    /// Turn a quorum shortfall into [`KvError::QuorumNotReached`].
    pub fn into_result(self) -> Result<Self, KvError> {
        if self.quorum_reached {
            Ok(self)
        } else {
            Err(KvError::QuorumNotReached {
                needed: self.required,
                got: self.acks,
            })
        }
    }
}

/// Follower outcomes of one fan-out.
#[derive(Debug, Default)]
struct FanOut {
    acked: Vec<NodeId>,
    hinted: Vec<NodeId>,
}

/// Replication coordinator for one node.
///
/// Generic over `R: ReplicaClient` for testability; real deployment uses
/// `HttpReplicaClient`, unit tests use a mock.
pub struct ReplicationCoordinator<R: ReplicaClient> {
    node_id: NodeId,
    storage: Arc<RwLock<StorageEngine>>,
    followers: Vec<Peer>,
    partitions: Vec<PartitionId>,
    client: Arc<R>,
    config: ReplicationConfig,
    hints: Option<Arc<HintManager<R>>>,
}

impl<R: ReplicaClient> std::fmt::Debug for ReplicationCoordinator<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationCoordinator")
            .field("node_id", &self.node_id)
            .field("followers", &self.followers)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<R: ReplicaClient> ReplicationCoordinator<R> {
    pub fn new(
        node_id: NodeId,
        storage: Arc<RwLock<StorageEngine>>,
        followers: Vec<Peer>,
        partitions: Vec<PartitionId>,
        client: Arc<R>,
        config: ReplicationConfig,
    ) -> Self {
        let mut followers = followers;
        let max_followers = config.replication_factor.saturating_sub(1);
        if followers.len() > max_followers {
            tracing::warn!(
                "{} peers configured but N={}; replicating to the first {} only",
                followers.len(),
                config.replication_factor,
                max_followers
            );
            followers.truncate(max_followers);
        }
        Self {
            node_id,
            storage,
            followers,
            partitions,
            client,
            config,
            hints: None,
        }
    }

    /// Attach a hint manager for hinted handoff.
    pub fn with_hint_manager(mut self, hints: Arc<HintManager<R>>) -> Self {
        self.hints = Some(hints);
        self
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Client write
    // -----------------------------------------------------------------------

    /// Coordinate a client write: merge-and-increment locally, then
    /// replicate the new entry to every follower.
    pub async fn write(
        &self,
        key: &str,
        value: &str,
        client_vector: Option<&VersionVector>,
    ) -> Result<WriteOutcome, KvError> {
        quorumkv_metrics::metrics().writes.inc();
        let _timer = quorumkv_metrics::start_replication_timer();

        let entry = {
            let mut storage = self.storage.write().await;
            storage.write_entry(key, value, client_vector)?
        };

        let fan_out = self
            .fan_out(&entry, &self.followers, self.config.generation_id)
            .await;
        let acks = 1 + fan_out.acked.len();
        let quorum_reached = self.record_outcome(acks);

        Ok(WriteOutcome {
            quorum_reached,
            acks,
            required: self.config.write_quorum,
            version_vector: entry.version_vector.clone(),
            entry,
            hinted: fan_out.hinted,
        })
    }

    // -----------------------------------------------------------------------
    // Replicate
    // -----------------------------------------------------------------------

    /// Store `entry` locally, then replicate it to `followers`. Returns
    /// whether the write quorum was reached.
    ///
    /// Only a local storage failure is an error. Follower failures reduce
    /// the acknowledgement count and become hints.
    pub async fn replicate(
        &self,
        entry: &VersionedEntry,
        followers: &[Peer],
        generation_id: u64,
    ) -> Result<bool, KvError> {
        let _timer = quorumkv_metrics::start_replication_timer();

        {
            let mut storage = self.storage.write().await;
            storage.apply(entry.clone())?;
        }
        let local_successes = 1;

        if followers.is_empty() {
            return Ok(self.record_outcome(local_successes));
        }

        let fan_out = self.fan_out(entry, followers, generation_id).await;
        Ok(self.record_outcome(local_successes + fan_out.acked.len()))
    }

    /// Follower side of `/replicate`: store the entry verbatim. Never
    /// replicates further.
    pub async fn handle_incoming_replication(
        &self,
        request: &ReplicationRequest,
    ) -> ReplicationResponse {
        quorumkv_metrics::metrics()
            .rpcs_received
            .with_label_values(&["replicate"])
            .inc();

        let result = {
            let mut storage = self.storage.write().await;
            storage.apply(request.entry.clone())
        };

        match result {
            Ok(stored) => {
                tracing::debug!(
                    request_id = %request.request_id,
                    generation = request.generation_id,
                    key = %request.entry.key,
                    duplicate = !stored,
                    "accepted replicated entry"
                );
                ReplicationResponse {
                    request_id: request.request_id.clone(),
                    success: true,
                    node_id: self.node_id.clone(),
                    version: Some(request.entry.version_vector.clone()),
                }
            }
            Err(e) => {
                tracing::warn!(
                    request_id = %request.request_id,
                    "failed to store replicated entry: {}",
                    e
                );
                ReplicationResponse {
                    request_id: request.request_id.clone(),
                    success: false,
                    node_id: self.node_id.clone(),
                    version: None,
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Reads and introspection
    // -----------------------------------------------------------------------

    /// All local versions of a key, most recent first.
    pub async fn read(&self, key: &str) -> Vec<VersionedEntry> {
        quorumkv_metrics::metrics().reads.inc();
        self.storage.read().await.read(key)
    }

    pub async fn list_keys(&self) -> Vec<String> {
        self.storage.read().await.list_keys()
    }

    pub async fn status(&self) -> NodeStatus {
        self.storage.read().await.status()
    }

    // -----------------------------------------------------------------------
    // Internal: fan-out
    // -----------------------------------------------------------------------

    /// Send `entry` to every follower and wait for all of them or the
    /// deadline. Calls still running at the deadline are abandoned.
    async fn fan_out(&self, entry: &VersionedEntry, followers: &[Peer], generation_id: u64) -> FanOut {
        if followers.is_empty() {
            return FanOut::default();
        }

        let request = ReplicationRequest::new(entry.clone(), generation_id);
        let deadline = tokio::time::Instant::now() + self.config.timeout;
        let mut futs = FuturesUnordered::new();

        for peer in followers {
            let client = self.client.clone();
            let peer = peer.clone();
            let request = request.clone();
            futs.push(tokio::spawn(async move {
                let result = client.replicate(&peer, &request).await;
                (peer.id, result)
            }));
        }

        let mut acked: HashSet<NodeId> = HashSet::new();
        let mut record = |joined: Result<(NodeId, Result<ReplicationResponse, _>), tokio::task::JoinError>| {
            match joined {
                Ok((node, Ok(resp))) if resp.success => {
                    quorumkv_metrics::record_replica_rpc("replicate", true);
                    acked.insert(node);
                }
                Ok((node, Ok(_))) => {
                    quorumkv_metrics::record_replica_rpc("replicate", false);
                    tracing::debug!("replica {} refused entry for '{}'", node, entry.key);
                }
                Ok((node, Err(e))) => {
                    quorumkv_metrics::record_replica_rpc("replicate", false);
                    tracing::debug!("replication to {} failed: {}", node, e);
                }
                Err(e) => tracing::warn!("replication task panicked: {}", e),
            }
        };

        loop {
            match tokio::time::timeout_at(deadline, futs.next()).await {
                Ok(Some(joined)) => record(joined),
                Ok(None) => break,
                Err(_) => {
                    // Deadline: take whatever already finished, once.
                    while let Some(Some(joined)) = futs.next().now_or_never() {
                        record(joined);
                    }
                    if !futs.is_empty() {
                        tracing::debug!(
                            "replication deadline hit for '{}': abandoning {} call(s)",
                            entry.key,
                            futs.len()
                        );
                    }
                    break;
                }
            }
        }

        let missed: Vec<&Peer> = followers.iter().filter(|p| !acked.contains(&p.id)).collect();
        let hinted = self.hint_missed(&request, &missed).await;

        FanOut {
            acked: followers
                .iter()
                .filter(|p| acked.contains(&p.id))
                .map(|p| p.id.clone())
                .collect(),
            hinted,
        }
    }

    async fn hint_missed(&self, request: &ReplicationRequest, missed: &[&Peer]) -> Vec<NodeId> {
        if missed.is_empty() || !self.config.hinted_handoff {
            return Vec::new();
        }
        let Some(hints) = &self.hints else {
            return Vec::new();
        };

        let partition = partition_for_key(&request.entry.key, &self.partitions)
            .cloned()
            .unwrap_or_else(|| PartitionId::new("default"));

        let mut hinted = Vec::with_capacity(missed.len());
        for peer in missed {
            match hints
                .store_hint(peer.id.clone(), partition.clone(), request.clone())
                .await
            {
                Ok(_) => hinted.push(peer.id.clone()),
                Err(e) => tracing::warn!("failed to store hint for node {}: {}", peer.id, e),
            }
        }
        hinted
    }

    fn record_outcome(&self, acks: usize) -> bool {
        let reached = acks >= self.config.write_quorum;
        let m = quorumkv_metrics::metrics();
        if reached {
            m.replication_success.inc();
        } else {
            m.replication_failure.inc();
            tracing::warn!(
                "write quorum not reached: need {}, got {}",
                self.config.write_quorum,
                acks
            );
        }
        reached
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
