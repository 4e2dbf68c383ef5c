//! HTTP API of a node.
//!
//! Bridges axum routes to the replication coordinator, the hint manager
//! and the anti-entropy coordinator. Client ingress, the inter-node
//! `/replicate` RPC, the health probe and read-only introspection share one
//! router.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use quorumkv_common::{NodeId, VersionVector};
use quorumkv_kv::{
    AntiEntropyCoordinator, Hint, HintManager, HintStats, JobStatus, KvError, ReconciliationJob,
    ReplicaClient, ReplicationCoordinator, ReplicationRequest, ReplicationResponse,
    SegmentComparator,
};
use quorumkv_storage::{NodeStatus, VersionedEntry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Components a node serves.
pub struct NodeState<R: ReplicaClient, C: SegmentComparator> {
    pub coordinator: Arc<ReplicationCoordinator<R>>,
    pub hints: Option<Arc<HintManager<R>>>,
    pub anti_entropy: Option<Arc<AntiEntropyCoordinator<C>>>,
}

impl<R: ReplicaClient, C: SegmentComparator> std::fmt::Debug for NodeState<R, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeState")
            .field("node_id", self.coordinator.node_id())
            .field("hints", &self.hints.is_some())
            .field("anti_entropy", &self.anti_entropy.is_some())
            .finish()
    }
}

type Shared<R, C> = State<Arc<NodeState<R, C>>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRequest {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub version_vector: Option<VersionVector>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub version_vector: Option<VersionVector>,
    pub acks: usize,
    pub required: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResponse {
    pub key: String,
    pub versions: Vec<VersionedEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: NodeId,
}

#[derive(Debug, Deserialize)]
pub struct PendingHintsQuery {
    pub target_node: Option<NodeId>,
}

#[derive(Debug, Deserialize)]
pub struct JobsQuery {
    pub status: Option<JobStatus>,
}

/// Assemble the node's HTTP routes.
pub fn build_router<R: ReplicaClient, C: SegmentComparator>(state: NodeState<R, C>) -> Router {
    Router::new()
        .route("/kv/write", post(write_key::<R, C>))
        .route("/kv/read/:key", get(read_key::<R, C>))
        .route("/replicate", post(replicate::<R, C>))
        .route("/health", get(health::<R, C>))
        .route("/status", get(status::<R, C>))
        .route("/keys", get(keys::<R, C>))
        .route("/hints/pending", get(pending_hints::<R, C>))
        .route("/hints/stats", get(hint_stats::<R, C>))
        .route("/reconciliation/jobs", get(reconciliation_jobs::<R, C>))
        .with_state(Arc::new(state))
}

async fn write_key<R: ReplicaClient, C: SegmentComparator>(
    State(state): Shared<R, C>,
    Json(req): Json<WriteRequest>,
) -> (StatusCode, Json<WriteResponse>) {
    let required = state.coordinator.config().write_quorum;
    match state
        .coordinator
        .write(&req.key, &req.value, req.version_vector.as_ref())
        .await
    {
        Ok(outcome) => {
            let (code, error) = if outcome.quorum_reached {
                (StatusCode::OK, None)
            } else {
                let shortfall = KvError::QuorumNotReached {
                    needed: outcome.required,
                    got: outcome.acks,
                };
                (StatusCode::SERVICE_UNAVAILABLE, Some(shortfall.to_string()))
            };
            (
                code,
                Json(WriteResponse {
                    success: outcome.quorum_reached,
                    error,
                    version_vector: Some(outcome.version_vector),
                    acks: outcome.acks,
                    required: outcome.required,
                }),
            )
        }
        Err(e) => {
            tracing::error!("write of '{}' failed: {}", req.key, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(WriteResponse {
                    success: false,
                    error: Some(e.to_string()),
                    version_vector: None,
                    acks: 0,
                    required,
                }),
            )
        }
    }
}

async fn read_key<R: ReplicaClient, C: SegmentComparator>(
    State(state): Shared<R, C>,
    Path(key): Path<String>,
) -> Json<ReadResponse> {
    let versions = state.coordinator.read(&key).await;
    Json(ReadResponse { key, versions })
}

async fn replicate<R: ReplicaClient, C: SegmentComparator>(
    State(state): Shared<R, C>,
    Json(req): Json<ReplicationRequest>,
) -> (StatusCode, Json<ReplicationResponse>) {
    let _timer = quorumkv_metrics::start_rpc_timer("replicate", "inbound");
    let response = state.coordinator.handle_incoming_replication(&req).await;
    let code = if response.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (code, Json(response))
}

async fn health<R: ReplicaClient, C: SegmentComparator>(
    State(state): Shared<R, C>,
) -> Json<HealthResponse> {
    quorumkv_metrics::metrics()
        .rpcs_received
        .with_label_values(&["health"])
        .inc();
    Json(HealthResponse {
        status: "UP".to_string(),
        node_id: state.coordinator.node_id().clone(),
    })
}

async fn status<R: ReplicaClient, C: SegmentComparator>(
    State(state): Shared<R, C>,
) -> Json<NodeStatus> {
    Json(state.coordinator.status().await)
}

async fn keys<R: ReplicaClient, C: SegmentComparator>(
    State(state): Shared<R, C>,
) -> Json<Vec<String>> {
    Json(state.coordinator.list_keys().await)
}

async fn pending_hints<R: ReplicaClient, C: SegmentComparator>(
    State(state): Shared<R, C>,
    Query(query): Query<PendingHintsQuery>,
) -> Json<Vec<Hint>> {
    let hints = match &state.hints {
        Some(hints) => hints.pending(query.target_node.as_ref()).await,
        None => Vec::new(),
    };
    Json(hints)
}

async fn hint_stats<R: ReplicaClient, C: SegmentComparator>(
    State(state): Shared<R, C>,
) -> Json<HintStats> {
    let stats = match &state.hints {
        Some(hints) => hints.stats().await,
        None => HintStats::default(),
    };
    Json(stats)
}

async fn reconciliation_jobs<R: ReplicaClient, C: SegmentComparator>(
    State(state): Shared<R, C>,
    Query(query): Query<JobsQuery>,
) -> Json<Vec<ReconciliationJob>> {
    let jobs = match &state.anti_entropy {
        Some(ae) => ae.jobs(query.status).await,
        None => Vec::new(),
    };
    Json(jobs)
}
