//! HTTP client implementing `ReplicaClient`.
//!
//! `HttpReplicaClient` posts replication requests to a peer's
//! `/replicate` route and probes its `/health` route, translating
//! transport failures into `ReplicaError`.

use crate::server::HealthResponse;
use crate::NetError;
use quorumkv_common::Peer;
use quorumkv_kv::{ReplicaClient, ReplicaError, ReplicationRequest, ReplicationResponse};
use std::time::Duration;

/// A reqwest-based replica transport. The underlying connection pool is
/// shared by every peer.
#[derive(Debug, Clone)]
pub struct HttpReplicaClient {
    http: reqwest::Client,
}

impl HttpReplicaClient {
    /// `timeout` bounds each request end to end.
    pub fn new(timeout: Duration) -> Result<Self, NetError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { http })
    }
}

fn transport_error(target: &Peer, e: reqwest::Error) -> ReplicaError {
    if e.is_timeout() {
        ReplicaError::Timeout
    } else if e.is_connect() {
        ReplicaError::Unreachable(format!("{} at {}: {}", target.id, target.addr, e))
    } else {
        ReplicaError::RpcFailed(e.to_string())
    }
}

#[async_trait::async_trait]
impl ReplicaClient for HttpReplicaClient {
    async fn replicate(
        &self,
        target: &Peer,
        request: &ReplicationRequest,
    ) -> Result<ReplicationResponse, ReplicaError> {
        let _timer = quorumkv_metrics::start_rpc_timer("replicate", "outbound");

        let resp = self
            .http
            .post(format!("{}/replicate", target.base_url()))
            .json(request)
            .send()
            .await
            .map_err(|e| transport_error(target, e))?;

        let status = resp.status();
        let body: ReplicationResponse = resp.json().await.map_err(|e| {
            if status.is_success() {
                ReplicaError::RpcFailed(format!("invalid replicate response: {}", e))
            } else {
                ReplicaError::RpcFailed(format!("replicate returned {}", status))
            }
        })?;

        if !body.success {
            return Err(ReplicaError::Rejected(format!(
                "{} did not store request {}",
                body.node_id, body.request_id
            )));
        }
        Ok(body)
    }

    async fn health(&self, target: &Peer) -> Result<bool, ReplicaError> {
        let _timer = quorumkv_metrics::start_rpc_timer("health", "outbound");

        let resp = self
            .http
            .get(format!("{}/health", target.base_url()))
            .send()
            .await
            .map_err(|e| transport_error(target, e))?;

        if !resp.status().is_success() {
            quorumkv_metrics::record_replica_rpc("health", false);
            return Ok(false);
        }
        let body: HealthResponse = resp
            .json()
            .await
            .map_err(|e| ReplicaError::RpcFailed(format!("invalid health response: {}", e)))?;
        let up = body.status == "UP";
        quorumkv_metrics::record_replica_rpc("health", up);
        Ok(up)
    }
}
