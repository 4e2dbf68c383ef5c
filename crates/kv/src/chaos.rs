//! Fault injection for [`ReplicaClient`].
//!
//! [`ChaosReplicaClient`] wraps any `R: ReplicaClient` and, before
//! forwarding a call, applies per-node outages, per-node slowdowns, global
//! latency with jitter, and random failures.

use crate::replica_client::{ReplicaClient, ReplicaError, ReplicationRequest, ReplicationResponse};
use quorumkv_common::{NodeId, Peer};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

#[derive(Debug, Clone)]
pub struct ChaosReplicaConfig {
    /// Probability of a forwarded call failing, in \[0.0, 1.0\].
    pub failure_rate: f64,
    /// Latency added to every call.
    pub latency: Duration,
    /// Random extra latency in \[0, jitter\].
    pub jitter: Duration,
}

impl Default for ChaosReplicaConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.0,
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }
}

pub struct ChaosReplicaClient<R: ReplicaClient> {
    inner: Arc<R>,
    config: RwLock<ChaosReplicaConfig>,
    down: RwLock<HashSet<NodeId>>,
    slow: RwLock<HashMap<NodeId, Duration>>,
}

impl<R: ReplicaClient> std::fmt::Debug for ChaosReplicaClient<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosReplicaClient").finish_non_exhaustive()
    }
}

impl<R: ReplicaClient> ChaosReplicaClient<R> {
    pub fn new(inner: Arc<R>, config: ChaosReplicaConfig) -> Self {
        Self {
            inner,
            config: RwLock::new(config),
            down: RwLock::new(HashSet::new()),
            slow: RwLock::new(HashMap::new()),
        }
    }

    /// Every call to `node` fails until [`recover_node`](Self::recover_node).
    pub async fn fail_node(&self, node: NodeId) {
        self.down.write().await.insert(node);
    }

    /// Clear both the outage and the slowdown of `node`.
    pub async fn recover_node(&self, node: NodeId) {
        self.down.write().await.remove(&node);
        self.slow.write().await.remove(&node);
    }

    /// Delay every call to `node` by `delay` before forwarding it.
    pub async fn slow_node(&self, node: NodeId, delay: Duration) {
        self.slow.write().await.insert(node, delay);
    }

    pub async fn set_failure_rate(&self, rate: f64) {
        self.config.write().await.failure_rate = rate;
    }

    async fn disturb(&self, target: &Peer) -> Result<(), ReplicaError> {
        if self.down.read().await.contains(&target.id) {
            return Err(ReplicaError::Unreachable(format!(
                "chaos: {} is down",
                target.id
            )));
        }

        let node_delay = self
            .slow
            .read()
            .await
            .get(&target.id)
            .copied()
            .unwrap_or(Duration::ZERO);
        let (delay, failure_rate) = {
            let config = self.config.read().await;
            let jitter_ms = if config.jitter.is_zero() {
                0
            } else {
                rand::thread_rng().gen_range(0..=config.jitter.as_millis() as u64)
            };
            (
                node_delay + config.latency + Duration::from_millis(jitter_ms),
                config.failure_rate,
            )
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if failure_rate > 0.0 && rand::thread_rng().gen_bool(failure_rate.min(1.0)) {
            return Err(ReplicaError::RpcFailed("chaos: random failure".into()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<R: ReplicaClient> ReplicaClient for ChaosReplicaClient<R> {
    async fn replicate(
        &self,
        target: &Peer,
        request: &ReplicationRequest,
    ) -> Result<ReplicationResponse, ReplicaError> {
        self.disturb(target).await?;
        self.inner.replicate(target, request).await
    }

    async fn health(&self, target: &Peer) -> Result<bool, ReplicaError> {
        self.disturb(target).await?;
        self.inner.health(target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorumkv_common::VersionVector;
    use quorumkv_storage::VersionedEntry;
    use std::time::Instant;

    struct AlwaysOk;

    #[async_trait::async_trait]
    impl ReplicaClient for AlwaysOk {
        async fn replicate(
            &self,
            target: &Peer,
            request: &ReplicationRequest,
        ) -> Result<ReplicationResponse, ReplicaError> {
            Ok(ReplicationResponse {
                request_id: request.request_id.clone(),
                success: true,
                node_id: target.id.clone(),
                version: None,
            })
        }

        async fn health(&self, _target: &Peer) -> Result<bool, ReplicaError> {
            Ok(true)
        }
    }

    fn chaos(config: ChaosReplicaConfig) -> ChaosReplicaClient<AlwaysOk> {
        ChaosReplicaClient::new(Arc::new(AlwaysOk), config)
    }

    fn request() -> ReplicationRequest {
        let mut vv = VersionVector::new();
        vv.increment("n1");
        ReplicationRequest::new(VersionedEntry::new("key", "val", NodeId::from("n1"), vv), 0)
    }

    #[tokio::test]
    async fn test_passthrough() {
        let chaos = chaos(ChaosReplicaConfig::default());
        let n2 = Peer::with_dummy_addr("n2");
        assert!(chaos.replicate(&n2, &request()).await.is_ok());
        assert!(chaos.health(&n2).await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_and_recover_node() {
        let chaos = chaos(ChaosReplicaConfig::default());
        let n2 = Peer::with_dummy_addr("n2");
        let n3 = Peer::with_dummy_addr("n3");
        let req = request();

        chaos.fail_node(n2.id.clone()).await;
        assert!(matches!(
            chaos.replicate(&n2, &req).await,
            Err(ReplicaError::Unreachable(_))
        ));
        assert!(chaos.health(&n2).await.is_err());
        assert!(chaos.replicate(&n3, &req).await.is_ok());

        chaos.recover_node(n2.id.clone()).await;
        assert!(chaos.replicate(&n2, &req).await.is_ok());
    }

    #[tokio::test]
    async fn test_random_failure_rate() {
        let chaos = chaos(ChaosReplicaConfig {
            failure_rate: 1.0,
            ..Default::default()
        });
        let n2 = Peer::with_dummy_addr("n2");
        let req = request();

        for _ in 0..10 {
            assert!(chaos.replicate(&n2, &req).await.is_err());
        }
        chaos.set_failure_rate(0.0).await;
        assert!(chaos.replicate(&n2, &req).await.is_ok());
    }

    #[tokio::test]
    async fn test_slow_node_only_delays_that_node() {
        let chaos = chaos(ChaosReplicaConfig::default());
        let n2 = Peer::with_dummy_addr("n2");
        let n3 = Peer::with_dummy_addr("n3");
        let req = request();
        chaos.slow_node(n2.id.clone(), Duration::from_millis(80)).await;

        let start = Instant::now();
        assert!(chaos.replicate(&n3, &req).await.is_ok());
        assert!(start.elapsed() < Duration::from_millis(80));

        let start = Instant::now();
        assert!(chaos.replicate(&n2, &req).await.is_ok());
        assert!(start.elapsed() >= Duration::from_millis(80));
    }
}
