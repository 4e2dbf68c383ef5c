//! Hinted-handoff manager: stores undelivered writes and redelivers them.
//!
//! Two background sweeps share the [`HintStore`]: delivery (short interval)
//! probes each target's health and replays its pending hints; expiry
//! (long interval) forces hints older than the TTL to EXPIRED. Status
//! changes go through the store's pending-only transitions, so the sweeps
//! need no coordination beyond the store lock.

use crate::hint_store::{Hint, HintError, HintStats, HintStatus, HintStore};
use crate::replica_client::{ReplicaClient, ReplicaError, ReplicationRequest};
use quorumkv_common::{now_ms, NodeId, PartitionId, Peer};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{interval, Duration};

#[derive(Debug, Clone)]
pub struct HintConfig {
    /// Failed delivery attempts before a hint expires.
    pub max_retries: u32,
    /// Age after which a pending hint expires regardless of retries.
    pub ttl: Duration,
    pub delivery_interval: Duration,
    pub expiry_interval: Duration,
    /// Maximum hints to attempt per delivery cycle.
    pub max_hints_per_cycle: usize,
}

impl Default for HintConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            ttl: Duration::from_secs(3 * 60 * 60),
            delivery_interval: Duration::from_secs(5),
            expiry_interval: Duration::from_secs(60),
            max_hints_per_cycle: 100,
        }
    }
}

/// Outcome counts of one delivery cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
    pub expired: usize,
    /// Hints left untouched because their target was unhealthy or unknown.
    pub skipped: usize,
}

pub struct HintManager<R: ReplicaClient> {
    store: Mutex<HintStore>,
    client: Arc<R>,
    peers: HashMap<NodeId, Peer>,
    config: HintConfig,
}

impl<R: ReplicaClient> std::fmt::Debug for HintManager<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HintManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<R: ReplicaClient> HintManager<R> {
    pub fn new(store: HintStore, client: Arc<R>, peers: &[Peer], config: HintConfig) -> Self {
        quorumkv_metrics::metrics()
            .hints_pending
            .set(store.stats().pending as i64);
        Self {
            store: Mutex::new(store),
            client,
            peers: peers.iter().map(|p| (p.id.clone(), p.clone())).collect(),
            config,
        }
    }

    /// Record a write that missed `target_node`.
    pub async fn store_hint(
        &self,
        target_node: NodeId,
        partition_id: PartitionId,
        payload: ReplicationRequest,
    ) -> Result<Hint, HintError> {
        let mut store = self.store.lock().await;
        let hint = store.store_hint(target_node, partition_id, payload)?;
        let m = quorumkv_metrics::metrics();
        m.hints_stored.inc();
        m.hints_pending.set(store.stats().pending as i64);
        tracing::debug!(
            hint = hint.id,
            target = %hint.target_node,
            key = %hint.payload.entry.key,
            "stored hint"
        );
        Ok(hint)
    }

    /// One delivery cycle over the pending hints, oldest first.
    ///
    /// Hints at the retry limit expire. Targets are probed once per cycle;
    /// hints for unhealthy targets are left pending without using a retry.
    /// A failed delivery uses one retry. Errors never abort the sweep.
    pub async fn deliver_hints(&self) -> DeliveryReport {
        let pending: Vec<Hint> = {
            let store = self.store.lock().await;
            store
                .pending()
                .into_iter()
                .take(self.config.max_hints_per_cycle)
                .collect()
        };

        let mut report = DeliveryReport::default();
        let mut healthy: HashMap<NodeId, bool> = HashMap::new();

        for hint in pending {
            if hint.retry_count >= self.config.max_retries {
                if self.expire(hint.id).await {
                    report.expired += 1;
                }
                continue;
            }

            let Some(peer) = self.peers.get(&hint.target_node) else {
                tracing::debug!("hint target {} is not a known peer, skipping", hint.target_node);
                report.skipped += 1;
                continue;
            };

            let up = match healthy.get(&peer.id) {
                Some(up) => *up,
                None => {
                    let up = matches!(self.client.health(peer).await, Ok(true));
                    healthy.insert(peer.id.clone(), up);
                    up
                }
            };
            if !up {
                report.skipped += 1;
                continue;
            }

            let outcome = match self.client.replicate(peer, &hint.payload).await {
                Ok(resp) if resp.success => Ok(()),
                Ok(resp) => Err(ReplicaError::Rejected(format!(
                    "{} did not store request {}",
                    resp.node_id, resp.request_id
                ))),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => {
                    let mut store = self.store.lock().await;
                    match store.mark_delivered(hint.id, now_ms()) {
                        Ok(true) => {
                            report.delivered += 1;
                            quorumkv_metrics::metrics().hints_delivered.inc();
                            tracing::debug!(
                                "delivered hint {} for key '{}' to {}",
                                hint.id,
                                hint.payload.entry.key,
                                peer.id
                            );
                        }
                        Ok(false) => {
                            tracing::debug!("hint {} left pending state during delivery", hint.id)
                        }
                        Err(e) => tracing::warn!("failed to mark hint {} delivered: {}", hint.id, e),
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::debug!("hint delivery to {} failed: {}, will retry", peer.id, e);
                    let mut store = self.store.lock().await;
                    match store.record_failure(hint.id, self.config.max_retries) {
                        Ok(Some(HintStatus::Expired)) => {
                            report.expired += 1;
                            note_expired(&hint);
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!("failed to record hint {} failure: {}", hint.id, e),
                    }
                }
            }
        }

        self.refresh_pending_gauge().await;
        if report.delivered > 0 || report.expired > 0 {
            tracing::info!(
                "hint delivery cycle: {} delivered, {} failed, {} expired",
                report.delivered,
                report.failed,
                report.expired
            );
        }
        report
    }

    /// Expire every pending hint older than the TTL. Returns how many expired.
    pub async fn expire_stale_hints(&self) -> usize {
        let cutoff = now_ms().saturating_sub(self.config.ttl.as_millis() as u64);
        let expired = {
            let mut store = self.store.lock().await;
            match store.expire_older_than(cutoff) {
                Ok(expired) => expired,
                Err(e) => {
                    tracing::warn!("hint expiry sweep failed: {}", e);
                    return 0;
                }
            }
        };
        for hint in &expired {
            note_expired(hint);
        }
        self.refresh_pending_gauge().await;
        expired.len()
    }

    /// Pending hints, optionally for one target.
    pub async fn pending(&self, target: Option<&NodeId>) -> Vec<Hint> {
        let store = self.store.lock().await;
        match target {
            Some(t) => store.pending_for(t),
            None => store.pending(),
        }
    }

    pub async fn stats(&self) -> HintStats {
        self.store.lock().await.stats()
    }

    /// Flush the hint table to disk.
    pub async fn sync(&self) -> Result<(), HintError> {
        self.store.lock().await.sync()
    }

    /// Spawn the delivery and expiry sweeps.
    pub fn spawn_hint_tasks(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let delivery = {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                let mut tick = interval(manager.config.delivery_interval);
                loop {
                    tick.tick().await;
                    manager.deliver_hints().await;
                }
            })
        };
        let expiry = {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                let mut tick = interval(manager.config.expiry_interval);
                loop {
                    tick.tick().await;
                    manager.expire_stale_hints().await;
                }
            })
        };
        vec![delivery, expiry]
    }

    async fn expire(&self, id: u64) -> bool {
        let mut store = self.store.lock().await;
        match store.expire(id) {
            Ok(true) => {
                if let Some(hint) = store.get(id) {
                    note_expired(hint);
                }
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::warn!("failed to expire hint {}: {}", id, e);
                false
            }
        }
    }

    async fn refresh_pending_gauge(&self) {
        let pending = self.store.lock().await.stats().pending;
        quorumkv_metrics::metrics().hints_pending.set(pending as i64);
    }
}

/// A hint that expires is a write permanently lost to its target.
fn note_expired(hint: &Hint) {
    quorumkv_metrics::metrics().hints_expired.inc();
    tracing::warn!(
        hint = hint.id,
        target = %hint.target_node,
        partition = %hint.partition_id,
        key = %hint.payload.entry.key,
        retries = hint.retry_count,
        "hint expired; write will not reach its target via handoff"
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
