//! Durable store for hinted-handoff hints.
//!
//! Each hint represents a write that could not be delivered to its intended
//! replica node. Every state change is appended to the hint table's WAL,
//! so PENDING hints survive a restart and terminal hints stay terminal.

use crate::replica_client::ReplicationRequest;
use quorumkv_common::{now_ms, NodeId, PartitionId};
use quorumkv_storage::{DurableTable, FsyncPolicy, StorageError, TableRecord};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum HintError {
    #[error("hint storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HintStatus {
    Pending,
    Delivered,
    Expired,
}

/// A write that needs to be delivered to a specific target node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hint {
    pub id: u64,
    pub target_node: NodeId,
    pub partition_id: PartitionId,
    pub payload: ReplicationRequest,
    pub created_at_ms: u64,
    pub delivered_at_ms: Option<u64>,
    pub status: HintStatus,
    pub retry_count: u32,
}

impl TableRecord for Hint {
    fn record_id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HintStats {
    pub pending: usize,
    pub delivered: usize,
    pub expired: usize,
}

/// Durable hint table. Only PENDING hints are ever mutated.
#[derive(Debug)]
pub struct HintStore {
    table: DurableTable<Hint>,
}

impl HintStore {
    /// Open or create a hint store in the given directory.
    pub fn open(hint_dir: &Path, fsync: FsyncPolicy) -> Result<Self, HintError> {
        let table = DurableTable::open(&hint_dir.join("hints.wal"), fsync)?;
        Ok(Self { table })
    }

    /// Store a new PENDING hint with `retry_count = 0`.
    pub fn store_hint(
        &mut self,
        target_node: NodeId,
        partition_id: PartitionId,
        payload: ReplicationRequest,
    ) -> Result<Hint, HintError> {
        let hint = self.table.insert_with(|id| Hint {
            id,
            target_node,
            partition_id,
            payload,
            created_at_ms: now_ms(),
            delivered_at_ms: None,
            status: HintStatus::Pending,
            retry_count: 0,
        })?;
        Ok(hint)
    }

    pub fn get(&self, id: u64) -> Option<&Hint> {
        self.table.get(id)
    }

    /// PENDING hints, oldest first.
    pub fn pending(&self) -> Vec<Hint> {
        self.table
            .values()
            .filter(|h| h.status == HintStatus::Pending)
            .cloned()
            .collect()
    }

    /// PENDING hints destined for one node, oldest first.
    pub fn pending_for(&self, target: &NodeId) -> Vec<Hint> {
        self.table
            .values()
            .filter(|h| h.status == HintStatus::Pending && &h.target_node == target)
            .cloned()
            .collect()
    }

    /// PENDING → DELIVERED. Returns `false` if the hint was no longer pending.
    pub fn mark_delivered(&mut self, id: u64, at_ms: u64) -> Result<bool, HintError> {
        self.transition(id, |hint| {
            hint.status = HintStatus::Delivered;
            hint.delivered_at_ms = Some(at_ms);
        })
    }

    /// Count one failed delivery attempt. The attempt that reaches
    /// `max_retries` expires the hint. Returns the resulting status, or
    /// `None` if the hint was no longer pending.
    pub fn record_failure(
        &mut self,
        id: u64,
        max_retries: u32,
    ) -> Result<Option<HintStatus>, HintError> {
        let mut status = None;
        self.transition(id, |hint| {
            hint.retry_count += 1;
            if hint.retry_count >= max_retries {
                hint.status = HintStatus::Expired;
            }
            status = Some(hint.status);
        })?;
        Ok(status)
    }

    /// PENDING → EXPIRED. Returns `false` if the hint was no longer pending.
    pub fn expire(&mut self, id: u64) -> Result<bool, HintError> {
        self.transition(id, |hint| hint.status = HintStatus::Expired)
    }

    /// Expire every PENDING hint created before `cutoff_ms`. Returns the
    /// expired hints.
    pub fn expire_older_than(&mut self, cutoff_ms: u64) -> Result<Vec<Hint>, HintError> {
        let stale: Vec<u64> = self
            .table
            .values()
            .filter(|h| h.status == HintStatus::Pending && h.created_at_ms < cutoff_ms)
            .map(|h| h.id)
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for id in stale {
            if self.expire(id)? {
                if let Some(hint) = self.table.get(id) {
                    expired.push(hint.clone());
                }
            }
        }
        Ok(expired)
    }

    /// Force buffered transitions to disk.
    pub fn sync(&mut self) -> Result<(), HintError> {
        self.table.sync()?;
        Ok(())
    }

    pub fn stats(&self) -> HintStats {
        let mut stats = HintStats::default();
        for hint in self.table.values() {
            match hint.status {
                HintStatus::Pending => stats.pending += 1,
                HintStatus::Delivered => stats.delivered += 1,
                HintStatus::Expired => stats.expired += 1,
            }
        }
        stats
    }

    /// Total number of hints ever stored.
    pub fn hint_count(&self) -> usize {
        self.table.len()
    }

    fn transition(&mut self, id: u64, apply: impl FnOnce(&mut Hint)) -> Result<bool, HintError> {
        let mut hint = match self.table.get(id) {
            Some(h) if h.status == HintStatus::Pending => h.clone(),
            _ => return Ok(false),
        };
        apply(&mut hint);
        self.table.put(hint)?;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use quorumkv_common::VersionVector;
    use quorumkv_storage::VersionedEntry;
    use tempfile::TempDir;

    fn payload(key: &str) -> ReplicationRequest {
        let mut vv = VersionVector::new();
        vv.increment("n1");
        ReplicationRequest::new(VersionedEntry::new(key, "v", NodeId::from("n1"), vv), 0)
    }

    fn open(dir: &TempDir) -> HintStore {
        HintStore::open(dir.path(), FsyncPolicy::None).unwrap()
    }

    fn store(hs: &mut HintStore, target: &str, key: &str) -> Hint {
        hs.store_hint(NodeId::from(target), PartitionId::from("p1"), payload(key))
            .unwrap()
    }

    #[test]
    fn test_store_and_retrieve() {
        let dir = TempDir::new().unwrap();
        let mut hs = open(&dir);

        let hint = store(&mut hs, "n2", "mykey");
        assert_eq!(hint.status, HintStatus::Pending);
        assert_eq!(hint.retry_count, 0);
        assert!(hint.delivered_at_ms.is_none());

        let pending = hs.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload.entry.key, "mykey");
        assert_eq!(pending[0].target_node.as_str(), "n2");
    }

    #[test]
    fn test_pending_for_node() {
        let dir = TempDir::new().unwrap();
        let mut hs = open(&dir);

        store(&mut hs, "a", "k1");
        store(&mut hs, "a", "k2");
        store(&mut hs, "b", "k3");

        assert_eq!(hs.pending_for(&NodeId::from("a")).len(), 2);
        assert_eq!(hs.pending_for(&NodeId::from("b")).len(), 1);
        assert!(hs.pending_for(&NodeId::from("c")).is_empty());
    }

    #[test]
    fn test_mark_delivered_is_terminal() {
        let dir = TempDir::new().unwrap();
        let mut hs = open(&dir);
        let hint = store(&mut hs, "n2", "k");

        assert!(hs.mark_delivered(hint.id, 42).unwrap());
        let stored = hs.get(hint.id).unwrap();
        assert_eq!(stored.status, HintStatus::Delivered);
        assert_eq!(stored.delivered_at_ms, Some(42));

        // no further transitions
        assert!(!hs.mark_delivered(hint.id, 43).unwrap());
        assert!(!hs.expire(hint.id).unwrap());
        assert_eq!(hs.record_failure(hint.id, 3).unwrap(), None);
        assert_eq!(hs.get(hint.id).unwrap().delivered_at_ms, Some(42));
    }

    #[test]
    fn test_last_allowed_failure_expires() {
        let dir = TempDir::new().unwrap();
        let mut hs = open(&dir);
        let hint = store(&mut hs, "n2", "k");

        assert_eq!(hs.record_failure(hint.id, 3).unwrap(), Some(HintStatus::Pending));
        assert_eq!(hs.record_failure(hint.id, 3).unwrap(), Some(HintStatus::Pending));
        assert_eq!(hs.get(hint.id).unwrap().retry_count, 2);
        // retry_count == max_retries - 1: one more failure expires it
        assert_eq!(hs.record_failure(hint.id, 3).unwrap(), Some(HintStatus::Expired));
        assert!(hs.pending().is_empty());
        assert_eq!(hs.stats().expired, 1);
    }

    #[test]
    fn test_expire_older_than() {
        let dir = TempDir::new().unwrap();
        let mut hs = open(&dir);
        let old = store(&mut hs, "n2", "old");
        let delivered = store(&mut hs, "n2", "done");
        hs.mark_delivered(delivered.id, now_ms()).unwrap();

        let expired = hs.expire_older_than(now_ms() + 1).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, old.id);
        assert_eq!(hs.get(delivered.id).unwrap().status, HintStatus::Delivered);

        // a cutoff in the past touches nothing
        let fresh = store(&mut hs, "n3", "fresh");
        assert!(hs.expire_older_than(0).unwrap().is_empty());
        assert_eq!(hs.get(fresh.id).unwrap().status, HintStatus::Pending);
    }

    #[test]
    fn test_crash_recovery() {
        let dir = TempDir::new().unwrap();

        let (a, b) = {
            let mut hs = open(&dir);
            let a = store(&mut hs, "n2", "k1");
            let b = store(&mut hs, "n2", "k2");
            hs.mark_delivered(a.id, 7).unwrap();
            hs.record_failure(b.id, 3).unwrap();
            (a, b)
        };

        let hs = open(&dir);
        assert_eq!(hs.hint_count(), 2);
        assert_eq!(hs.get(a.id).unwrap().status, HintStatus::Delivered);
        assert_eq!(hs.get(b.id).unwrap().retry_count, 1);
        assert_eq!(
            hs.stats(),
            HintStats {
                pending: 1,
                delivered: 1,
                expired: 0
            }
        );
    }

    #[test]
    fn test_synced_batch_store_reopens_intact() {
        let dir = TempDir::new().unwrap();
        {
            let mut hs = HintStore::open(dir.path(), FsyncPolicy::Batch).unwrap();
            let hint = store(&mut hs, "n2", "k1");
            hs.mark_delivered(hint.id, 9).unwrap();
            hs.sync().unwrap();
        }
        let hs = open(&dir);
        assert_eq!(hs.stats().delivered, 1);
    }

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_string(&HintStatus::Delivered).unwrap();
        assert_eq!(json, "\"DELIVERED\"");
    }
}
