//! Storage engine: combines WAL + Memtable.
//!
//! All writes go through the WAL first (for durability), then into
//! the in-memory memtable (for fast reads). The engine owns the
//! write-merge rule that establishes causality for locally coordinated
//! writes.

use crate::memtable::Memtable;
use crate::record::VersionedEntry;
use crate::wal::{FsyncPolicy, Wal, WalError};
use quorumkv_common::{NodeId, VersionVector};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Introspection snapshot of a node's store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub entry_count: usize,
}

/// The storage engine. All operations are synchronous (blocking I/O).
/// The async boundary is at the caller (KV layer), which serializes
/// mutations behind a lock so each read-merge-append is atomic.
#[derive(Debug)]
pub struct StorageEngine {
    node_id: NodeId,
    memtable: Memtable,
    wal: Wal,
}

impl StorageEngine {
    /// Open or create a storage engine at the given directory.
    pub fn open(data_dir: &Path, node_id: NodeId, fsync: FsyncPolicy) -> Result<Self, StorageError> {
        std::fs::create_dir_all(data_dir)?;
        let wal_path = data_dir.join("entries.wal");

        let (wal, entries) = Wal::recover::<VersionedEntry>(&wal_path, fsync)?;
        let mut memtable = Memtable::new();
        for entry in entries {
            memtable.insert(entry);
        }

        tracing::info!(
            node = %node_id,
            "storage engine opened: {} keys, {} versions recovered from {:?}",
            memtable.len(),
            memtable.entry_count(),
            wal_path
        );

        Ok(Self {
            node_id,
            memtable,
            wal,
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Coordinate a local write and return the new version vector.
    pub fn write(
        &mut self,
        key: &str,
        value: &str,
        client_vector: Option<&VersionVector>,
    ) -> Result<VersionVector, StorageError> {
        self.write_entry(key, value, client_vector)
            .map(|entry| entry.version_vector)
    }

    /// Coordinate a local write and return the stored entry.
    ///
    /// The new vector is the merge of every live version of `key` and the
    /// client's vector, incremented for this node. It therefore dominates
    /// everything the node has seen for the key. Existing versions are kept.
    pub fn write_entry(
        &mut self,
        key: &str,
        value: &str,
        client_vector: Option<&VersionVector>,
    ) -> Result<VersionedEntry, StorageError> {
        let base = client_vector.cloned().unwrap_or_default();
        let mut vector = self
            .memtable
            .get(key)
            .iter()
            .fold(base, |acc, e| acc.merge(&e.version_vector));
        vector.increment(self.node_id.as_str());

        let entry = VersionedEntry::new(key, value, self.node_id.clone(), vector);
        self.wal.append(&entry)?;
        self.memtable.insert(entry.clone());

        tracing::debug!(key, vector = ?entry.version_vector, "local write");
        Ok(entry)
    }

    /// Store an entry exactly as received (no merge, no increment).
    /// Returns `false` if this version was already stored.
    pub fn apply(&mut self, entry: VersionedEntry) -> Result<bool, StorageError> {
        if self.memtable.contains(&entry) {
            return Ok(false);
        }
        self.wal.append(&entry)?;
        Ok(self.memtable.insert(entry))
    }

    /// All live versions of a key, most recent first.
    pub fn read(&self, key: &str) -> Vec<VersionedEntry> {
        self.memtable.get(key)
    }

    /// All keys, sorted.
    pub fn list_keys(&self) -> Vec<String> {
        self.memtable.keys()
    }

    /// Number of distinct keys.
    pub fn key_count(&self) -> usize {
        self.memtable.len()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.node_id.clone(),
            entry_count: self.memtable.entry_count(),
        }
    }

    /// Sync the WAL to disk (for batch fsync mode).
    pub fn sync(&mut self) -> Result<(), StorageError> {
        self.wal.sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorumkv_common::Causality;
    use tempfile::TempDir;

    fn open(dir: &TempDir, node: &str) -> StorageEngine {
        StorageEngine::open(dir.path(), NodeId::from(node), FsyncPolicy::None).unwrap()
    }

    #[test]
    fn test_write_on_empty_key_dominates_empty() {
        let dir = TempDir::new().unwrap();
        let mut engine = open(&dir, "n1");

        let vv = engine.write("order-42", "v1", None).unwrap();
        assert_eq!(vv, VersionVector::from_map([("n1", 1)]));
        assert!(vv.dominates(&VersionVector::new()));

        let versions = engine.read("order-42");
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].value, "v1");
        assert_eq!(versions[0].writer.as_str(), "n1");
    }

    #[test]
    fn test_write_merges_existing_and_client_vectors() {
        let dir = TempDir::new().unwrap();
        let mut engine = open(&dir, "n1");

        engine.write("k", "a", None).unwrap();
        let client = VersionVector::from_map([("n9", 4)]);
        let vv = engine.write("k", "b", Some(&client)).unwrap();

        assert_eq!(vv.get("n1"), 2);
        assert_eq!(vv.get("n9"), 4);
        // previous version retained as a sibling
        assert_eq!(engine.read("k").len(), 2);
        assert_eq!(engine.read("k")[0].value, "b");
    }

    #[test]
    fn test_write_starts_from_client_vector() {
        let dir = TempDir::new().unwrap();
        let mut engine = open(&dir, "n2");
        let client = VersionVector::from_map([("n1", 3)]);
        let vv = engine.write("fresh", "x", Some(&client)).unwrap();
        assert_eq!(vv, VersionVector::from_map([("n1", 3), ("n2", 1)]));
    }

    #[test]
    fn test_new_write_dominates_concurrent_siblings() {
        let dir = TempDir::new().unwrap();
        let mut engine = open(&dir, "n1");

        let mut remote = VersionVector::new();
        remote.increment("n2");
        engine
            .apply(VersionedEntry::new("k", "from-n2", NodeId::from("n2"), remote.clone()))
            .unwrap();
        let vv = engine.write("k", "from-n1", None).unwrap();
        assert_eq!(vv.compare(&remote), Causality::Dominates);
    }

    #[test]
    fn test_apply_is_verbatim_and_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut engine = open(&dir, "n1");

        let mut vv = VersionVector::new();
        vv.increment("n2");
        let entry = VersionedEntry::new("k", "v", NodeId::from("n2"), vv.clone());

        assert!(engine.apply(entry.clone()).unwrap());
        assert!(!engine.apply(entry).unwrap());
        let versions = engine.read("k");
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version_vector, vv);
        assert_eq!(versions[0].writer.as_str(), "n2");
        assert_eq!(engine.status().entry_count, 1);
    }

    #[test]
    fn test_engine_crash_recovery() {
        let dir = TempDir::new().unwrap();

        {
            let mut engine = open(&dir, "n1");
            engine.write("k1", "v1", None).unwrap();
            engine.write("k2", "v2", None).unwrap();
            engine.write("k1", "v1b", None).unwrap();
            assert_eq!(engine.key_count(), 2);
        }

        {
            let mut engine = open(&dir, "n1");
            assert_eq!(engine.key_count(), 2);
            assert_eq!(engine.status().entry_count, 3);
            assert_eq!(engine.read("k1")[0].value, "v1b");
            // counters continue from the recovered state
            let vv = engine.write("k1", "v1c", None).unwrap();
            assert_eq!(vv.get("n1"), 3);
        }
    }

    #[test]
    fn test_writes_after_torn_tail_survive_restart() {
        use std::io::Write;
        let dir = TempDir::new().unwrap();

        {
            let mut engine = open(&dir, "n1");
            engine.write("k1", "v1", None).unwrap();
        }
        {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(dir.path().join("entries.wal"))
                .unwrap();
            file.write_all(&[7, 7, 7]).unwrap();
        }
        {
            let mut engine = open(&dir, "n1");
            engine.write("k2", "v2", None).unwrap();
            assert_eq!(engine.status().entry_count, 2);
        }

        let engine = open(&dir, "n1");
        assert_eq!(engine.list_keys(), vec!["k1".to_string(), "k2".to_string()]);
        assert_eq!(engine.status().entry_count, 2);
    }

    #[test]
    fn test_read_unknown_key_is_empty() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir, "n1");
        assert!(engine.read("missing").is_empty());
    }

    #[test]
    fn test_list_keys_and_status() {
        let dir = TempDir::new().unwrap();
        let mut engine = open(&dir, "n1");

        engine.write("b", "1", None).unwrap();
        engine.write("a", "2", None).unwrap();
        engine.write("a", "3", None).unwrap();

        assert_eq!(engine.list_keys(), vec!["a", "b"]);
        assert_eq!(
            engine.status(),
            NodeStatus {
                node_id: NodeId::from("n1"),
                entry_count: 3
            }
        );
        engine.sync().unwrap();
    }
}
