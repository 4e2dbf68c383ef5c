//! In-memory table for fast key lookups.
//!
//! Stores every live version (sibling) per key. Nothing is pruned here:
//! resolving siblings is the client's job.

use crate::record::VersionedEntry;
use std::collections::HashMap;

/// In-memory multi-version store. Each key maps to its entries in
/// insertion order.
#[derive(Debug, Default)]
pub struct Memtable {
    data: HashMap<String, Vec<VersionedEntry>>,
    entries: usize,
}

impl Memtable {
    pub fn new() -> Self {
        Self::default()
    }

    /// All versions for a key, most recent first. Equal timestamps put
    /// the later insert first. Empty if the key is unknown.
    pub fn get(&self, key: &str) -> Vec<VersionedEntry> {
        let mut versions: Vec<VersionedEntry> = match self.data.get(key) {
            Some(v) => v.iter().rev().cloned().collect(),
            None => return Vec::new(),
        };
        versions.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
        versions
    }

    /// Whether this exact version (writer + vector) is already stored.
    pub fn contains(&self, entry: &VersionedEntry) -> bool {
        let id = entry.version_id();
        self.data
            .get(&entry.key)
            .is_some_and(|versions| versions.iter().any(|e| e.version_id() == id))
    }

    /// Insert an entry as a new sibling. Returns `false` (and stores
    /// nothing) if the same version is already present.
    pub fn insert(&mut self, entry: VersionedEntry) -> bool {
        if self.contains(&entry) {
            return false;
        }
        self.data.entry(entry.key.clone()).or_default().push(entry);
        self.entries += 1;
        true
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Total number of versions across all keys.
    pub fn entry_count(&self) -> usize {
        self.entries
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorumkv_common::{NodeId, VersionVector};

    fn entry(key: &str, value: &str, writer: &str, vv: &[(&str, u64)], ts: u64) -> VersionedEntry {
        let mut e = VersionedEntry::new(
            key,
            value,
            NodeId::from(writer),
            VersionVector::from_map(vv.iter().map(|(k, v)| (*k, *v))),
        );
        e.timestamp_ms = ts;
        e
    }

    #[test]
    fn test_memtable_insert_get() {
        let mut mt = Memtable::new();
        assert!(mt.insert(entry("k1", "v1", "n1", &[("n1", 1)], 10)));

        let versions = mt.get("k1");
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].value, "v1");
        assert_eq!(mt.entry_count(), 1);
    }

    #[test]
    fn test_memtable_keeps_dominated_versions() {
        let mut mt = Memtable::new();
        mt.insert(entry("k1", "v1", "n1", &[("n1", 1)], 10));
        mt.insert(entry("k1", "v2", "n1", &[("n1", 2)], 20));

        let versions = mt.get("k1");
        assert_eq!(versions.len(), 2, "older versions stay as siblings");
        assert_eq!(versions[0].value, "v2");
        assert_eq!(versions[1].value, "v1");
    }

    #[test]
    fn test_memtable_concurrent_writes_create_siblings() {
        let mut mt = Memtable::new();
        mt.insert(entry("k1", "v-from-a", "a", &[("a", 1)], 10));
        mt.insert(entry("k1", "v-from-b", "b", &[("b", 1)], 11));

        let versions = mt.get("k1");
        assert_eq!(versions.len(), 2, "concurrent writes should produce 2 siblings");
        assert!(versions[0]
            .version_vector
            .is_concurrent(&versions[1].version_vector));
    }

    #[test]
    fn test_memtable_duplicate_version_ignored() {
        let mut mt = Memtable::new();
        let e = entry("k1", "v1", "n1", &[("n1", 1)], 10);
        assert!(mt.insert(e.clone()));
        assert!(!mt.insert(e.clone()));
        assert!(mt.contains(&e));
        assert_eq!(mt.get("k1").len(), 1);
        assert_eq!(mt.entry_count(), 1);
    }

    #[test]
    fn test_memtable_same_vector_different_writer_is_distinct() {
        let mut mt = Memtable::new();
        mt.insert(entry("k1", "x", "n1", &[("n1", 1)], 10));
        assert!(mt.insert(entry("k1", "y", "n2", &[("n1", 1)], 10)));
        assert_eq!(mt.get("k1").len(), 2);
    }

    #[test]
    fn test_memtable_order_by_recency() {
        let mut mt = Memtable::new();
        mt.insert(entry("k1", "middle", "n1", &[("n1", 2)], 20));
        mt.insert(entry("k1", "newest", "n1", &[("n1", 3)], 30));
        mt.insert(entry("k1", "oldest", "n1", &[("n1", 1)], 10));
        mt.insert(entry("k1", "tie-later", "n2", &[("n2", 1)], 20));

        let values: Vec<String> = mt.get("k1").into_iter().map(|e| e.value).collect();
        assert_eq!(values, vec!["newest", "tie-later", "middle", "oldest"]);
    }

    #[test]
    fn test_memtable_not_found() {
        let mt = Memtable::new();
        assert!(mt.get("nonexistent").is_empty());
        assert!(mt.is_empty());
    }

    #[test]
    fn test_memtable_keys_sorted() {
        let mut mt = Memtable::new();
        mt.insert(entry("k3", "v3", "n1", &[("n1", 1)], 1));
        mt.insert(entry("k1", "v1", "n1", &[("n1", 1)], 1));
        mt.insert(entry("k2", "v2", "n1", &[("n1", 1)], 1));
        mt.insert(entry("k2", "v2b", "n1", &[("n1", 2)], 2));

        assert_eq!(mt.keys(), vec!["k1", "k2", "k3"]);
        assert_eq!(mt.len(), 3);
        assert_eq!(mt.entry_count(), 4);
    }
}
