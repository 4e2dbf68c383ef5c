//! Version vector implementation for causal versioning.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

/// A version vector: maps replica identifiers to monotonic counters.
///
/// Zero counters are never stored, so two vectors that compare
/// [`Causality::Equal`] are also `==`. Kept in a `BTreeMap` so iteration,
/// serialization and [`VersionVector::digest`] are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, u64>",
    into = "BTreeMap<String, u64>"
)]
pub struct VersionVector {
    counters: BTreeMap<String, u64>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from a raw map. Zero counters are dropped.
    pub fn from_map<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, u64)>,
        K: Into<String>,
    {
        Self {
            counters: entries
                .into_iter()
                .filter(|(_, v)| *v > 0)
                .map(|(k, v)| (k.into(), v))
                .collect(),
        }
    }

    /// Get the counter for a replica (0 if not present).
    pub fn get(&self, replica: &str) -> u64 {
        self.counters.get(replica).copied().unwrap_or(0)
    }

    /// Bump the counter for `replica` by one.
    pub fn increment(&mut self, replica: &str) {
        *self.counters.entry(replica.to_string()).or_insert(0) += 1;
    }

    /// Element-wise max over the union of replicas. Neither operand changes.
    pub fn merge(&self, other: &Self) -> Self {
        let mut merged = self.counters.clone();
        for (k, &v) in &other.counters {
            let entry = merged.entry(k.clone()).or_insert(0);
            *entry = (*entry).max(v);
        }
        Self { counters: merged }
    }

    /// Compare two vectors. Replicas absent from one side count as 0.
    pub fn compare(&self, other: &Self) -> Causality {
        let mut self_gte = true;
        let mut other_gte = true;

        for (k, &sv) in &self.counters {
            let ov = other.get(k);
            if sv < ov {
                self_gte = false;
            }
            if ov < sv {
                other_gte = false;
            }
        }
        for (k, &ov) in &other.counters {
            if !self.counters.contains_key(k) && ov > 0 {
                self_gte = false;
            }
        }

        match (self_gte, other_gte) {
            (true, true) => Causality::Equal,
            (true, false) => Causality::Dominates,
            (false, true) => Causality::Dominated,
            (false, false) => Causality::Concurrent,
        }
    }

    /// Dominates: self >= other on all entries, > on at least one.
    pub fn dominates(&self, other: &Self) -> bool {
        self.compare(other) == Causality::Dominates
    }

    /// Are these vectors concurrent (neither dominates)?
    pub fn is_concurrent(&self, other: &Self) -> bool {
        self.compare(other) == Causality::Concurrent
    }

    /// `true` when no write has been observed.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Iterate `(replica, counter)` pairs in replica order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counters.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Hex SHA-1 over the canonical `replica=counter;` encoding. Identifies
    /// a vector in persisted entry keys.
    pub fn digest(&self) -> String {
        let mut hasher = Sha1::new();
        for (k, v) in &self.counters {
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.to_string().as_bytes());
            hasher.update(b";");
        }
        hex::encode(hasher.finalize())
    }

    pub fn into_map(self) -> BTreeMap<String, u64> {
        self.counters
    }
}

/// Outcome of comparing two version vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    Equal,
    Dominates,
    Dominated,
    Concurrent,
}

impl Causality {
    /// The relation seen from the other operand.
    pub fn reverse(self) -> Self {
        match self {
            Self::Dominates => Self::Dominated,
            Self::Dominated => Self::Dominates,
            other => other,
        }
    }
}

impl From<BTreeMap<String, u64>> for VersionVector {
    fn from(counters: BTreeMap<String, u64>) -> Self {
        Self::from_map(counters)
    }
}

impl From<VersionVector> for BTreeMap<String, u64> {
    fn from(vv: VersionVector) -> Self {
        vv.counters
    }
}
