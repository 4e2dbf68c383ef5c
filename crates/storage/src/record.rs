//! Versioned entry format.

use quorumkv_common::{now_ms, NodeId, VersionVector};
use serde::{Deserialize, Serialize};

/// One stored version of a key. Immutable once written; a key may hold
/// several concurrent entries (siblings).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionedEntry {
    pub key: String,
    pub value: String,
    /// Replica that coordinated the write.
    pub writer: NodeId,
    pub version_vector: VersionVector,
    /// Wall-clock timestamp (millis since epoch) taken at the writer.
    pub timestamp_ms: u64,
}

impl VersionedEntry {
    /// Create an entry stamped with the current time.
    pub fn new(
        key: impl Into<String>,
        value: impl Into<String>,
        writer: NodeId,
        version_vector: VersionVector,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            writer,
            version_vector,
            timestamp_ms: now_ms(),
        }
    }

    /// Identity of this version within its key: writer plus vector digest.
    /// Two entries with the same id are the same write.
    pub fn version_id(&self) -> String {
        format!("{}:{}", self.writer, self.version_vector.digest())
    }
}
