//! Segment comparison collaborator used by anti-entropy.
//!
//! The comparison itself (Merkle diffing) runs in an external service;
//! the HTTP implementation lives in `quorumkv-net::comparator`.

use quorumkv_common::{NodeId, PartitionId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareRequest {
    pub partition_id: PartitionId,
    pub node1: NodeId,
    pub node2: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareResponse {
    pub inconsistent_segments: u64,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ComparisonError {
    #[error("comparison service unreachable: {0}")]
    Unreachable(String),
    #[error("comparison service returned status {0}")]
    Status(u16),
    #[error("invalid comparison response: {0}")]
    InvalidResponse(String),
}

#[async_trait::async_trait]
pub trait SegmentComparator: Send + Sync + 'static {
    /// Count the segments of `partition_id` that differ between two nodes.
    async fn compare(&self, request: &CompareRequest) -> Result<CompareResponse, ComparisonError>;
}
