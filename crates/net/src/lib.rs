//! HTTP networking layer for quorumkv.
//!
//! Provides:
//! - `build_router`: the axum routes of a node (client ingress, `/replicate`,
//!   `/health`, introspection)
//! - `HttpReplicaClient`: implements `ReplicaClient` over reqwest
//! - `HttpSegmentComparator`: implements `SegmentComparator` against the
//!   external comparison service

pub mod comparator;
pub mod replica_client;
pub mod server;

pub use comparator::HttpSegmentComparator;
pub use replica_client::HttpReplicaClient;
pub use server::{build_router, NodeState};

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}
