//! Replicated KV layer: quorum writes over version vectors.
//!
//! Provides the replication coordinator with its follower fan-out,
//! hinted handoff for followers that miss a write, anti-entropy
//! reconciliation jobs, and per-node circuit breaking in front of the
//! replica transport.

pub mod anti_entropy;
pub mod chaos;
pub mod circuit_breaker;
pub mod comparator;
pub mod hint_manager;
pub mod hint_store;
pub mod job_store;
pub mod replica_client;
pub mod replication;

pub use anti_entropy::{AntiEntropyConfig, AntiEntropyCoordinator, AntiEntropyError};
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerReplicaClient, CircuitState};
pub use comparator::{CompareRequest, CompareResponse, ComparisonError, SegmentComparator};
pub use hint_manager::{DeliveryReport, HintConfig, HintManager};
pub use hint_store::{Hint, HintError, HintStats, HintStatus, HintStore};
pub use job_store::{JobStatus, JobStore, ReconciliationJob};
pub use replica_client::{ReplicaClient, ReplicaError, ReplicationRequest, ReplicationResponse};
pub use replication::{KvError, ReplicationConfig, ReplicationCoordinator, WriteOutcome};
