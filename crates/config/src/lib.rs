//! Configuration schema and loader for quorumkv nodes.

use quorumkv_common::{NodeId, PartitionId, Peer};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Replica id of this node. Used as its key in version vectors.
    pub node_id: NodeId,

    /// This node's HTTP listen address.
    pub listen: SocketAddr,

    /// The other replicas of the static replica set.
    #[serde(default)]
    pub peers: Vec<Peer>,

    /// Partitions hints and reconciliation jobs are filed under.
    #[serde(default = "default_partitions")]
    pub partitions: Vec<PartitionId>,

    #[serde(default)]
    pub replication: ReplicationSettings,

    #[serde(default)]
    pub hints: HintSettings,

    #[serde(default)]
    pub anti_entropy: AntiEntropySettings,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Optional Prometheus metrics HTTP port.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// Replication factor (N), counting this node.
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,

    /// Acknowledgements (local write included) needed for a successful write.
    #[serde(default = "default_write_quorum")]
    pub write_quorum: usize,

    /// Deadline for the follower fan-out, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Whether failed follower writes are buffered as hints.
    #[serde(default = "default_true")]
    pub hinted_handoff: bool,

    /// Leadership epoch stamped on outgoing replication requests.
    #[serde(default)]
    pub generation_id: u64,
}

impl ReplicationSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            replication_factor: default_replication_factor(),
            write_quorum: default_write_quorum(),
            timeout_ms: default_timeout_ms(),
            hinted_handoff: true,
            generation_id: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HintSettings {
    /// Delivery sweep interval in seconds.
    #[serde(default = "default_hint_delivery_interval_secs")]
    pub delivery_interval_secs: u64,

    /// TTL expiry sweep interval in seconds.
    #[serde(default = "default_hint_expiry_interval_secs")]
    pub expiry_interval_secs: u64,

    /// Age after which a pending hint is expired regardless of retries.
    #[serde(default = "default_hint_ttl_secs")]
    pub ttl_secs: u64,

    /// Failed delivery attempts before a hint expires.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Maximum hints to attempt delivery per cycle.
    #[serde(default = "default_max_hints_per_cycle")]
    pub max_hints_per_cycle: usize,
}

impl Default for HintSettings {
    fn default() -> Self {
        Self {
            delivery_interval_secs: default_hint_delivery_interval_secs(),
            expiry_interval_secs: default_hint_expiry_interval_secs(),
            ttl_secs: default_hint_ttl_secs(),
            max_retries: default_max_retries(),
            max_hints_per_cycle: default_max_hints_per_cycle(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AntiEntropySettings {
    #[serde(default)]
    pub enabled: bool,

    /// Base URL of the segment comparison service.
    #[serde(default)]
    pub comparator_url: Option<String>,

    #[serde(default = "default_schedule_interval_secs")]
    pub schedule_interval_secs: u64,

    #[serde(default = "default_process_interval_secs")]
    pub process_interval_secs: u64,

    /// Hard cap on simultaneously RUNNING jobs.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    #[serde(default = "default_priority")]
    pub default_priority: i32,
}

impl Default for AntiEntropySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            comparator_url: None,
            schedule_interval_secs: default_schedule_interval_secs(),
            process_interval_secs: default_process_interval_secs(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            default_priority: default_priority(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Number of most recent calls the failure rate is computed over.
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Calls required in the window before the breaker may trip.
    #[serde(default = "default_minimum_calls")]
    pub minimum_calls: usize,

    /// Failure fraction in `(0, 1]` that opens the breaker.
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,

    #[serde(default = "default_open_duration_ms")]
    pub open_duration_ms: u64,

    /// Consecutive successful trial calls that close a half-open breaker.
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: usize,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            window_size: default_window_size(),
            minimum_calls: default_minimum_calls(),
            failure_rate_threshold: default_failure_rate_threshold(),
            open_duration_ms: default_open_duration_ms(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for WAL and data files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Fsync policy: "always", "batch", "none".
    #[serde(default = "default_fsync")]
    pub fsync: String,

    /// How often `batch` mode forces the logs to disk.
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            fsync: default_fsync(),
            sync_interval_ms: default_sync_interval_ms(),
        }
    }
}

// --- Defaults ---

fn default_partitions() -> Vec<PartitionId> {
    (1..=3)
        .map(|i| PartitionId::new(format!("partition-{}", i)))
        .collect()
}
fn default_replication_factor() -> usize {
    3
}
fn default_write_quorum() -> usize {
    2
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_true() -> bool {
    true
}
fn default_hint_delivery_interval_secs() -> u64 {
    5
}
fn default_hint_expiry_interval_secs() -> u64 {
    60
}
fn default_hint_ttl_secs() -> u64 {
    3 * 60 * 60
}
fn default_max_retries() -> u32 {
    3
}
fn default_max_hints_per_cycle() -> usize {
    100
}
fn default_schedule_interval_secs() -> u64 {
    60
}
fn default_process_interval_secs() -> u64 {
    10
}
fn default_max_concurrent_jobs() -> usize {
    3
}
fn default_priority() -> i32 {
    5
}
fn default_window_size() -> usize {
    10
}
fn default_minimum_calls() -> usize {
    5
}
fn default_failure_rate_threshold() -> f64 {
    0.5
}
fn default_open_duration_ms() -> u64 {
    30_000
}
fn default_half_open_max_calls() -> usize {
    1
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_fsync() -> String {
    "batch".to_string()
}
fn default_sync_interval_ms() -> u64 {
    1000
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl NodeConfig {
    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let repl = &self.replication;
        if repl.replication_factor == 0 {
            return Err(ConfigError::Invalid(
                "replication.replication_factor must be > 0".into(),
            ));
        }
        if repl.write_quorum == 0 || repl.write_quorum > repl.replication_factor {
            return Err(ConfigError::Invalid(format!(
                "replication.write_quorum ({}) must be in 1..={}",
                repl.write_quorum, repl.replication_factor
            )));
        }

        let mut seen = HashSet::new();
        seen.insert(&self.node_id);
        for peer in &self.peers {
            if !seen.insert(&peer.id) {
                return Err(ConfigError::Invalid(format!(
                    "peers: duplicate node id {}",
                    peer.id
                )));
            }
        }
        if repl.replication_factor != self.peers.len() + 1 {
            return Err(ConfigError::Invalid(format!(
                "replication.replication_factor ({}) must match the replica set ({} peers + self)",
                repl.replication_factor,
                self.peers.len()
            )));
        }

        if self.partitions.is_empty() {
            return Err(ConfigError::Invalid("partitions must not be empty".into()));
        }
        if self.storage.sync_interval_ms == 0 {
            return Err(ConfigError::Invalid("storage.sync_interval_ms must be > 0".into()));
        }
        if self.hints.max_retries == 0 {
            return Err(ConfigError::Invalid("hints.max_retries must be > 0".into()));
        }
        if self.anti_entropy.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid(
                "anti_entropy.max_concurrent_jobs must be > 0".into(),
            ));
        }
        if self.anti_entropy.enabled && self.anti_entropy.comparator_url.is_none() {
            return Err(ConfigError::Invalid(
                "anti_entropy.comparator_url is required when anti_entropy.enabled".into(),
            ));
        }
        let threshold = self.circuit_breaker.failure_rate_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "circuit_breaker.failure_rate_threshold ({}) must be in (0, 1]",
                threshold
            )));
        }
        Ok(())
    }
}

/// Load a `NodeConfig` from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<NodeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `NodeConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<NodeConfig, ConfigError> {
    let config: NodeConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const THREE_NODES: &str = r#"
node_id: n1
listen: "127.0.0.1:7001"
peers:
  - { id: n2, addr: "127.0.0.1:7002" }
  - { id: n3, addr: "127.0.0.1:7003" }
"#;

    #[test]
    fn test_parse_minimal_config() {
        let config = load_from_str(THREE_NODES).unwrap();
        assert_eq!(config.node_id.as_str(), "n1");
        assert_eq!(config.listen.port(), 7001);
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[1].addr.port(), 7003);
        assert_eq!(config.partitions.len(), 3);
        assert_eq!(config.partitions[0].as_str(), "partition-1");
        assert_eq!(config.replication.replication_factor, 3);
        assert_eq!(config.replication.write_quorum, 2);
        assert_eq!(config.replication.timeout(), Duration::from_secs(5));
        assert_eq!(config.hints.max_retries, 3);
        assert_eq!(config.hints.ttl_secs, 10_800);
        assert!(!config.anti_entropy.enabled);
        assert!(config.circuit_breaker.enabled);
        assert_eq!(config.storage.fsync, "batch");
        assert_eq!(config.storage.sync_interval_ms, 1000);
        assert!(config.metrics_port.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
node_id: a
listen: "0.0.0.0:8000"
peers:
  - { id: b, addr: "10.0.0.2:8000" }
partitions: [p1]
replication:
  replication_factor: 2
  write_quorum: 2
  timeout_ms: 250
  hinted_handoff: false
  generation_id: 7
hints:
  delivery_interval_secs: 1
  ttl_secs: 60
  max_retries: 5
anti_entropy:
  enabled: true
  comparator_url: "http://127.0.0.1:9100"
  max_concurrent_jobs: 2
circuit_breaker:
  failure_rate_threshold: 1.0
storage:
  data_dir: /tmp/quorumkv-test
  fsync: always
metrics_port: 9400
"#;
        let config = load_from_str(yaml).unwrap();
        assert_eq!(config.replication.timeout_ms, 250);
        assert!(!config.replication.hinted_handoff);
        assert_eq!(config.replication.generation_id, 7);
        assert_eq!(config.hints.max_retries, 5);
        assert_eq!(config.hints.expiry_interval_secs, 60);
        assert_eq!(
            config.anti_entropy.comparator_url.as_deref(),
            Some("http://127.0.0.1:9100")
        );
        assert_eq!(config.anti_entropy.max_concurrent_jobs, 2);
        assert_eq!(config.storage.fsync, "always");
        assert_eq!(config.metrics_port, Some(9400));
    }

    #[test]
    fn test_roundtrip_yaml() {
        let config = load_from_str(THREE_NODES).unwrap();
        let serialized = serde_yaml::to_string(&config).unwrap();
        let config2 = load_from_str(&serialized).unwrap();
        assert_eq!(config.listen, config2.listen);
        assert_eq!(config.peers, config2.peers);
        assert_eq!(config.partitions, config2.partitions);
    }

    fn expect_invalid(yaml: &str, needle: &str) {
        let err = load_from_str(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "got {:?}", err);
        let msg = err.to_string();
        assert!(msg.contains(needle), "error should mention {}: {}", needle, msg);
    }

    #[test]
    fn test_rejects_quorum_above_replication_factor() {
        let yaml = format!(
            "{}replication: {{ replication_factor: 3, write_quorum: 4 }}\n",
            THREE_NODES
        );
        expect_invalid(&yaml, "write_quorum");
    }

    #[test]
    fn test_rejects_quorum_above_replica_set() {
        let yaml = r#"
node_id: n1
listen: "127.0.0.1:7001"
replication: { write_quorum: 2 }
"#;
        expect_invalid(yaml, "replica set");
    }

    #[test]
    fn test_rejects_replication_factor_below_peer_count() {
        let yaml = r#"
node_id: n1
listen: "127.0.0.1:7001"
peers:
  - { id: n2, addr: "127.0.0.1:7002" }
  - { id: n3, addr: "127.0.0.1:7003" }
  - { id: n4, addr: "127.0.0.1:7004" }
  - { id: n5, addr: "127.0.0.1:7005" }
replication: { replication_factor: 3, write_quorum: 2 }
"#;
        expect_invalid(yaml, "replica set");
    }

    #[test]
    fn test_rejects_zero_replication_factor() {
        let yaml = format!(
            "{}replication: {{ replication_factor: 0, write_quorum: 0 }}\n",
            THREE_NODES
        );
        expect_invalid(&yaml, "replication_factor");
    }

    #[test]
    fn test_rejects_peer_reusing_own_id() {
        let yaml = r#"
node_id: n1
listen: "127.0.0.1:7001"
peers:
  - { id: n1, addr: "127.0.0.1:7002" }
"#;
        expect_invalid(yaml, "duplicate");
    }

    #[test]
    fn test_rejects_empty_partitions() {
        let yaml = format!("{}partitions: []\n", THREE_NODES);
        expect_invalid(&yaml, "partitions");
    }

    #[test]
    fn test_rejects_anti_entropy_without_comparator() {
        let yaml = format!("{}anti_entropy: {{ enabled: true }}\n", THREE_NODES);
        expect_invalid(&yaml, "comparator_url");
    }

    #[test]
    fn test_rejects_bad_breaker_threshold() {
        let yaml = format!(
            "{}circuit_breaker: {{ failure_rate_threshold: 0.0 }}\n",
            THREE_NODES
        );
        expect_invalid(&yaml, "failure_rate_threshold");
    }

    #[test]
    fn test_missing_node_id_is_parse_error() {
        let err = load_from_str("listen: \"127.0.0.1:7001\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }
}
