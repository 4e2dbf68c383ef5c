//! quorumkv-node: entry point for one replica of the quorum KV store.
//!
//! Loads config, opens the storage engine and the hint and job tables,
//! wires the replication, hint and anti-entropy coordinators, spawns
//! their periodic sweeps, then serves the HTTP API on the configured
//! listen address.

use quorumkv_config::NodeConfig;
use quorumkv_kv::{
    AntiEntropyConfig, AntiEntropyCoordinator, CircuitBreakerConfig, CircuitBreakerReplicaClient,
    HintConfig, HintManager, HintStore, JobStore, ReplicaClient, ReplicationConfig,
    ReplicationCoordinator,
};
use quorumkv_net::{build_router, HttpReplicaClient, HttpSegmentComparator, NodeState};
use quorumkv_storage::{FsyncPolicy, StorageEngine};
use std::future::IntoFuture;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    quorumkv_metrics::init_tracing();

    // First CLI arg is the YAML config path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = quorumkv_config::load_from_file(std::path::Path::new(&config_path))
        .map_err(|e| format!("failed to load config from {}: {}", config_path, e))?;
    tracing::info!(
        "node {} with {} peer(s), N={} W={}",
        config.node_id,
        config.peers.len(),
        config.replication.replication_factor,
        config.replication.write_quorum
    );

    let http = Arc::new(HttpReplicaClient::new(config.replication.timeout())?);
    if config.circuit_breaker.enabled {
        let breaker = CircuitBreakerReplicaClient::new(http, breaker_config(&config));
        run(config, Arc::new(breaker)).await
    } else {
        run(config, http).await
    }
}

async fn run<R: ReplicaClient>(config: NodeConfig, client: Arc<R>) -> Result<(), BoxError> {
    let fsync = FsyncPolicy::from_str_config(&config.storage.fsync);
    let data_dir = &config.storage.data_dir;

    let engine = StorageEngine::open(&data_dir.join("entries"), config.node_id.clone(), fsync)?;
    tracing::info!("storage opened with {} entries", engine.status().entry_count);
    let storage = Arc::new(RwLock::new(engine));
    let sync_every = Duration::from_millis(config.storage.sync_interval_ms);

    let hints = Arc::new(HintManager::new(
        HintStore::open(&data_dir.join("hints"), fsync)?,
        client.clone(),
        &config.peers,
        hint_config(&config),
    ));

    let mut coordinator = ReplicationCoordinator::new(
        config.node_id.clone(),
        storage.clone(),
        config.peers.clone(),
        config.partitions.clone(),
        client,
        replication_config(&config),
    );
    if config.replication.hinted_handoff {
        coordinator = coordinator.with_hint_manager(hints.clone());
        hints.spawn_hint_tasks();
    }

    let anti_entropy = match (&config.anti_entropy.comparator_url, config.anti_entropy.enabled) {
        (Some(url), true) => {
            let comparator = HttpSegmentComparator::new(url.as_str(), Duration::from_secs(30))?;
            let mut nodes: Vec<_> = config.peers.iter().map(|p| p.id.clone()).collect();
            nodes.push(config.node_id.clone());
            let ae = Arc::new(AntiEntropyCoordinator::new(
                JobStore::open(&data_dir.join("jobs"), fsync)?,
                Arc::new(comparator),
                config.partitions.clone(),
                nodes,
                anti_entropy_config(&config),
            ));
            ae.spawn_anti_entropy_tasks();
            tracing::info!("anti-entropy enabled against {}", url);
            Some(ae)
        }
        _ => None,
    };

    if fsync == FsyncPolicy::Batch {
        spawn_batch_sync(sync_every, storage, hints.clone(), anti_entropy.clone());
    }

    if let Some(metrics_port) = config.metrics_port {
        let metrics_addr = std::net::SocketAddr::from(([0, 0, 0, 0], metrics_port));
        tokio::spawn(async move {
            if let Err(e) = quorumkv_metrics::serve_metrics(metrics_addr).await {
                tracing::warn!("metrics server failed: {}", e);
            }
        });
    }

    let router = build_router(NodeState {
        coordinator: Arc::new(coordinator),
        hints: Some(hints),
        anti_entropy,
    });
    let listener = tokio::net::TcpListener::bind(config.listen).await?;

    // Serve with graceful shutdown on Ctrl+C
    tracing::info!("serving HTTP on {}", config.listen);
    tokio::select! {
        result = axum::serve(listener, router).into_future() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C, shutting down");
        }
    }

    Ok(())
}

/// `batch` fsync: force the entry, hint and job logs to disk on a timer.
fn spawn_batch_sync<R: ReplicaClient>(
    every: Duration,
    storage: Arc<RwLock<StorageEngine>>,
    hints: Arc<HintManager<R>>,
    anti_entropy: Option<Arc<AntiEntropyCoordinator<HttpSegmentComparator>>>,
) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        loop {
            tick.tick().await;
            if let Err(e) = storage.write().await.sync() {
                tracing::warn!("entry log sync failed: {}", e);
            }
            if let Err(e) = hints.sync().await {
                tracing::warn!("hint log sync failed: {}", e);
            }
            if let Some(ae) = &anti_entropy {
                if let Err(e) = ae.sync().await {
                    tracing::warn!("job log sync failed: {}", e);
                }
            }
        }
    });
}

fn replication_config(config: &NodeConfig) -> ReplicationConfig {
    let r = &config.replication;
    ReplicationConfig {
        replication_factor: r.replication_factor,
        write_quorum: r.write_quorum,
        timeout: r.timeout(),
        hinted_handoff: r.hinted_handoff,
        generation_id: r.generation_id,
    }
}

fn hint_config(config: &NodeConfig) -> HintConfig {
    let h = &config.hints;
    HintConfig {
        max_retries: h.max_retries,
        ttl: Duration::from_secs(h.ttl_secs),
        delivery_interval: Duration::from_secs(h.delivery_interval_secs),
        expiry_interval: Duration::from_secs(h.expiry_interval_secs),
        max_hints_per_cycle: h.max_hints_per_cycle,
    }
}

fn anti_entropy_config(config: &NodeConfig) -> AntiEntropyConfig {
    let a = &config.anti_entropy;
    AntiEntropyConfig {
        schedule_interval: Duration::from_secs(a.schedule_interval_secs),
        process_interval: Duration::from_secs(a.process_interval_secs),
        max_concurrent_jobs: a.max_concurrent_jobs,
        default_priority: a.default_priority,
    }
}

fn breaker_config(config: &NodeConfig) -> CircuitBreakerConfig {
    let c = &config.circuit_breaker;
    CircuitBreakerConfig {
        window_size: c.window_size,
        minimum_calls: c.minimum_calls,
        failure_rate_threshold: c.failure_rate_threshold,
        open_duration: Duration::from_millis(c.open_duration_ms),
        half_open_max_calls: c.half_open_max_calls,
    }
}
