//! Metrics and tracing setup for quorumkv.
//!
//! One process-wide [`NodeMetrics`] registry covering replication, hinted
//! handoff, reconciliation jobs and circuit breakers, and a small hyper
//! server that exposes it at `GET /metrics`.

use prometheus::core::Collector;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber with env-filter (`RUST_LOG`,
/// default `info`).
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

static METRICS: OnceLock<NodeMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static NodeMetrics {
    METRICS.get_or_init(NodeMetrics::new)
}

/// All Prometheus metrics for a quorumkv node.
pub struct NodeMetrics {
    pub registry: Registry,

    // ── client operations ──
    pub writes: IntCounter,
    pub reads: IntCounter,

    // ── replication ──
    pub replication_success: IntCounter,
    pub replication_failure: IntCounter,
    pub replication_latency_secs: Histogram,
    /// Outbound replica RPCs by `rpc_type` and `outcome` (ok / error).
    pub replica_rpcs: IntCounterVec,
    /// Inbound RPCs by `rpc_type`.
    pub rpcs_received: IntCounterVec,
    pub rpc_latency_secs: HistogramVec,

    // ── hinted handoff ──
    pub hints_stored: IntCounter,
    pub hints_delivered: IntCounter,
    pub hints_expired: IntCounter,
    pub hints_pending: IntGauge,

    // ── anti-entropy ──
    pub jobs_scheduled: IntCounter,
    pub jobs_completed: IntCounter,
    pub jobs_failed: IntCounter,
    pub inconsistencies_found: IntCounter,

    pub circuit_breaker_opened: IntCounter,
}

impl std::fmt::Debug for NodeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeMetrics").finish_non_exhaustive()
    }
}

/// Default histogram buckets (seconds) for replication/RPC latency.
const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0];

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::with_opts(Opts::new(name, help)).expect("valid counter opts");
    register(registry, c)
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, collector: C) -> C {
    registry
        .register(Box::new(collector.clone()))
        .expect("metric registered once");
    collector
}

impl NodeMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let writes = counter(&registry, "quorumkv_writes_total", "Client write requests");
        let reads = counter(&registry, "quorumkv_reads_total", "Client read requests");

        let replication_success = counter(
            &registry,
            "quorumkv_replication_success_total",
            "Replicated writes that reached the write quorum",
        );
        let replication_failure = counter(
            &registry,
            "quorumkv_replication_failure_total",
            "Replicated writes that fell short of the write quorum",
        );
        let replication_latency_secs = register(
            &registry,
            Histogram::with_opts(
                HistogramOpts::new(
                    "quorumkv_replication_latency_seconds",
                    "Time from local write to quorum decision",
                )
                .buckets(LATENCY_BUCKETS.to_vec()),
            )
            .expect("replication latency histogram"),
        );
        let replica_rpcs = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "quorumkv_replica_rpcs_total",
                    "Outbound replica RPCs, by type and outcome",
                ),
                &["rpc_type", "outcome"],
            )
            .expect("replica_rpcs counter vec"),
        );
        let rpcs_received = register(
            &registry,
            IntCounterVec::new(
                Opts::new("quorumkv_rpcs_received_total", "Inbound requests, by type"),
                &["rpc_type"],
            )
            .expect("rpcs_received counter vec"),
        );
        let rpc_latency_secs = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new("quorumkv_rpc_latency_seconds", "RPC latency in seconds")
                    .buckets(LATENCY_BUCKETS.to_vec()),
                &["rpc_type", "direction"],
            )
            .expect("rpc latency histogram"),
        );

        let hints_stored = counter(&registry, "quorumkv_hints_stored_total", "Hints stored");
        let hints_delivered = counter(
            &registry,
            "quorumkv_hints_delivered_total",
            "Hints delivered to their target",
        );
        let hints_expired = counter(
            &registry,
            "quorumkv_hints_expired_total",
            "Hints expired by retry limit or TTL",
        );
        let hints_pending = register(
            &registry,
            IntGauge::with_opts(Opts::new("quorumkv_hints_pending", "Hints awaiting delivery"))
                .expect("hints_pending gauge"),
        );

        let jobs_scheduled = counter(
            &registry,
            "quorumkv_reconciliation_jobs_scheduled_total",
            "Reconciliation jobs scheduled",
        );
        let jobs_completed = counter(
            &registry,
            "quorumkv_reconciliation_jobs_completed_total",
            "Reconciliation jobs completed",
        );
        let jobs_failed = counter(
            &registry,
            "quorumkv_reconciliation_jobs_failed_total",
            "Reconciliation jobs failed",
        );
        let inconsistencies_found = counter(
            &registry,
            "quorumkv_inconsistencies_found_total",
            "Divergent segments reported by the comparison service",
        );

        let circuit_breaker_opened = counter(
            &registry,
            "quorumkv_circuit_breaker_opened_total",
            "Transitions of a per-node circuit breaker into the open state",
        );

        Self {
            registry,
            writes,
            reads,
            replication_success,
            replication_failure,
            replication_latency_secs,
            replica_rpcs,
            rpcs_received,
            rpc_latency_secs,
            hints_stored,
            hints_delivered,
            hints_expired,
            hints_pending,
            jobs_scheduled,
            jobs_completed,
            jobs_failed,
            inconsistencies_found,
            circuit_breaker_opened,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&metrics().registry.gather(), &mut buf) {
        tracing::warn!("prometheus encoding failed: {}", e);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Start a replication latency timer. Records elapsed time on drop.
pub fn start_replication_timer() -> prometheus::HistogramTimer {
    metrics().replication_latency_secs.start_timer()
}

/// Start an RPC latency timer. Records elapsed time on drop.
pub fn start_rpc_timer(rpc_type: &str, direction: &str) -> prometheus::HistogramTimer {
    metrics()
        .rpc_latency_secs
        .with_label_values(&[rpc_type, direction])
        .start_timer()
}

/// Count one outbound replica RPC.
pub fn record_replica_rpc(rpc_type: &str, ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    metrics()
        .replica_rpcs
        .with_label_values(&[rpc_type, outcome])
        .inc();
}

// ────────────────────────── Metrics HTTP server ──────────────────────────

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

async fn metrics_handler(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    if req.uri().path() != "/metrics" {
        let mut resp = Response::new(Full::new(Bytes::from_static(b"not found")));
        *resp.status_mut() = StatusCode::NOT_FOUND;
        return Ok(resp);
    }
    let mut resp = Response::new(Full::new(Bytes::from(encode_metrics())));
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );
    Ok(resp)
}

/// Serve Prometheus metrics on an already-bound listener (`GET /metrics`).
pub async fn serve_metrics_on(
    listener: TcpListener,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::debug!("metrics connection error: {}", e);
            }
        });
    }
}

/// Serve Prometheus metrics on the given address (`GET /metrics`).
///
/// Call from a `tokio::spawn`.
pub async fn serve_metrics(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on http://{}/metrics", addr);
    serve_metrics_on(listener).await
}

// ────────────────────────── Tests ──────────────────────────
