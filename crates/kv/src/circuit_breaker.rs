//! Per-node circuit breaking in front of the replication RPC.
//!
//! A [`CircuitBreaker`] keeps the outcomes of the last `window_size` calls.
//! Once at least `minimum_calls` are recorded and the failure fraction
//! reaches the threshold it opens, failing calls fast for `open_duration`.
//! It then lets `half_open_max_calls` trial calls through: all succeeding
//! closes it, any failing reopens it.

use crate::replica_client::{ReplicaClient, ReplicaError, ReplicationRequest, ReplicationResponse};
use quorumkv_common::{NodeId, Peer};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub window_size: usize,
    pub minimum_calls: usize,
    /// Failure fraction in `(0, 1]` that opens the breaker.
    pub failure_rate_threshold: f64,
    pub open_duration: Duration,
    pub half_open_max_calls: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            minimum_calls: 5,
            failure_rate_threshold: 0.5,
            open_duration: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { until: Instant },
    HalfOpen { admitted: usize, succeeded: usize },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    /// `true` = failure, newest at the back.
    window: VecDeque<bool>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            window: VecDeque::with_capacity(config.window_size),
            config,
            state: CircuitState::Closed,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether a call may proceed at `now`. An expired open period moves
    /// the breaker to half-open; half-open admits a bounded number of
    /// trial calls.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open { until } if now < until => false,
            CircuitState::Open { .. } => {
                self.state = CircuitState::HalfOpen {
                    admitted: 1,
                    succeeded: 0,
                };
                true
            }
            CircuitState::HalfOpen {
                admitted,
                succeeded,
            } => {
                if admitted < self.config.half_open_max_calls {
                    self.state = CircuitState::HalfOpen {
                        admitted: admitted + 1,
                        succeeded,
                    };
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self, _now: Instant) {
        match self.state {
            CircuitState::Closed => self.push(false),
            CircuitState::HalfOpen {
                admitted,
                succeeded,
            } => {
                let succeeded = succeeded + 1;
                if succeeded >= self.config.half_open_max_calls {
                    self.window.clear();
                    self.state = CircuitState::Closed;
                } else {
                    self.state = CircuitState::HalfOpen {
                        admitted,
                        succeeded,
                    };
                }
            }
            // a call admitted before the breaker opened
            CircuitState::Open { .. } => {}
        }
    }

    pub fn record_failure(&mut self, now: Instant) {
        match self.state {
            CircuitState::Closed => {
                self.push(true);
                if self.should_trip() {
                    self.trip(now);
                }
            }
            CircuitState::HalfOpen { .. } => self.trip(now),
            CircuitState::Open { .. } => {}
        }
    }

    fn push(&mut self, failed: bool) {
        if self.window.len() == self.config.window_size {
            self.window.pop_front();
        }
        self.window.push_back(failed);
    }

    fn should_trip(&self) -> bool {
        let calls = self.window.len();
        if calls == 0 || calls < self.config.minimum_calls {
            return false;
        }
        let failures = self.window.iter().filter(|f| **f).count();
        failures as f64 / calls as f64 >= self.config.failure_rate_threshold
    }

    fn trip(&mut self, now: Instant) {
        self.window.clear();
        self.state = CircuitState::Open {
            until: now + self.config.open_duration,
        };
        quorumkv_metrics::metrics().circuit_breaker_opened.inc();
    }
}

/// Wraps a [`ReplicaClient`] with one [`CircuitBreaker`] per target node.
/// Calls to a node whose breaker is open fail with
/// [`ReplicaError::CircuitOpen`] without reaching the inner client.
pub struct CircuitBreakerReplicaClient<R: ReplicaClient> {
    inner: Arc<R>,
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<NodeId, CircuitBreaker>>,
}

impl<R: ReplicaClient> std::fmt::Debug for CircuitBreakerReplicaClient<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerReplicaClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<R: ReplicaClient> CircuitBreakerReplicaClient<R> {
    pub fn new(inner: Arc<R>, config: CircuitBreakerConfig) -> Self {
        Self {
            inner,
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Current breaker state for a node; closed if it was never called.
    pub async fn state_of(&self, node: &NodeId) -> CircuitState {
        self.breakers
            .lock()
            .await
            .get(node)
            .map_or(CircuitState::Closed, |b| b.state())
    }

    async fn acquire(&self, target: &Peer) -> Result<(), ReplicaError> {
        let mut breakers = self.breakers.lock().await;
        let breaker = breakers
            .entry(target.id.clone())
            .or_insert_with(|| CircuitBreaker::new(self.config.clone()));
        if breaker.try_acquire(Instant::now()) {
            Ok(())
        } else {
            Err(ReplicaError::CircuitOpen(target.id.clone()))
        }
    }

    async fn record(&self, target: &Peer, ok: bool) {
        let mut breakers = self.breakers.lock().await;
        if let Some(breaker) = breakers.get_mut(&target.id) {
            let was_closed = breaker.state() == CircuitState::Closed;
            if ok {
                breaker.record_success(Instant::now());
            } else {
                breaker.record_failure(Instant::now());
            }
            if was_closed && matches!(breaker.state(), CircuitState::Open { .. }) {
                tracing::warn!("circuit breaker for {} opened", target.id);
            }
        }
    }
}

#[async_trait::async_trait]
impl<R: ReplicaClient> ReplicaClient for CircuitBreakerReplicaClient<R> {
    async fn replicate(
        &self,
        target: &Peer,
        request: &ReplicationRequest,
    ) -> Result<ReplicationResponse, ReplicaError> {
        self.acquire(target).await?;
        let result = self.inner.replicate(target, request).await;
        self.record(target, result.is_ok()).await;
        result
    }

    async fn health(&self, target: &Peer) -> Result<bool, ReplicaError> {
        self.acquire(target).await?;
        let result = self.inner.health(target).await;
        self.record(target, matches!(result, Ok(true))).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorumkv_common::VersionVector;
    use quorumkv_storage::VersionedEntry;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            window_size: 4,
            minimum_calls: 4,
            failure_rate_threshold: 0.5,
            open_duration: Duration::from_millis(100),
            half_open_max_calls: 2,
        }
    }

    #[test]
    fn test_stays_closed_below_minimum_calls() {
        let now = Instant::now();
        let mut cb = CircuitBreaker::new(config());
        for _ in 0..3 {
            cb.record_failure(now);
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire(now));
    }

    #[test]
    fn test_opens_at_failure_rate() {
        let now = Instant::now();
        let mut cb = CircuitBreaker::new(config());
        cb.record_success(now);
        cb.record_success(now);
        cb.record_failure(now);
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure(now); // 2 of 4
        assert!(matches!(cb.state(), CircuitState::Open { .. }));
        assert!(!cb.try_acquire(now));
    }

    #[test]
    fn test_window_slides() {
        let now = Instant::now();
        let mut cb = CircuitBreaker::new(config());
        cb.record_failure(now);
        for _ in 0..4 {
            cb.record_success(now);
        }
        // the early failure has slid out
        cb.record_failure(now);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_closes_after_trial_successes() {
        let now = Instant::now();
        let mut cb = CircuitBreaker::new(config());
        for _ in 0..4 {
            cb.record_failure(now);
        }
        let later = now + Duration::from_millis(150);
        assert!(cb.try_acquire(later));
        assert!(cb.try_acquire(later));
        assert!(!cb.try_acquire(later), "only two trial calls");
        cb.record_success(later);
        assert!(matches!(cb.state(), CircuitState::HalfOpen { .. }));
        cb.record_success(later);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let now = Instant::now();
        let mut cb = CircuitBreaker::new(config());
        for _ in 0..4 {
            cb.record_failure(now);
        }
        let later = now + Duration::from_millis(150);
        assert!(cb.try_acquire(later));
        cb.record_failure(later);
        assert!(!cb.try_acquire(later + Duration::from_millis(50)));
        assert!(cb.try_acquire(later + Duration::from_millis(150)));
    }

    struct FlakyClient {
        failing: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ReplicaClient for FlakyClient {
        async fn replicate(
            &self,
            target: &Peer,
            request: &ReplicationRequest,
        ) -> Result<ReplicationResponse, ReplicaError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(ReplicaError::Unreachable("down".into()));
            }
            Ok(ReplicationResponse {
                request_id: request.request_id.clone(),
                success: true,
                node_id: target.id.clone(),
                version: Some(request.entry.version_vector.clone()),
            })
        }

        async fn health(&self, _target: &Peer) -> Result<bool, ReplicaError> {
            Ok(!self.failing.load(Ordering::SeqCst))
        }
    }

    fn request() -> ReplicationRequest {
        let mut vv = VersionVector::new();
        vv.increment("n1");
        ReplicationRequest::new(VersionedEntry::new("k", "v", NodeId::from("n1"), vv), 0)
    }

    #[tokio::test]
    async fn test_open_breaker_fails_fast() {
        let inner = Arc::new(FlakyClient {
            failing: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        });
        let client = CircuitBreakerReplicaClient::new(
            inner.clone(),
            CircuitBreakerConfig {
                open_duration: Duration::from_secs(60),
                ..config()
            },
        );
        let n2 = Peer::with_dummy_addr("n2");
        let n3 = Peer::with_dummy_addr("n3");
        let req = request();

        for _ in 0..4 {
            assert!(matches!(
                client.replicate(&n2, &req).await,
                Err(ReplicaError::Unreachable(_))
            ));
        }
        assert!(matches!(
            client.replicate(&n2, &req).await,
            Err(ReplicaError::CircuitOpen(ref id)) if id.as_str() == "n2"
        ));
        assert!(matches!(
            client.health(&n2).await,
            Err(ReplicaError::CircuitOpen(_))
        ));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 4);

        // breakers are per node
        inner.failing.store(false, Ordering::SeqCst);
        assert!(client.replicate(&n3, &req).await.is_ok());
        assert_eq!(client.state_of(&n3.id).await, CircuitState::Closed);
    }
}
