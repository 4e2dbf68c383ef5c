//! Anti-entropy: turns replica divergence into reconciliation jobs.
//!
//! Scheduling and processing run on independent timers. Scheduling files a
//! PENDING job per partition and unordered replica pair; processing starts
//! the highest-priority jobs up to a global RUNNING cap and asks the
//! [`SegmentComparator`] how many segments differ.

use crate::comparator::{CompareRequest, CompareResponse, ComparisonError, SegmentComparator};
use crate::job_store::{JobStatus, JobStore, ReconciliationJob};
use futures::future::join_all;
use quorumkv_common::{now_ms, NodeId, PartitionId};
use quorumkv_storage::StorageError;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{interval, Duration};

#[derive(Debug, thiserror::Error)]
pub enum AntiEntropyError {
    #[error("job storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub struct AntiEntropyConfig {
    pub schedule_interval: Duration,
    pub process_interval: Duration,
    /// Upper bound on jobs RUNNING at once.
    pub max_concurrent_jobs: usize,
    pub default_priority: i32,
}

impl Default for AntiEntropyConfig {
    fn default() -> Self {
        Self {
            schedule_interval: Duration::from_secs(60),
            process_interval: Duration::from_secs(10),
            max_concurrent_jobs: 3,
            default_priority: 5,
        }
    }
}

pub struct AntiEntropyCoordinator<C: SegmentComparator> {
    jobs: Mutex<JobStore>,
    comparator: Arc<C>,
    partitions: Vec<PartitionId>,
    /// Every replica in the cluster, this node included.
    nodes: Vec<NodeId>,
    config: AntiEntropyConfig,
}

impl<C: SegmentComparator> std::fmt::Debug for AntiEntropyCoordinator<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AntiEntropyCoordinator")
            .field("partitions", &self.partitions)
            .field("nodes", &self.nodes)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<C: SegmentComparator> AntiEntropyCoordinator<C> {
    pub fn new(
        jobs: JobStore,
        comparator: Arc<C>,
        partitions: Vec<PartitionId>,
        mut nodes: Vec<NodeId>,
        config: AntiEntropyConfig,
    ) -> Self {
        nodes.sort();
        nodes.dedup();
        Self {
            jobs: Mutex::new(jobs),
            comparator,
            partitions,
            nodes,
            config,
        }
    }

    /// File a PENDING job for every partition and unordered pair of
    /// distinct nodes that has none yet. Returns the jobs created.
    pub async fn schedule_reconciliation(&self) -> Result<Vec<ReconciliationJob>, AntiEntropyError> {
        let mut store = self.jobs.lock().await;
        let mut created = Vec::new();

        for partition in &self.partitions {
            for (i, a) in self.nodes.iter().enumerate() {
                for b in &self.nodes[i + 1..] {
                    if let Some(job) =
                        store.schedule_if_absent(partition, a, b, self.config.default_priority)?
                    {
                        created.push(job);
                    }
                }
            }
        }

        if !created.is_empty() {
            quorumkv_metrics::metrics()
                .jobs_scheduled
                .inc_by(created.len() as u64);
            tracing::info!("scheduled {} reconciliation jobs", created.len());
        }
        Ok(created)
    }

    /// Start as many PENDING jobs as the RUNNING cap allows, run their
    /// comparisons concurrently and record the results. Returns the jobs
    /// this cycle finished, in the order they were started.
    ///
    /// Storage errors are handled per job: every job that reached RUNNING
    /// is compared and then recorded, or failed if recording its outcome
    /// did not persist.
    pub async fn process_jobs(&self) -> Vec<ReconciliationJob> {
        let started = {
            let mut store = self.jobs.lock().await;
            let slots = self
                .config
                .max_concurrent_jobs
                .saturating_sub(store.running_count());

            let mut started = Vec::new();
            for job in store.pending_by_priority() {
                if started.len() >= slots {
                    break;
                }
                match store.try_start(job.id, now_ms()) {
                    Ok(Some(job)) => started.push(job),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(job = job.id, "could not start reconciliation job: {}", e);
                        break;
                    }
                }
            }
            started
        };

        if started.is_empty() {
            return Vec::new();
        }
        tracing::debug!("processing {} reconciliation jobs", started.len());

        let results = join_all(started.iter().map(|job| {
            let request = CompareRequest {
                partition_id: job.partition_id.clone(),
                node1: job.node1.clone(),
                node2: job.node2.clone(),
            };
            async move { self.comparator.compare(&request).await }
        }))
        .await;

        let mut store = self.jobs.lock().await;
        started
            .iter()
            .zip(results)
            .filter_map(|(job, result)| record_outcome(&mut store, job, result))
            .collect()
    }

    /// Jobs in id order, optionally filtered by status.
    pub async fn jobs(&self, status: Option<JobStatus>) -> Vec<ReconciliationJob> {
        self.jobs.lock().await.jobs(status)
    }

    /// Flush the job table to disk.
    pub async fn sync(&self) -> Result<(), AntiEntropyError> {
        self.jobs.lock().await.sync()?;
        Ok(())
    }

    /// Spawn the scheduling and processing loops.
    pub fn spawn_anti_entropy_tasks(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let schedule = {
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                let mut tick = interval(coordinator.config.schedule_interval);
                loop {
                    tick.tick().await;
                    if let Err(e) = coordinator.schedule_reconciliation().await {
                        tracing::error!("reconciliation scheduling failed: {}", e);
                    }
                }
            })
        };
        let process = {
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                let mut tick = interval(coordinator.config.process_interval);
                loop {
                    tick.tick().await;
                    coordinator.process_jobs().await;
                }
            })
        };
        vec![schedule, process]
    }
}

/// Persist one comparison result. A job whose outcome cannot be written is
/// failed instead so it stops holding a RUNNING slot.
fn record_outcome(
    store: &mut JobStore,
    job: &ReconciliationJob,
    result: Result<CompareResponse, ComparisonError>,
) -> Option<ReconciliationJob> {
    let m = quorumkv_metrics::metrics();
    let recorded = match result {
        Ok(response) => {
            let found = response.inconsistent_segments;
            if found > 0 {
                tracing::info!(
                    job = job.id,
                    partition = %job.partition_id,
                    "{} and {} differ in {} segments",
                    job.node1,
                    job.node2,
                    found
                );
            }
            // Repair is not wired; the repaired count mirrors found.
            store.complete(job.id, found, found, now_ms()).map(|done| {
                if done.is_some() {
                    m.jobs_completed.inc();
                    m.inconsistencies_found.inc_by(found);
                }
                done
            })
        }
        Err(e) => {
            tracing::warn!(
                job = job.id,
                partition = %job.partition_id,
                "comparison of {} and {} failed: {}",
                job.node1,
                job.node2,
                e
            );
            store.fail(job.id, now_ms()).map(|done| {
                if done.is_some() {
                    m.jobs_failed.inc();
                }
                done
            })
        }
    };

    match recorded {
        Ok(done) => done,
        Err(e) => {
            tracing::warn!(job = job.id, "could not record reconciliation result: {}", e);
            match store.fail(job.id, now_ms()) {
                Ok(done) => {
                    if done.is_some() {
                        m.jobs_failed.inc();
                    }
                    done
                }
                Err(e) => {
                    tracing::error!(job = job.id, "reconciliation job stuck RUNNING: {}", e);
                    None
                }
            }
        }
    }
}
