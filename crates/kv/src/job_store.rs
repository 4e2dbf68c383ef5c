//! Durable reconciliation job table.
//!
//! Jobs move `PENDING → RUNNING → {COMPLETED | FAILED}` and are never
//! deleted. Each transition is a compare-and-set on the current status, so
//! two workers can never move the same job.

use quorumkv_common::{now_ms, NodeId, PartitionId};
use quorumkv_storage::{DurableTable, FsyncPolicy, StorageError, TableRecord};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationJob {
    pub id: u64,
    pub partition_id: PartitionId,
    pub node1: NodeId,
    pub node2: NodeId,
    pub status: JobStatus,
    pub inconsistencies_found: u64,
    pub inconsistencies_repaired: u64,
    pub scheduled_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
    pub priority: i32,
}

impl ReconciliationJob {
    /// Same partition and same unordered node pair.
    pub fn covers(&self, partition: &PartitionId, a: &NodeId, b: &NodeId) -> bool {
        &self.partition_id == partition
            && ((&self.node1 == a && &self.node2 == b) || (&self.node1 == b && &self.node2 == a))
    }
}

impl TableRecord for ReconciliationJob {
    fn record_id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug)]
pub struct JobStore {
    table: DurableTable<ReconciliationJob>,
    #[cfg(test)]
    write_faults: WriteFaults,
}

#[cfg(test)]
#[derive(Debug, Default)]
struct WriteFaults {
    skip: usize,
    fail: usize,
}

impl JobStore {
    /// Open the job table. Jobs left RUNNING by a previous process are
    /// marked FAILED so they free their concurrency slot and get
    /// rescheduled.
    pub fn open(dir: &Path, fsync: FsyncPolicy) -> Result<Self, StorageError> {
        let mut store = Self {
            table: DurableTable::open(&dir.join("reconciliation_jobs.wal"), fsync)?,
            #[cfg(test)]
            write_faults: WriteFaults::default(),
        };

        let orphaned: Vec<u64> = store
            .table
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .map(|j| j.id)
            .collect();
        for id in orphaned {
            tracing::warn!("reconciliation job {} was running at shutdown; marking failed", id);
            store.fail(id, now_ms())?;
        }
        Ok(store)
    }

    /// Create a PENDING job unless one already exists for the same
    /// partition and unordered pair. Returns the new job, if any.
    pub fn schedule_if_absent(
        &mut self,
        partition_id: &PartitionId,
        node1: &NodeId,
        node2: &NodeId,
        priority: i32,
    ) -> Result<Option<ReconciliationJob>, StorageError> {
        let exists = self
            .table
            .values()
            .any(|j| j.status == JobStatus::Pending && j.covers(partition_id, node1, node2));
        if exists {
            return Ok(None);
        }

        let job = self.table.insert_with(|id| ReconciliationJob {
            id,
            partition_id: partition_id.clone(),
            node1: node1.clone(),
            node2: node2.clone(),
            status: JobStatus::Pending,
            inconsistencies_found: 0,
            inconsistencies_repaired: 0,
            scheduled_at_ms: now_ms(),
            started_at_ms: None,
            completed_at_ms: None,
            priority,
        })?;
        Ok(Some(job))
    }

    /// PENDING jobs, highest priority first, then oldest first.
    pub fn pending_by_priority(&self) -> Vec<ReconciliationJob> {
        let mut pending = self.jobs(Some(JobStatus::Pending));
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.scheduled_at_ms.cmp(&b.scheduled_at_ms))
                .then(a.id.cmp(&b.id))
        });
        pending
    }

    /// PENDING → RUNNING. Returns the started job, or `None` if it was not
    /// pending.
    pub fn try_start(&mut self, id: u64, at_ms: u64) -> Result<Option<ReconciliationJob>, StorageError> {
        self.transition(id, JobStatus::Pending, |job| {
            job.status = JobStatus::Running;
            job.started_at_ms = Some(at_ms);
        })
    }

    /// RUNNING → COMPLETED.
    pub fn complete(
        &mut self,
        id: u64,
        found: u64,
        repaired: u64,
        at_ms: u64,
    ) -> Result<Option<ReconciliationJob>, StorageError> {
        self.transition(id, JobStatus::Running, |job| {
            job.status = JobStatus::Completed;
            job.inconsistencies_found = found;
            job.inconsistencies_repaired = repaired;
            job.completed_at_ms = Some(at_ms);
        })
    }

    /// RUNNING → FAILED.
    pub fn fail(&mut self, id: u64, at_ms: u64) -> Result<Option<ReconciliationJob>, StorageError> {
        self.transition(id, JobStatus::Running, |job| {
            job.status = JobStatus::Failed;
            job.completed_at_ms = Some(at_ms);
        })
    }

    pub fn get(&self, id: u64) -> Option<&ReconciliationJob> {
        self.table.get(id)
    }

    /// Jobs in id order, optionally filtered by status.
    pub fn jobs(&self, status: Option<JobStatus>) -> Vec<ReconciliationJob> {
        self.table
            .values()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect()
    }

    /// Force buffered transitions to disk.
    pub fn sync(&mut self) -> Result<(), StorageError> {
        self.table.sync()
    }

    pub fn running_count(&self) -> usize {
        self.table
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .count()
    }

    fn transition(
        &mut self,
        id: u64,
        from: JobStatus,
        apply: impl FnOnce(&mut ReconciliationJob),
    ) -> Result<Option<ReconciliationJob>, StorageError> {
        let mut job = match self.table.get(id) {
            Some(j) if j.status == from => j.clone(),
            _ => return Ok(None),
        };
        apply(&mut job);
        #[cfg(test)]
        self.inject_write_fault()?;
        self.table.put(job.clone())?;
        Ok(Some(job))
    }

    /// Let `skip` transitions through, then fail the next `n` as if the
    /// WAL write had.
    #[cfg(test)]
    pub(crate) fn fail_writes_after(&mut self, skip: usize, n: usize) {
        self.write_faults = WriteFaults { skip, fail: n };
    }

    #[cfg(test)]
    fn inject_write_fault(&mut self) -> Result<(), StorageError> {
        let faults = &mut self.write_faults;
        if faults.skip > 0 {
            faults.skip -= 1;
            return Ok(());
        }
        if faults.fail > 0 {
            faults.fail -= 1;
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected write failure",
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn p(id: &str) -> PartitionId {
        PartitionId::from(id)
    }

    fn n(id: &str) -> NodeId {
        NodeId::from(id)
    }

    fn open(dir: &TempDir) -> JobStore {
        JobStore::open(dir.path(), FsyncPolicy::None).unwrap()
    }

    #[test]
    fn test_schedule_dedups_unordered_pair() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);

        assert!(store
            .schedule_if_absent(&p("p1"), &n("a"), &n("b"), 5)
            .unwrap()
            .is_some());
        assert!(store
            .schedule_if_absent(&p("p1"), &n("b"), &n("a"), 5)
            .unwrap()
            .is_none());
        assert!(store
            .schedule_if_absent(&p("p1"), &n("a"), &n("b"), 9)
            .unwrap()
            .is_none());
        assert_eq!(store.jobs(Some(JobStatus::Pending)).len(), 1);

        // other partition or pair is a different job
        assert!(store
            .schedule_if_absent(&p("p2"), &n("a"), &n("b"), 5)
            .unwrap()
            .is_some());
        assert!(store
            .schedule_if_absent(&p("p1"), &n("a"), &n("c"), 5)
            .unwrap()
            .is_some());
        assert_eq!(store.jobs(None).len(), 3);
    }

    #[test]
    fn test_lifecycle_and_cas() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        let job = store
            .schedule_if_absent(&p("p1"), &n("a"), &n("b"), 5)
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        // cannot complete a job that is not running
        assert!(store.complete(job.id, 1, 1, 10).unwrap().is_none());

        let running = store.try_start(job.id, 10).unwrap().unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.started_at_ms, Some(10));
        assert!(store.try_start(job.id, 11).unwrap().is_none(), "second start must lose");
        assert_eq!(store.running_count(), 1);

        let done = store.complete(job.id, 4, 4, 20).unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.inconsistencies_found, 4);
        assert_eq!(done.completed_at_ms, Some(20));

        // terminal
        assert!(store.fail(job.id, 30).unwrap().is_none());
        assert_eq!(store.get(job.id).unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn test_terminal_job_does_not_block_rescheduling() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        let job = store
            .schedule_if_absent(&p("p1"), &n("a"), &n("b"), 5)
            .unwrap()
            .unwrap();
        store.try_start(job.id, 1).unwrap();
        store.fail(job.id, 2).unwrap();

        let again = store
            .schedule_if_absent(&p("p1"), &n("b"), &n("a"), 5)
            .unwrap();
        assert!(again.is_some());
        assert_eq!(store.jobs(Some(JobStatus::Failed)).len(), 1);
        assert_eq!(store.jobs(Some(JobStatus::Pending)).len(), 1);
    }

    #[test]
    fn test_pending_by_priority_then_age() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        let low = store.schedule_if_absent(&p("p1"), &n("a"), &n("b"), 1).unwrap().unwrap();
        let high = store.schedule_if_absent(&p("p1"), &n("a"), &n("c"), 9).unwrap().unwrap();
        let mid_old = store.schedule_if_absent(&p("p2"), &n("a"), &n("b"), 5).unwrap().unwrap();
        let mid_new = store.schedule_if_absent(&p("p3"), &n("a"), &n("b"), 5).unwrap().unwrap();

        let order: Vec<u64> = store.pending_by_priority().iter().map(|j| j.id).collect();
        assert_eq!(order, vec![high.id, mid_old.id, mid_new.id, low.id]);
    }

    #[test]
    fn test_running_jobs_fail_on_reopen() {
        let dir = TempDir::new().unwrap();
        let id = {
            let mut store = open(&dir);
            let job = store
                .schedule_if_absent(&p("p1"), &n("a"), &n("b"), 5)
                .unwrap()
                .unwrap();
            store.try_start(job.id, 1).unwrap();
            job.id
        };

        let store = open(&dir);
        let job = store.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.completed_at_ms.is_some());
        assert_eq!(store.running_count(), 0);
    }
}
