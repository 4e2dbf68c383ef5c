//! Durable id-keyed record table.
//!
//! Every insert and update appends the full record to a WAL; replay keeps
//! the last record written for each id. Used for hint and reconciliation
//! job bookkeeping, where each state transition must survive a restart.

use crate::engine::StorageError;
use crate::wal::{FsyncPolicy, Wal};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// A record stored in a [`DurableTable`].
pub trait TableRecord: Serialize + DeserializeOwned + Clone {
    fn record_id(&self) -> u64;
}

#[derive(Debug)]
pub struct DurableTable<R> {
    rows: BTreeMap<u64, R>,
    wal: Wal,
    next_id: u64,
}

impl<R: TableRecord> DurableTable<R> {
    /// Open or create a table backed by the WAL file at `path`.
    pub fn open(path: &Path, fsync: FsyncPolicy) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (wal, records) = Wal::recover::<R>(path, fsync)?;
        let mut rows = BTreeMap::new();
        for record in records {
            rows.insert(record.record_id(), record);
        }
        let next_id = rows.keys().next_back().map_or(1, |id| id + 1);

        tracing::debug!("table {:?} opened with {} rows", path, rows.len());
        Ok(Self { rows, wal, next_id })
    }

    /// Allocate the next id, build the record with it and persist it.
    pub fn insert_with(&mut self, build: impl FnOnce(u64) -> R) -> Result<R, StorageError> {
        let record = build(self.next_id);
        self.put(record.clone())?;
        Ok(record)
    }

    /// Persist a record under its id, replacing any previous row.
    pub fn put(&mut self, record: R) -> Result<(), StorageError> {
        self.wal.append(&record)?;
        let id = record.record_id();
        self.next_id = self.next_id.max(id + 1);
        self.rows.insert(id, record);
        Ok(())
    }

    pub fn get(&self, id: u64) -> Option<&R> {
        self.rows.get(&id)
    }

    /// All rows in id order.
    pub fn values(&self) -> impl Iterator<Item = &R> {
        self.rows.values()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn sync(&mut self) -> Result<(), StorageError> {
        self.wal.sync()?;
        Ok(())
    }
}
