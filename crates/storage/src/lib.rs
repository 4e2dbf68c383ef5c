//! Storage for quorumkv: WAL + in-memory memtable of sibling versions.
//!
//! Entries are `{key, value, writer, version_vector, timestamp}`; every
//! live version of a key is retained. The WAL provides durability; the
//! memtable provides fast reads. [`DurableTable`] reuses the same WAL
//! for id-keyed record tables (hints, reconciliation jobs).

pub mod engine;
pub mod memtable;
pub mod record;
pub mod table;
pub mod wal;

pub use engine::{NodeStatus, StorageEngine, StorageError};
pub use record::VersionedEntry;
pub use table::{DurableTable, TableRecord};
pub use wal::FsyncPolicy;
