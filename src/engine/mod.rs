//! The embedded transactional engine behind the replication core.
//!
//! The cluster does not implement storage itself: it drives an engine through
//! the [`Database`] trait and ships the engine's canonical query blobs and
//! commit hashes between nodes. Durability (e.g. a write-ahead log) is the
//! engine's concern. A handle represents one independent connection; the
//! replication workers each use their own handle from a shared [`Pool`] so
//! transactions can execute concurrently and commit in leader order.

pub mod memory;

pub use memory::Memory;

use crate::error::Result;

use serde_derive::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// A transaction prepared for commit: the canonical query blob to replicate,
/// the commit index it will occupy, and the commit hash it must produce.
#[derive(Clone, Debug, PartialEq)]
pub struct Prepared {
    /// The commit index this transaction will be assigned.
    pub count: u64,
    /// The expected commit hash after this transaction commits.
    pub hash: String,
    /// The canonical serialized form of the transaction's writes. Executing
    /// this blob on any node with the same committed prefix must yield the
    /// same commit hash.
    pub query: Vec<u8>,
}

/// A committed transaction read back from the engine's journal, used to
/// synchronize lagging peers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// The commit index.
    pub count: u64,
    /// The commit hash at this index.
    pub hash: String,
    /// The canonical query blob.
    #[serde(with = "serde_bytes")]
    pub query: Vec<u8>,
}

/// A single engine connection. Handles are independent: each can run one
/// transaction at a time against the shared database, and conflicting
/// concurrent transactions fail with Error::Serialization at commit.
///
/// The commit hash is a content-addressed digest of the committed log up to
/// an index, so two nodes with the same commit count and hash hold the same
/// data. Index 0 is the empty database with an empty hash.
pub trait Database: Send {
    /// Begins a transaction. Errors if one is already open on this handle.
    fn begin(&mut self) -> Result<()>;

    /// Executes a query blob inside the open transaction.
    fn execute(&mut self, query: &[u8]) -> Result<()>;

    /// Prepares the open transaction for commit, returning the canonical
    /// query blob and the commit index/hash it expects to produce. The
    /// transaction stays open.
    fn prepare(&mut self) -> Result<Prepared>;

    /// Commits the open transaction. The engine recomputes the commit hash
    /// against the current committed prefix and verifies it against
    /// expected_hash: a concurrency conflict yields Error::Serialization
    /// (retry from begin), a hash mismatch Error::InvalidData (divergent
    /// log). Either way the transaction is rolled back on error. Returns the
    /// new commit count on success.
    fn commit(&mut self, expected_hash: &str) -> Result<u64>;

    /// Rolls back the open transaction, if any.
    fn rollback(&mut self) -> Result<()>;

    /// Returns true if this handle has an open transaction.
    fn in_transaction(&self) -> bool;

    /// The current committed count.
    fn commit_count(&self) -> u64;

    /// The commit hash at the given index, or None if not committed yet.
    /// Index 0 returns the empty hash.
    fn commit_hash(&self, index: u64) -> Result<Option<String>>;

    /// Reads a committed transaction back from the journal.
    fn committed_entry(&self, index: u64) -> Result<Option<JournalEntry>>;
}

/// A shared engine handle. Locked for the duration of one transaction step;
/// replication workers block on the lock when the pool is oversubscribed.
pub type SharedDatabase = Arc<Mutex<Box<dyn Database>>>;

/// A fixed-size pool of independent engine handles. Handle 0 is the sync
/// thread's primary handle; the rest are assigned to replication workers.
pub struct Pool {
    handles: Vec<SharedDatabase>,
}

impl Pool {
    /// Creates a pool from a set of handles. Needs at least a primary handle
    /// and one worker handle.
    pub fn new(handles: Vec<SharedDatabase>) -> Self {
        assert!(handles.len() >= 2, "pool needs at least 2 handles");
        Self { handles }
    }

    /// Returns the primary handle, reserved for the sync thread and local
    /// command execution.
    pub fn primary(&self) -> SharedDatabase {
        self.handles[0].clone()
    }

    /// Returns the handle at the given index, wrapping around the pool size.
    /// Index 0 is never handed to workers.
    pub fn worker(&self, index: u64) -> SharedDatabase {
        let workers = self.handles.len() as u64 - 1;
        self.handles[1 + (index % workers) as usize].clone()
    }

    /// The number of handles, including the primary.
    pub fn size(&self) -> usize {
        self.handles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_worker_skips_primary() {
        let memory = Memory::new();
        let pool = memory.pool(3);
        assert_eq!(pool.size(), 3);
        // Worker indexes wrap around handles 1 and 2, never 0.
        assert!(!Arc::ptr_eq(&pool.worker(0), &pool.primary()));
        assert!(!Arc::ptr_eq(&pool.worker(1), &pool.primary()));
        assert!(Arc::ptr_eq(&pool.worker(0), &pool.worker(2)));
    }
}
