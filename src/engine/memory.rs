//! An in-memory engine implementing the [`Database`] seam: a string→bytes
//! map mutated by Put/Delete query blobs, with a hash-chained journal for
//! replication and catch-up. Concurrent transactions conflict when their
//! write sets overlap a commit that landed after they began.

use super::{Database, JournalEntry, Pool, Prepared};
use crate::encoding::bincode;
use crate::errdata;
use crate::error::{Error, Result};

use serde_derive::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

/// A single write in a query blob. A query blob is a bincode-encoded
/// Vec<Mutation>, applied atomically.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl Mutation {
    fn key(&self) -> &str {
        match self {
            Mutation::Put { key, .. } => key,
            Mutation::Delete { key } => key,
        }
    }
}

/// Encodes a set of mutations as a canonical query blob.
pub fn query(mutations: &[Mutation]) -> Result<Vec<u8>> {
    bincode::serialize(&mutations)
}

/// Encodes a single put as a query blob. Test convenience.
pub fn put(key: &str, value: &[u8]) -> Vec<u8> {
    query(&[Mutation::Put { key: key.into(), value: value.into() }])
        .expect("mutation encoding can't fail")
}

/// Computes the chained commit hash for a new entry: the digest covers the
/// previous hash, the commit index, and the canonical query blob, so equal
/// (count, hash) pairs imply equal committed logs.
fn chain_hash(prev: &str, count: u64, query: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev.as_bytes());
    hasher.update(count.to_be_bytes());
    hasher.update(query);
    hex::encode(hasher.finalize())
}

/// A committed journal entry plus the write set used for conflict checks.
struct Committed {
    entry: JournalEntry,
    write_set: HashSet<String>,
}

/// Shared engine state: the data map and the committed journal.
#[derive(Default)]
struct Inner {
    data: BTreeMap<String, Vec<u8>>,
    journal: Vec<Committed>,
}

impl Inner {
    fn last_hash(&self) -> &str {
        self.journal.last().map(|c| c.entry.hash.as_str()).unwrap_or("")
    }
}

/// The shared half of the in-memory engine. Cloning is cheap; all clones and
/// all handles observe the same database. Also serves as a test inspector.
#[derive(Clone, Default)]
pub struct Memory {
    inner: Arc<RwLock<Inner>>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an independent handle onto this database.
    pub fn handle(&self) -> Handle {
        Handle { inner: self.inner.clone(), txn: None }
    }

    /// Creates a pool of `size` independent handles (primary + workers).
    pub fn pool(&self, size: usize) -> Pool {
        Pool::new(
            (0..size)
                .map(|_| Arc::new(Mutex::new(Box::new(self.handle()) as Box<dyn Database>)))
                .collect(),
        )
    }

    /// Reads a committed value.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.read().expect("lock poisoned").data.get(key).cloned()
    }

    /// The current commit count.
    pub fn commit_count(&self) -> u64 {
        self.inner.read().expect("lock poisoned").journal.len() as u64
    }

    /// The current commit hash.
    pub fn commit_hash(&self) -> String {
        self.inner.read().expect("lock poisoned").last_hash().to_string()
    }
}

/// An open transaction on a handle.
struct Txn {
    /// The commit count observed at begin. Commits that land beyond it are
    /// checked for write-set overlap at commit time.
    snapshot: u64,
    /// Staged writes, in execution order.
    mutations: Vec<Mutation>,
}

/// One independent connection to a Memory database.
pub struct Handle {
    inner: Arc<RwLock<Inner>>,
    txn: Option<Txn>,
}

impl Handle {
    fn txn(&self) -> Result<&Txn> {
        self.txn.as_ref().ok_or_else(|| errdata!("no transaction open"))
    }

    fn canonical(&self) -> Result<Vec<u8>> {
        query(&self.txn()?.mutations)
    }
}

impl Database for Handle {
    fn begin(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return errdata!("transaction already open");
        }
        let snapshot = self.inner.read()?.journal.len() as u64;
        self.txn = Some(Txn { snapshot, mutations: Vec::new() });
        Ok(())
    }

    fn execute(&mut self, query: &[u8]) -> Result<()> {
        let mutations: Vec<Mutation> = bincode::deserialize(query)?;
        let txn = self.txn.as_mut().ok_or_else(|| -> Error { errdata!("no transaction open") })?;
        txn.mutations.extend(mutations);
        Ok(())
    }

    fn prepare(&mut self) -> Result<Prepared> {
        let query = self.canonical()?;
        let inner = self.inner.read()?;
        let count = inner.journal.len() as u64 + 1;
        let hash = chain_hash(inner.last_hash(), count, &query);
        Ok(Prepared { count, hash, query })
    }

    fn commit(&mut self, expected_hash: &str) -> Result<u64> {
        // The transaction is consumed regardless of outcome: both conflict
        // and divergence roll it back, and the caller restarts from begin.
        let txn = self.txn.take().ok_or_else(|| -> Error { errdata!("no transaction open") })?;
        let query = query(&txn.mutations)?;
        let write_set: HashSet<String> =
            txn.mutations.iter().map(|m| m.key().to_string()).collect();

        let mut inner = self.inner.write()?;

        // First committer wins: any commit past our snapshot that wrote one
        // of our keys invalidates this transaction.
        let conflict = inner.journal[txn.snapshot as usize..]
            .iter()
            .any(|c| !c.write_set.is_disjoint(&write_set));
        if conflict {
            return Err(Error::Serialization);
        }

        let count = inner.journal.len() as u64 + 1;
        let hash = chain_hash(inner.last_hash(), count, &query);
        if hash != expected_hash {
            return errdata!("commit hash mismatch at {count}: expected {expected_hash}, got {hash}");
        }

        for mutation in &txn.mutations {
            match mutation {
                Mutation::Put { key, value } => {
                    inner.data.insert(key.clone(), value.clone());
                }
                Mutation::Delete { key } => {
                    inner.data.remove(key);
                }
            }
        }
        inner.journal.push(Committed { entry: JournalEntry { count, hash, query }, write_set });
        Ok(count)
    }

    fn rollback(&mut self) -> Result<()> {
        self.txn = None;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    fn commit_count(&self) -> u64 {
        self.inner.read().expect("lock poisoned").journal.len() as u64
    }

    fn commit_hash(&self, index: u64) -> Result<Option<String>> {
        if index == 0 {
            return Ok(Some(String::new()));
        }
        let inner = self.inner.read()?;
        Ok(inner.journal.get(index as usize - 1).map(|c| c.entry.hash.clone()))
    }

    fn committed_entry(&self, index: u64) -> Result<Option<JournalEntry>> {
        if index == 0 {
            return Ok(None);
        }
        let inner = self.inner.read()?;
        Ok(inner.journal.get(index as usize - 1).map(|c| c.entry.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit_one(db: &mut Handle, blob: &[u8]) -> Result<u64> {
        db.begin()?;
        db.execute(blob)?;
        let prepared = db.prepare()?;
        db.commit(&prepared.hash)
    }

    #[test]
    fn commit_advances_count_and_hash() {
        let memory = Memory::new();
        let mut db = memory.handle();
        assert_eq!(db.commit_count(), 0);
        assert_eq!(db.commit_hash(0).unwrap(), Some(String::new()));

        assert_eq!(commit_one(&mut db, &put("a", b"1")).unwrap(), 1);
        assert_eq!(commit_one(&mut db, &put("b", b"2")).unwrap(), 2);
        assert_eq!(db.commit_count(), 2);
        assert_eq!(memory.get("a"), Some(b"1".to_vec()));
        assert_ne!(db.commit_hash(1).unwrap(), db.commit_hash(2).unwrap());
    }

    #[test]
    fn identical_logs_yield_identical_hashes() {
        let a = Memory::new();
        let b = Memory::new();
        for memory in [&a, &b] {
            let mut db = memory.handle();
            commit_one(&mut db, &put("x", b"1")).unwrap();
            commit_one(&mut db, &put("y", b"2")).unwrap();
        }
        assert_eq!(a.commit_hash(), b.commit_hash());
        assert_eq!(a.commit_count(), b.commit_count());
    }

    #[test]
    fn conflicting_writes_serialize() {
        let memory = Memory::new();
        let mut first = memory.handle();
        let mut second = memory.handle();

        first.begin().unwrap();
        first.execute(&put("k", b"first")).unwrap();
        second.begin().unwrap();
        second.execute(&put("k", b"second")).unwrap();

        let prepared = first.prepare().unwrap();
        first.commit(&prepared.hash).unwrap();

        // Second prepared against the old prefix; it conflicts on key k.
        let prepared = second.prepare().unwrap();
        assert_eq!(second.commit(&prepared.hash), Err(Error::Serialization));
        assert!(!second.in_transaction());

        // Re-executing from the top succeeds.
        assert_eq!(commit_one(&mut second, &put("k", b"second")).unwrap(), 2);
        assert_eq!(memory.get("k"), Some(b"second".to_vec()));
    }

    #[test]
    fn disjoint_writes_do_not_conflict() {
        let memory = Memory::new();
        let mut first = memory.handle();
        let mut second = memory.handle();

        first.begin().unwrap();
        first.execute(&put("a", b"1")).unwrap();
        second.begin().unwrap();
        second.execute(&put("b", b"2")).unwrap();
        // Prepared against the empty prefix, before first commits.
        let stale = second.prepare().unwrap();
        assert_eq!(stale.count, 1);

        let prepared = first.prepare().unwrap();
        first.commit(&prepared.hash).unwrap();

        // No write overlap, so no conflict, but the stale expected hash no
        // longer matches the chain: this is divergence, not serialization.
        assert!(matches!(second.commit(&stale.hash), Err(Error::InvalidData(_))));

        // Re-executed with a current expected hash, it commits cleanly.
        second.begin().unwrap();
        second.execute(&put("b", b"2")).unwrap();
        let prepared = second.prepare().unwrap();
        assert_eq!(second.commit(&prepared.hash).unwrap(), 2);
        assert_eq!(memory.get("a"), Some(b"1".to_vec()));
        assert_eq!(memory.get("b"), Some(b"2".to_vec()));
    }

    #[test]
    fn rollback_discards_writes() {
        let memory = Memory::new();
        let mut db = memory.handle();
        db.begin().unwrap();
        db.execute(&put("k", b"v")).unwrap();
        db.rollback().unwrap();
        assert_eq!(db.commit_count(), 0);
        assert_eq!(memory.get("k"), None);
    }

    #[test]
    fn journal_read_back() {
        let memory = Memory::new();
        let mut db = memory.handle();
        let blob = put("k", b"v");
        commit_one(&mut db, &blob).unwrap();

        let entry = db.committed_entry(1).unwrap().unwrap();
        assert_eq!(entry.count, 1);
        assert_eq!(entry.query, blob);
        assert_eq!(Some(entry.hash), db.commit_hash(1).unwrap());
        assert_eq!(db.committed_entry(2).unwrap(), None);
        assert_eq!(db.committed_entry(0).unwrap(), None);
    }
}
