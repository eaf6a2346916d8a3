//! The parallel replication worker. The sync thread spawns one short-lived
//! worker per incoming BEGIN_TRANSACTION; workers execute their transactions
//! concurrently on separate pool handles, then rendezvous on the sequential
//! notifiers so commits land in exactly the order the leader chose.
//!
//! A worker for commit index `id`:
//!
//! 1. Executes the shipped query blob on its own handle and acknowledges
//!    APPROVE (or DENY on failure) directly to the current leader.
//! 2. Waits for the leader to order the commit (the leader-commit notifier,
//!    fed by COMMIT_TRANSACTION, cancelled by ROLLBACK_TRANSACTION).
//! 3. Waits for its predecessor `id - 1` to commit locally (the local-commit
//!    notifier).
//! 4. Commits against the leader's expected hash. A conflict with an earlier
//!    commit rolls back and re-executes the same ticket from the top; a hash
//!    mismatch is fatal log divergence and sends the node back to SEARCHING.

use super::message::{self, Message};
use super::node::{ConsistencyLevel, Shared};
use super::notifier::WaitResult;
use super::transport::Event;
use crate::engine::SharedDatabase;
use crate::error::{Error, Result};

use log::{debug, error, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Decrements the replication thread count when the worker exits, however it
/// exits. The sync thread joins on the count reaching zero.
struct CountGuard(Arc<Shared>);

impl Drop for CountGuard {
    fn drop(&mut self) {
        self.0.replication_thread_count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Spawns a replication worker for one BEGIN_TRANSACTION. The thread count
/// is incremented here, on the sync thread, so a just-spawned worker is
/// never missed by a concurrent join.
pub(super) fn spawn(shared: Arc<Shared>, db: SharedDatabase, message: Message) {
    shared.replication_thread_count.fetch_add(1, Ordering::AcqRel);
    let id = message.get_u64(message::ID).unwrap_or(0);
    let result = std::thread::Builder::new()
        .name(format!("replicate-{}-{id}", shared.name))
        .spawn({
            let shared = shared.clone();
            move || {
                let guard = CountGuard(shared);
                let shared = &guard.0;
                match replicate(shared, &db, &message) {
                    Ok(()) => {}
                    Err(Error::Abort) => debug!("replication of {id} abandoned"),
                    Err(err) => {
                        error!("replication of {id} failed: {err}");
                        shared.replication_failed.store(true, Ordering::Release);
                        let _ = shared.event_tx.send(Event::Wake);
                    }
                }
            }
        });
    if let Err(err) = result {
        // The worker never started, so its guard will never decrement.
        error!("failed to spawn replication worker: {err}");
        shared.replication_thread_count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The worker body. Any error return leaves no transaction open.
fn replicate(shared: &Shared, db: &SharedDatabase, message: &Message) -> Result<()> {
    let id = message.get_u64(message::ID)?;
    let new_hash = message.get(message::NEW_HASH)?;
    let consistency = message.get_consistency(message::CONSISTENCY)?;

    let mut db = db.lock()?;
    let mut was_conflict = false;
    loop {
        if shared.replication_threads_should_exit.load(Ordering::Acquire) {
            return Err(Error::Abort);
        }

        db.begin()?;
        if let Err(err) = db.execute(&message.body).and_then(|()| db.prepare().map(|_| ())) {
            db.rollback()?;
            if !was_conflict {
                respond(shared, message::DENY_TRANSACTION, id);
            }
            return Err(err);
        }
        // Acknowledge on the first pass only; a conflict retry was already
        // approved, and ASYNC commits don't wait for approval at all.
        if !was_conflict && consistency != ConsistencyLevel::Async {
            respond(shared, message::APPROVE_TRANSACTION, id);
        }

        // The leader must have ordered this commit.
        if shared.leader_commit.wait_for(id) == WaitResult::Cancelled {
            db.rollback()?;
            return Err(Error::Abort);
        }
        // Our predecessor must have committed locally.
        if shared.local_commit.wait_for(id - 1) == WaitResult::Cancelled {
            db.rollback()?;
            return Err(Error::Abort);
        }

        match db.commit(new_hash) {
            Ok(count) => {
                shared.handled_commit_count.fetch_add(1, Ordering::AcqRel);
                shared.local_commit.notify_through(count);
                return Ok(());
            }
            Err(Error::Serialization) => {
                // An earlier ticket wrote our keys after we executed.
                // Re-execute against the now-committed prefix.
                debug!("commit {id} conflicted, re-executing");
                was_conflict = true;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Sends an approval or denial for a transaction directly to the current
/// leader. The lead peer is read under its shared lock for the duration of
/// one send; failures are left for the sync thread's reconnect machinery.
fn respond(shared: &Shared, kind: &str, id: u64) {
    let lead_peer = shared.lead_peer.read().expect("lock poisoned");
    match lead_peer.as_ref() {
        Some(peer) => {
            if let Err(err) = peer.send_message(&Message::new(kind).with(message::ID, id)) {
                warn!("failed to send {kind} for {id} to leader: {err}");
            }
        }
        None => debug!("no leader to send {kind} for {id}"),
    }
}
