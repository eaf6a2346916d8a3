//! A rendezvous primitive over a strictly monotonic sequence of integer
//! tickets (commit indexes). Parallel replication workers execute
//! transactions concurrently but must commit them in the exact order the
//! leader chose: each worker waits for its predecessor's ticket here, and
//! signals its own when done.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};

/// The outcome of waiting for a ticket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    /// The ticket completed. Monotonic: all tickets at or below the notified
    /// ceiling are completed forever (until an explicit reset).
    Completed,
    /// The ticket was cancelled, individually or by a cancellation floor.
    /// The waiter must abandon its transaction.
    Cancelled,
}

#[derive(Default)]
struct Inner {
    /// All tickets <= completed are done.
    completed: u64,
    /// Individually cancelled tickets (rolled-back transactions).
    cancelled: HashSet<u64>,
    /// If set, all tickets > floor are cancelled (the node left FOLLOWING
    /// and pending transactions above the last committed one are abandoned).
    cancel_floor: Option<u64>,
}

/// A wait/signal primitive ordered by a monotonic sequence number. A plain
/// mutex and condvar are sufficient: waiters compare their ticket against
/// the completed ceiling and the cancellation marks, and sleep otherwise.
#[derive(Default)]
pub struct SequentialNotifier {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl SequentialNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the ticket is completed or cancelled. Waiting for ticket
    /// 0 or any ticket at or below the completed ceiling returns immediately.
    pub fn wait_for(&self, ticket: u64) -> WaitResult {
        let mut inner = self.inner.lock().expect("lock poisoned");
        loop {
            if ticket <= inner.completed {
                return WaitResult::Completed;
            }
            if inner.cancelled.contains(&ticket) {
                return WaitResult::Cancelled;
            }
            if inner.cancel_floor.is_some_and(|floor| ticket > floor) {
                return WaitResult::Cancelled;
            }
            inner = self.cond.wait(inner).expect("lock poisoned");
        }
    }

    /// Marks all tickets at or below the given one as completed, waking any
    /// waiters on them. The ceiling never regresses.
    pub fn notify_through(&self, ticket: u64) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if ticket <= inner.completed {
            return;
        }
        inner.completed = ticket;
        inner.cancelled.retain(|&t| t > ticket);
        self.cond.notify_all();
    }

    /// Cancels a single pending ticket (an individual rollback).
    pub fn cancel(&self, ticket: u64) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if ticket > inner.completed {
            inner.cancelled.insert(ticket);
            self.cond.notify_all();
        }
    }

    /// Cancels all tickets above the given floor. Used when abandoning every
    /// pending transaction past the last committed one.
    pub fn cancel_after(&self, floor: u64) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.cancel_floor = Some(match inner.cancel_floor {
            Some(existing) => existing.min(floor),
            None => floor,
        });
        self.cond.notify_all();
    }

    /// Clears a previous cancellation of the given ticket. A rolled-back
    /// commit index is reused by the leader's next transaction, which must
    /// be able to wait on it again.
    pub fn reinstate(&self, ticket: u64) {
        self.inner.lock().expect("lock poisoned").cancelled.remove(&ticket);
    }

    /// Re-arms the notifier at a new base: tickets <= base are completed and
    /// all cancellation marks are cleared. Called when replication starts
    /// over from a fresh subscription.
    pub fn reset(&self, base: u64) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.completed = base;
        inner.cancelled.clear();
        inner.cancel_floor = None;
        self.cond.notify_all();
    }

    /// The current completed ceiling.
    pub fn completed(&self) -> u64 {
        self.inner.lock().expect("lock poisoned").completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn notify_then_wait_completes_immediately() {
        let notifier = SequentialNotifier::new();
        notifier.notify_through(3);
        assert_eq!(notifier.wait_for(1), WaitResult::Completed);
        assert_eq!(notifier.wait_for(3), WaitResult::Completed);
        assert_eq!(notifier.completed(), 3);
    }

    #[test]
    fn wait_blocks_until_notified() {
        let notifier = Arc::new(SequentialNotifier::new());
        let waiter = {
            let notifier = notifier.clone();
            std::thread::spawn(move || notifier.wait_for(2))
        };
        // Give the waiter time to block, then release it.
        std::thread::sleep(Duration::from_millis(20));
        notifier.notify_through(1);
        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        notifier.notify_through(2);
        assert_eq!(waiter.join().unwrap(), WaitResult::Completed);
    }

    #[test]
    fn cancel_releases_waiter() {
        let notifier = Arc::new(SequentialNotifier::new());
        let waiter = {
            let notifier = notifier.clone();
            std::thread::spawn(move || notifier.wait_for(5))
        };
        std::thread::sleep(Duration::from_millis(20));
        notifier.cancel(5);
        assert_eq!(waiter.join().unwrap(), WaitResult::Cancelled);
        // Unrelated tickets are unaffected.
        notifier.notify_through(4);
        assert_eq!(notifier.wait_for(4), WaitResult::Completed);
    }

    #[test]
    fn cancel_after_releases_all_pending() {
        let notifier = Arc::new(SequentialNotifier::new());
        notifier.notify_through(2);
        let waiters: Vec<_> = [3u64, 4, 7]
            .into_iter()
            .map(|t| {
                let notifier = notifier.clone();
                std::thread::spawn(move || notifier.wait_for(t))
            })
            .collect();
        std::thread::sleep(Duration::from_millis(20));
        notifier.cancel_after(2);
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), WaitResult::Cancelled);
        }
        // Completed tickets stay completed.
        assert_eq!(notifier.wait_for(2), WaitResult::Completed);
    }

    #[test]
    fn reinstate_clears_cancellation() {
        let notifier = SequentialNotifier::new();
        notifier.cancel(3);
        notifier.reinstate(3);
        notifier.notify_through(3);
        assert_eq!(notifier.wait_for(3), WaitResult::Completed);
    }

    #[test]
    fn reset_rearms() {
        let notifier = SequentialNotifier::new();
        notifier.cancel_after(0);
        assert_eq!(notifier.wait_for(1), WaitResult::Cancelled);
        notifier.reset(10);
        assert_eq!(notifier.wait_for(10), WaitResult::Completed);
        assert_eq!(notifier.completed(), 10);
    }

    #[test]
    fn notify_supersedes_cancel() {
        let notifier = SequentialNotifier::new();
        notifier.cancel(2);
        notifier.notify_through(2);
        assert_eq!(notifier.wait_for(2), WaitResult::Completed);
    }
}
