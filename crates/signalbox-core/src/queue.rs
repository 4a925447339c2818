//! Cross-thread mailbox of pending invocations.
//!
//! [`ThreadSafeQueue`] is the only structure in signalbox that is mutated
//! concurrently from several threads. Producers call [`push`](ThreadSafeQueue::push)
//! from anywhere; the owning event loop takes everything at once with
//! [`drain_all`](ThreadSafeQueue::drain_all).

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::invocation::InvocationRecord;
use crate::object::NodeId;

struct QueueState {
    records: VecDeque<InvocationRecord>,
    /// Set by `wake()` so a waiter returns even with no records.
    woken: bool,
}

/// FIFO queue of [`InvocationRecord`]s with a wakeup condvar.
pub struct ThreadSafeQueue {
    state: Mutex<QueueState>,
    wakeup: Condvar,
}

impl ThreadSafeQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                records: VecDeque::new(),
                woken: false,
            }),
            wakeup: Condvar::new(),
        }
    }

    /// Append a record to the tail and wake the consumer.
    pub fn push(&self, record: InvocationRecord) {
        tracing::trace!(
            target: "signalbox_core::queue",
            sequence = record.sequence(),
            origin = %record.origin(),
            "record queued"
        );
        self.state.lock().records.push_back(record);
        self.wakeup.notify_all();
    }

    /// Remove and return every record queued so far, oldest first.
    ///
    /// Records pushed while the caller processes the batch stay queued for
    /// the next drain.
    pub fn drain_all(&self) -> Vec<InvocationRecord> {
        let mut state = self.state.lock();
        Vec::from(std::mem::take(&mut state.records))
    }

    /// Drop every queued record matching `predicate`.
    ///
    /// Returns the number of records removed.
    pub fn discard_where<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&InvocationRecord) -> bool,
    {
        let mut state = self.state.lock();
        let before = state.records.len();
        state.records.retain(|record| !predicate(record));
        before - state.records.len()
    }

    /// Drop every queued record owned by one of `nodes`.
    pub fn purge_owned_by(&self, nodes: &HashSet<NodeId>) -> usize {
        if nodes.is_empty() {
            return 0;
        }
        self.discard_where(|record| record.owner().is_some_and(|owner| nodes.contains(&owner)))
    }

    /// Number of records waiting.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Whether no records are waiting.
    pub fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }

    /// Wake a consumer blocked in [`wait_for_work`](Self::wait_for_work).
    pub fn wake(&self) {
        self.state.lock().woken = true;
        self.wakeup.notify_all();
    }

    /// Block until a record is pushed, `wake()` is called, or `timeout` elapses.
    ///
    /// Returns `true` if records are waiting when the call returns.
    pub fn wait_for_work(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.records.is_empty() && !state.woken && !timeout.is_zero() {
            let _ = self.wakeup.wait_for(&mut state, timeout);
        }
        state.woken = false;
        !state.records.is_empty()
    }
}

impl Default for ThreadSafeQueue {
    fn default() -> Self {
        Self::new()
    }
}

static_assertions::assert_impl_all!(ThreadSafeQueue: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::InvocationOrigin;
    use std::sync::Arc;
    use std::time::Instant;

    fn record(tag: u32, log: &Arc<Mutex<Vec<u32>>>) -> InvocationRecord {
        let log = log.clone();
        InvocationRecord::new(InvocationOrigin::Posted, std::thread::current().id(), move || {
            log.lock().push(tag);
        })
    }

    #[test]
    fn test_drain_preserves_fifo_order() {
        let queue = ThreadSafeQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..5 {
            queue.push(record(tag, &log));
        }
        assert_eq!(queue.len(), 5);

        for record in queue.drain_all() {
            record.execute().unwrap();
        }

        assert!(queue.is_empty());
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_second_drain_is_empty() {
        let queue = ThreadSafeQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        queue.push(record(1, &log));

        assert_eq!(queue.drain_all().len(), 1);
        assert!(queue.drain_all().is_empty());
    }

    #[test]
    fn test_concurrent_pushes_are_all_delivered_once() {
        let queue = Arc::new(ThreadSafeQueue::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let queue = queue.clone();
                let log = log.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        queue.push(record(t * 100 + i, &log));
                    }
                })
            })
            .collect();

        let mut delivered = 0;
        while delivered < 100 {
            for record in queue.drain_all() {
                record.execute().unwrap();
                delivered += 1;
            }
            queue.wait_for_work(Duration::from_millis(5));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut values = log.lock().clone();
        values.sort_unstable();
        values.dedup();
        assert_eq!(values.len(), 100);
    }

    #[test]
    fn test_discard_where() {
        let queue = ThreadSafeQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..4 {
            queue.push(record(tag, &log));
        }

        let first = queue.drain_all();
        let keep_sequence = first[1].sequence();
        for record in first {
            queue.push(record);
        }

        let removed = queue.discard_where(|r| r.sequence() != keep_sequence);
        assert_eq!(removed, 3);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_purge_owned_by() {
        let mut tree = crate::object::ObjectTree::new();
        let doomed = tree.create_node("doomed");
        let kept = tree.create_node("kept");

        let queue = ThreadSafeQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        queue.push(record(1, &log).with_owner(Some(doomed)));
        queue.push(record(2, &log).with_owner(Some(kept)));
        queue.push(record(3, &log));

        let nodes: HashSet<_> = [doomed].into_iter().collect();
        assert_eq!(queue.purge_owned_by(&nodes), 1);
        assert_eq!(queue.purge_owned_by(&HashSet::new()), 0);

        for record in queue.drain_all() {
            record.execute().unwrap();
        }
        assert_eq!(*log.lock(), vec![2, 3]);
    }

    #[test]
    fn test_wake_interrupts_wait() {
        let queue = Arc::new(ThreadSafeQueue::new());
        let waker = queue.clone();

        let start = Instant::now();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake();
        });

        let has_work = queue.wait_for_work(Duration::from_secs(5));
        handle.join().unwrap();

        assert!(!has_work);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
