//! `DropPolicyQueue<T>`: the bounded, never-blocks-on-push primitive the
//! rest of the pipeline's liveness depends on.
//!
//! Grounded in the same "producer never blocks, drop to stay live" shape as
//! a bounded video frame queue, extended with a blocking, timeout-bounded
//! batch drain (`pop_many`) and a choice of which end to drop from.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// What to discard when a push would exceed capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DropPolicy {
    /// Refuse the incoming item, keep what's already queued. Default.
    #[default]
    DropNewest,
    /// Discard the oldest queued item to make room for the incoming one.
    DropOldest,
}

/// A bounded multi-producer / multi-consumer FIFO that never blocks on push.
///
/// All operations are total (I5): a full queue does not error, it drops and
/// counts. `pop_many` is the only operation that may block, and only up to
/// an explicit timeout.
pub struct DropPolicyQueue<T> {
    capacity: usize,
    policy: DropPolicy,
    inner: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    dropped: AtomicU64,
}

impl<T> DropPolicyQueue<T> {
    /// Create a queue with the default (drop-newest) policy.
    pub fn new(capacity: usize) -> Self {
        Self::with_policy(capacity, DropPolicy::default())
    }

    /// Create a queue with an explicit drop policy.
    pub fn with_policy(capacity: usize, policy: DropPolicy) -> Self {
        assert!(capacity > 0, "DropPolicyQueue capacity must be positive");
        DropPolicyQueue {
            capacity,
            policy,
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Push a single item. Never blocks. Returns `true` if the item was
    /// enqueued, `false` if it (or the item it displaced) was dropped.
    pub fn push(&self, item: T) -> bool {
        let mut q = self.inner.lock().unwrap();
        let enqueued = self.push_locked(&mut q, item);
        if enqueued {
            drop(q);
            self.not_empty.notify_one();
        }
        enqueued
    }

    /// Best-effort atomic batch push. If `items.len()` exceeds the
    /// remaining capacity, the overflow is counted as dropped and none of
    /// the overflowing items are enqueued — the batch is all-or-overflow-dropped,
    /// never partially admitted from the middle.
    pub fn push_many(&self, items: Vec<T>) -> usize {
        if items.is_empty() {
            return 0;
        }
        let mut q = self.inner.lock().unwrap();
        let remaining = self.capacity.saturating_sub(q.len());
        let admitted = if items.len() <= remaining {
            items.len()
        } else if self.policy == DropPolicy::DropOldest {
            // Make room by evicting the oldest entries, then admit everything.
            let need_to_evict = items.len().saturating_sub(remaining);
            let evict = need_to_evict.min(q.len());
            for _ in 0..evict {
                q.pop_front();
            }
            self.dropped.fetch_add(evict as u64, Ordering::Relaxed);
            items.len().min(self.capacity)
        } else {
            remaining
        };
        let dropped_this_push = items.len() - admitted;
        for item in items.into_iter().take(admitted) {
            q.push_back(item);
        }
        if dropped_this_push > 0 {
            self.dropped.fetch_add(dropped_this_push as u64, Ordering::Relaxed);
        }
        drop(q);
        if admitted > 0 {
            self.not_empty.notify_all();
        }
        admitted
    }

    fn push_locked(&self, q: &mut VecDeque<T>, item: T) -> bool {
        if q.len() < self.capacity {
            q.push_back(item);
            return true;
        }
        match self.policy {
            DropPolicy::DropNewest => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            DropPolicy::DropOldest => {
                q.pop_front();
                q.push_back(item);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    /// Drain up to `max` items, blocking up to `timeout` for at least one
    /// item to arrive. Returns an empty `Vec` on timeout.
    pub fn pop_many(&self, max: usize, timeout: Duration) -> Vec<T> {
        let deadline = Instant::now() + timeout;
        let mut q = self.inner.lock().unwrap();
        while q.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return Vec::new();
            }
            let (guard, result) = self.not_empty.wait_timeout(q, deadline - now).unwrap();
            q = guard;
            if result.timed_out() && q.is_empty() {
                return Vec::new();
            }
        }
        let n = max.min(q.len());
        q.drain(..n).collect()
    }

    /// Current number of queued items.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// True if the queue currently holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of items dropped since construction.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
