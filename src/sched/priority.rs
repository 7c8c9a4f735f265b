//! Priority levels and the multilevel ready queue.
//!
//! The ready queue is an array of FIFO buckets, one per priority. The
//! scheduler always serves the highest-indexed non-empty bucket, FIFO within
//! it; there is no aging, and a priority change moves a thread between
//! buckets in place. Priorities are few and small, so direct indexed buckets
//! beat any heap.

use std::collections::VecDeque;

use crate::config::MAX_PRIORITY;
use crate::sched::thread::ThreadId;

/// Scheduling priority. Valid values are `0..MAX_PRIORITY`; higher runs
/// first.
pub type Priority = usize;

/// Per-priority FIFO buckets of ready threads.
///
/// Invariants: a thread appears in at most one bucket, and the bucket index
/// equals the thread's current priority at the time it was inserted.
pub(crate) struct ReadyQueue {
    buckets: [VecDeque<ThreadId>; MAX_PRIORITY],
}

impl ReadyQueue {
    pub(crate) fn new() -> Self {
        ReadyQueue {
            buckets: std::array::from_fn(|_| VecDeque::new()),
        }
    }

    /// Place `tid` at the tail of its priority's bucket. Callers pass the
    /// thread's current priority and must hold interrupts masked.
    pub(crate) fn append(&mut self, tid: ThreadId, priority: Priority) {
        assert!(priority < MAX_PRIORITY, "priority {priority} out of range");
        self.buckets[priority].push_back(tid);
    }

    /// Head of the highest-indexed non-empty bucket, or `None`.
    pub(crate) fn remove_highest(&mut self) -> Option<ThreadId> {
        self.buckets
            .iter_mut()
            .rev()
            .find_map(|bucket| bucket.pop_front())
    }

    /// Move `tid` to the bucket for `priority`, preserving the relative
    /// order of every other queued thread: each bucket is rotated once, the
    /// target dropped on the way past.
    ///
    /// A thread that is running or blocked is in no bucket; then this is a
    /// no-op and the new priority takes effect at its next `append`.
    pub(crate) fn reassign(&mut self, tid: ThreadId, priority: Priority) {
        assert!(priority < MAX_PRIORITY, "priority {priority} out of range");
        let mut found = false;
        for bucket in &mut self.buckets {
            for _ in 0..bucket.len() {
                let t = bucket.pop_front().expect("bucket shrank mid-rotation");
                if t == tid {
                    found = true;
                } else {
                    bucket.push_back(t);
                }
            }
        }
        if found {
            self.buckets[priority].push_back(tid);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.is_empty())
    }

    #[cfg(test)]
    fn contains(&self, tid: ThreadId) -> bool {
        self.buckets.iter().any(|b| b.contains(&tid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(n: usize) -> ThreadId {
        ThreadId(n)
    }

    #[test]
    fn fifo_within_a_bucket() {
        let mut q = ReadyQueue::new();
        q.append(t(1), 2);
        q.append(t(2), 2);
        q.append(t(3), 2);
        assert_eq!(q.remove_highest(), Some(t(1)));
        assert_eq!(q.remove_highest(), Some(t(2)));
        assert_eq!(q.remove_highest(), Some(t(3)));
        assert_eq!(q.remove_highest(), None);
    }

    #[test]
    fn highest_bucket_first() {
        let mut q = ReadyQueue::new();
        q.append(t(1), 0);
        q.append(t(2), 5);
        q.append(t(3), 3);
        assert_eq!(q.remove_highest(), Some(t(2)));
        assert_eq!(q.remove_highest(), Some(t(3)));
        assert_eq!(q.remove_highest(), Some(t(1)));
    }

    #[test]
    fn reassign_moves_between_buckets() {
        let mut q = ReadyQueue::new();
        q.append(t(1), 1);
        q.append(t(2), 1);
        q.reassign(t(1), 4);
        assert_eq!(q.remove_highest(), Some(t(1)));
        assert_eq!(q.remove_highest(), Some(t(2)));
    }

    #[test]
    fn reassign_preserves_order_of_others() {
        let mut q = ReadyQueue::new();
        q.append(t(1), 2);
        q.append(t(2), 2);
        q.append(t(3), 2);
        q.reassign(t(2), 6);
        assert_eq!(q.remove_highest(), Some(t(2)));
        assert_eq!(q.remove_highest(), Some(t(1)));
        assert_eq!(q.remove_highest(), Some(t(3)));
    }

    #[test]
    fn reassign_of_unqueued_thread_is_a_noop() {
        let mut q = ReadyQueue::new();
        q.append(t(1), 1);
        q.reassign(t(9), 5);
        assert!(!q.contains(t(9)));
        assert_eq!(q.remove_highest(), Some(t(1)));
        assert!(q.is_empty());
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn append_rejects_invalid_priority() {
        let mut q = ReadyQueue::new();
        q.append(t(1), MAX_PRIORITY);
    }
}
