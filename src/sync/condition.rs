//! Mesa-style condition variables.

use std::collections::VecDeque;

use crate::sync::lock::LockId;
use crate::sync::semaphore::SemId;
use crate::{alloc_slot, Kernel};

/// Handle to a kernel condition variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CondId(pub(crate) usize);

/// A condition variable associated with one lock (borrowed, not owned).
///
/// Each waiter parks on a private one-shot semaphore created at `wait` entry
/// and destroyed when the waiter returns from P. Waking through private
/// semaphores cannot wake the wrong thread, and no wait-generation counter
/// is needed.
pub(crate) struct Condition {
    pub(crate) name: String,
    pub(crate) lock: LockId,
    pub(crate) waiters: VecDeque<SemId>,
}

impl Kernel {
    /// Create a condition variable tied to `lock`.
    pub fn condition_create(&self, name: &str, lock: LockId) -> CondId {
        let cond = Condition {
            name: name.to_string(),
            lock,
            waiters: VecDeque::new(),
        };
        CondId(alloc_slot(&mut self.core().conditions, cond))
    }

    /// Destroy a condition variable nobody is waiting on.
    pub fn condition_destroy(&self, id: CondId) {
        let mut core = self.core();
        let cond = core.conditions[id.0]
            .take()
            .unwrap_or_else(|| panic!("condition {} already destroyed", id.0));
        assert!(
            cond.waiters.is_empty(),
            "destroying condition \"{}\" with waiters",
            cond.name
        );
    }

    /// Atomically release the associated lock and wait to be signalled, then
    /// re-acquire the lock.
    ///
    /// Mesa semantics: being signalled makes the waiter runnable, nothing
    /// more. Between the signal and the waiter regaining the lock other
    /// threads may acquire it and invalidate the predicate, so the caller
    /// must re-check it after `wait` returns.
    pub fn condition_wait(&self, id: CondId) {
        let (lock, name) = {
            let core = self.core();
            let cond = core.condition(id);
            (cond.lock, cond.name.clone())
        };
        assert!(
            self.lock_held_by_current(lock),
            "wait on condition \"{name}\" without holding its lock"
        );

        let private = self.semaphore_create(&format!("{name} waiter"), 0);
        self.core().condition_mut(id).waiters.push_back(private);

        self.lock_release(lock);
        self.semaphore_p(private);
        self.semaphore_destroy(private);
        self.lock_acquire(lock);
    }

    /// Wake the longest-waiting thread, if any. The signaller keeps the
    /// lock; the woken thread contends for it normally.
    pub fn condition_signal(&self, id: CondId) {
        let lock = self.core().condition(id).lock;
        assert!(
            self.lock_held_by_current(lock),
            "signal on condition {} without holding its lock",
            id.0
        );
        let head = self.core().condition_mut(id).waiters.pop_front();
        if let Some(private) = head {
            self.semaphore_v(private);
        }
    }

    /// Wake every waiter.
    pub fn condition_broadcast(&self, id: CondId) {
        let lock = self.core().condition(id).lock;
        assert!(
            self.lock_held_by_current(lock),
            "broadcast on condition {} without holding its lock",
            id.0
        );
        loop {
            let head = self.core().condition_mut(id).waiters.pop_front();
            match head {
                Some(private) => self.semaphore_v(private),
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::Kernel;

    #[test]
    #[should_panic(expected = "without holding its lock")]
    fn wait_without_lock_is_fatal() {
        let kernel = Kernel::new();
        let lock = kernel.lock_create("l");
        let cond = kernel.condition_create("c", lock);
        kernel.condition_wait(cond);
    }

    #[test]
    fn signal_with_no_waiters_is_lost() {
        let kernel = Kernel::new();
        let lock = kernel.lock_create("l");
        let cond = kernel.condition_create("c", lock);
        kernel.lock_acquire(lock);
        kernel.condition_signal(cond);
        kernel.lock_release(lock);
        // Nothing observable; the signal must simply not queue anything.
        kernel.lock_acquire(lock);
        kernel.lock_release(lock);
    }

    #[test]
    fn signal_wakes_one_waiter_in_fifo_order() {
        let kernel = Kernel::new();
        let lock = kernel.lock_create("l");
        let cond = kernel.condition_create("c", lock);
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut children = Vec::new();
        for i in 0..2 {
            children.push(kernel.fork_joinable(&format!("waiter {i}"), 1, {
                let kernel = kernel.clone();
                let order = order.clone();
                move || {
                    kernel.lock_acquire(lock);
                    kernel.condition_wait(cond);
                    order.lock().unwrap().push(i);
                    kernel.lock_release(lock);
                }
            }));
        }
        // Run both children up to their waits.
        kernel.yield_now();

        for _ in 0..2 {
            kernel.lock_acquire(lock);
            kernel.condition_signal(cond);
            kernel.lock_release(lock);
            kernel.yield_now();
        }
        for child in children {
            assert_eq!(kernel.join(child), 0);
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1]);
    }
}
