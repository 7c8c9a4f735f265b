//! Counting semaphores.

use std::collections::VecDeque;

use log::trace;

use crate::machine::interrupt::IntGuard;
use crate::sched::thread::ThreadId;
use crate::{alloc_slot, Kernel};

/// Handle to a kernel semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemId(pub(crate) usize);

/// A counting semaphore: a non-negative value and a FIFO queue of waiters.
///
/// Waiters are served strictly in arrival order regardless of their thread
/// priorities; priority matters only at dispatch time. At quiescence, a
/// positive value implies an empty waiter queue.
pub(crate) struct Semaphore {
    pub(crate) name: String,
    pub(crate) value: usize,
    pub(crate) waiters: VecDeque<ThreadId>,
}

impl Kernel {
    /// Create a semaphore with the given initial value.
    pub fn semaphore_create(&self, name: &str, initial: usize) -> SemId {
        let sem = Semaphore {
            name: name.to_string(),
            value: initial,
            waiters: VecDeque::new(),
        };
        SemId(alloc_slot(&mut self.core().semaphores, sem))
    }

    /// Destroy a semaphore nobody is waiting on.
    pub fn semaphore_destroy(&self, id: SemId) {
        let mut core = self.core();
        let sem = core.semaphores[id.0]
            .take()
            .unwrap_or_else(|| panic!("semaphore {} already destroyed", id.0));
        assert!(
            sem.waiters.is_empty(),
            "destroying semaphore \"{}\" with waiters",
            sem.name
        );
    }

    /// P: wait until the value is positive, then take one unit.
    ///
    /// While the value is zero the caller queues itself and sleeps; a V from
    /// another thread makes it ready again, and the loop re-checks before
    /// decrementing.
    pub fn semaphore_p(&self, id: SemId) {
        let _masked = IntGuard::new(self);
        let mut core = self.core();
        while core.semaphore(id).value == 0 {
            let me = core.current;
            trace!(
                "sending \"{}\" to sleep on \"{}\"",
                core.thread(me).name,
                core.semaphore(id).name
            );
            core.semaphore_mut(id).waiters.push_back(me);
            self.sleep(core);
            core = self.core();
        }
        core.semaphore_mut(id).value -= 1;
    }

    /// V: release one unit, making the head waiter ready if there is one.
    ///
    /// The woken thread decrements on its side of P; this side only
    /// increments. The waiter is the FIFO head, not the highest-priority
    /// waiter.
    pub fn semaphore_v(&self, id: SemId) {
        let _masked = IntGuard::new(self);
        let mut core = self.core();
        if let Some(waiter) = core.semaphore_mut(id).waiters.pop_front() {
            core.ready_to_run(waiter);
        }
        core.semaphore_mut(id).value += 1;
    }

    /// Current value, for diagnostics and tests.
    pub fn semaphore_value(&self, id: SemId) -> usize {
        self.core().semaphore(id).value
    }
}

#[cfg(test)]
mod tests {
    use crate::Kernel;

    #[test]
    fn p_consumes_available_value_without_blocking() {
        let kernel = Kernel::new();
        let sem = kernel.semaphore_create("counter", 2);
        kernel.semaphore_p(sem);
        kernel.semaphore_p(sem);
        assert_eq!(kernel.semaphore_value(sem), 0);
    }

    #[test]
    fn v_then_p_round_trips_the_value() {
        let kernel = Kernel::new();
        let sem = kernel.semaphore_create("counter", 0);
        kernel.semaphore_v(sem);
        assert_eq!(kernel.semaphore_value(sem), 1);
        kernel.semaphore_p(sem);
        assert_eq!(kernel.semaphore_value(sem), 0);
    }

    #[test]
    fn blocked_p_is_released_by_v() {
        let kernel = Kernel::new();
        let sem = kernel.semaphore_create("gate", 0);
        let child = kernel.fork_joinable("waiter", 1, {
            let kernel = kernel.clone();
            move || kernel.semaphore_p(sem)
        });
        // The child has higher priority: this yield runs it up to the P,
        // where it blocks and control comes back here.
        kernel.yield_now();
        kernel.semaphore_v(sem);
        assert_eq!(kernel.join(child), 0);
        assert_eq!(kernel.semaphore_value(sem), 0);
    }

    #[test]
    #[should_panic(expected = "with waiters")]
    fn destroy_with_waiters_is_fatal() {
        let kernel = Kernel::new();
        let sem = kernel.semaphore_create("gate", 0);
        kernel.fork("waiter", 1, {
            let kernel = kernel.clone();
            move || kernel.semaphore_p(sem)
        });
        kernel.yield_now();
        kernel.semaphore_destroy(sem);
    }
}
