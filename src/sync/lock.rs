//! Mutex locks with priority donation.

use log::debug;

use crate::sched::thread::ThreadId;
use crate::sync::semaphore::SemId;
use crate::{alloc_slot, Kernel};

/// Handle to a kernel lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockId(pub(crate) usize);

/// A mutex built on a binary semaphore, tracking its owner.
///
/// The owner field is a non-owning reference to a thread whose lifetime
/// strictly exceeds the hold. It is non-`None` exactly while some thread
/// holds the lock, and it is cleared *before* the releasing V so that a
/// context switch between the V and the store can never attribute the lock
/// to the wrong thread.
pub(crate) struct Lock {
    pub(crate) name: String,
    pub(crate) semaphore: SemId,
    pub(crate) owner: Option<ThreadId>,
}

impl Kernel {
    /// Create a free lock.
    pub fn lock_create(&self, name: &str) -> LockId {
        let semaphore = self.semaphore_create(&format!("{name} semaphore"), 1);
        let lock = Lock {
            name: name.to_string(),
            semaphore,
            owner: None,
        };
        LockId(alloc_slot(&mut self.core().locks, lock))
    }

    /// Destroy a lock nobody holds.
    pub fn lock_destroy(&self, id: LockId) {
        let lock = {
            let mut core = self.core();
            core.locks[id.0]
                .take()
                .unwrap_or_else(|| panic!("lock {} already destroyed", id.0))
        };
        assert!(
            lock.owner.is_none(),
            "destroying lock \"{}\" while it is held",
            lock.name
        );
        self.semaphore_destroy(lock.semaphore);
    }

    /// Acquire the lock, blocking while another thread holds it.
    ///
    /// Re-acquiring a lock the caller already holds is a caller bug and
    /// fatal, not a recursion feature.
    ///
    /// When the current holder has lower priority than the caller, the
    /// holder's priority is raised to the caller's before blocking — one
    /// level of priority donation, so that the holder cannot be starved by
    /// middle-priority threads while the caller waits. Donation is
    /// transitive only insofar as the donated thread will itself donate when
    /// it blocks on a lock of its own.
    pub fn lock_acquire(&self, id: LockId) {
        assert!(
            !self.lock_held_by_current(id),
            "nested acquire of lock {}",
            id.0
        );

        let semaphore = {
            let mut core = self.core();
            let me = core.current;
            if let Some(owner) = core.lock(id).owner {
                if core.thread(owner).priority < core.thread(me).priority {
                    let donated = core.thread(me).priority;
                    core.thread_mut(owner).priority = donated;
                    core.reassign(owner);
                    debug!(
                        "\"{}\" now has priority {donated} (donated by \"{}\")",
                        core.thread(owner).name,
                        core.thread(me).name
                    );
                }
            }
            core.lock(id).semaphore
        };

        self.semaphore_p(semaphore);

        let mut core = self.core();
        let me = core.current;
        core.lock_mut(id).owner = Some(me);
        debug!("\"{}\" acquired \"{}\"", core.thread(me).name, core.lock(id).name);
    }

    /// Release the lock. Only the owner may release; anything else is fatal.
    ///
    /// A donated priority is restored to the owner's initial priority
    /// unconditionally. If a second higher-priority waiter donated while the
    /// first donation was in force, that donation is lost here — an accepted
    /// simplification over the full priority-inheritance protocol.
    pub fn lock_release(&self, id: LockId) {
        assert!(
            self.lock_held_by_current(id),
            "release of lock {} by a non-owner",
            id.0
        );

        let semaphore = {
            let mut core = self.core();
            let me = core.current;
            debug!("\"{}\" released \"{}\"", core.thread(me).name, core.lock(id).name);
            let initial = core.thread(me).initial_priority;
            if core.thread(me).priority != initial {
                core.thread_mut(me).priority = initial;
                debug!(
                    "\"{}\" returned to its original priority {initial}",
                    core.thread(me).name
                );
            }
            let lock = core.lock_mut(id);
            lock.owner = None;
            lock.semaphore
        };

        self.semaphore_v(semaphore);
    }

    /// Whether the calling thread holds the lock.
    pub fn lock_held_by_current(&self, id: LockId) -> bool {
        let core = self.core();
        core.lock(id).owner == Some(core.current)
    }
}

#[cfg(test)]
mod tests {
    use crate::Kernel;

    #[test]
    fn acquire_release_tracks_ownership() {
        let kernel = Kernel::new();
        let lock = kernel.lock_create("l");
        assert!(!kernel.lock_held_by_current(lock));
        kernel.lock_acquire(lock);
        assert!(kernel.lock_held_by_current(lock));
        kernel.lock_release(lock);
        assert!(!kernel.lock_held_by_current(lock));
    }

    #[test]
    #[should_panic(expected = "nested acquire")]
    fn nested_acquire_is_fatal() {
        let kernel = Kernel::new();
        let lock = kernel.lock_create("l");
        kernel.lock_acquire(lock);
        kernel.lock_acquire(lock);
    }

    #[test]
    #[should_panic(expected = "non-owner")]
    fn release_by_non_owner_is_fatal() {
        let kernel = Kernel::new();
        let lock = kernel.lock_create("l");
        kernel.lock_release(lock);
    }

    #[test]
    fn contended_lock_serializes() {
        let kernel = Kernel::new();
        let lock = kernel.lock_create("l");
        kernel.lock_acquire(lock);
        let child = kernel.fork_joinable("contender", 1, {
            let kernel = kernel.clone();
            move || {
                kernel.lock_acquire(lock);
                kernel.lock_release(lock);
            }
        });
        // Child runs, blocks on the lock, and control returns here.
        kernel.yield_now();
        assert!(kernel.lock_held_by_current(lock));
        kernel.lock_release(lock);
        assert_eq!(kernel.join(child), 0);
    }
}
