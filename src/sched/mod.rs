//! Thread scheduler.
//!
//! Chooses the next thread to run and dispatches to it. Every routine here
//! assumes interrupts are already masked: masked interrupts are mutual
//! exclusion on the simulated uniprocessor. Locks cannot be used instead —
//! waiting on a busy lock would call back into the scheduler and loop.
//!
//! Dispatch hands the CPU over through the per-thread batons: the incoming
//! thread's baton is woken and the outgoing thread parks on its own, so at
//! most one simulated thread ever executes. A terminating thread hands off
//! without parking; its TCB sits in the carcass slot until a later dispatch
//! reclaims it, because at the moment of the hand-off the terminating thread
//! is still executing on its own stack.

pub mod priority;
pub mod thread;

use std::sync::MutexGuard;

use log::{debug, trace};

use crate::machine::interrupt::IntStatus;
use crate::machine::NUM_TOTAL_REGS;
use crate::sched::priority::ReadyQueue;
use crate::sched::thread::{ThreadId, ThreadState};
use crate::{Core, Kernel};

/// Ready queue plus the carcass slot.
pub(crate) struct Scheduler {
    pub(crate) ready: ReadyQueue,
    /// A finishing thread writes itself here; the next thread to come back
    /// from a dispatch destroys it. A second finish before that reclaim
    /// overwrites the slot and leaks the first carcass, as in the original
    /// design.
    pub(crate) to_be_destroyed: Option<ThreadId>,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Scheduler {
            ready: ReadyQueue::new(),
            to_be_destroyed: None,
        }
    }
}

impl Core {
    /// Mark `tid` ready and queue it at the tail of its priority's bucket.
    /// Requires interrupts masked.
    pub(crate) fn ready_to_run(&mut self, tid: ThreadId) {
        assert_eq!(
            self.int_level,
            IntStatus::Off,
            "ready_to_run with interrupts enabled"
        );
        trace!("putting {} on the ready list", self.thread(tid).name);
        self.thread_mut(tid).status = ThreadState::Ready;
        let priority = self.thread(tid).priority;
        self.scheduler.ready.append(tid, priority);
    }

    /// Next thread to schedule, removed from the ready queue, or `None` if
    /// nothing is runnable.
    pub(crate) fn find_next_to_run(&mut self) -> Option<ThreadId> {
        self.scheduler.ready.remove_highest()
    }

    /// Requeue `tid` under its current priority after a donation changed it.
    pub(crate) fn reassign(&mut self, tid: ThreadId) {
        let priority = self.thread(tid).priority;
        self.scheduler.ready.reassign(tid, priority);
    }

    /// Copy the machine register file into the thread's private bank and let
    /// its address space stash whatever it needs.
    pub(crate) fn save_user_state(&mut self, tid: ThreadId) {
        let Core {
            threads, machine, ..
        } = self;
        let tcb = threads[tid.0]
            .as_mut()
            .unwrap_or_else(|| panic!("thread {tid} has been reclaimed"));
        for reg in 0..NUM_TOTAL_REGS {
            tcb.user_registers[reg] = machine.read_register(reg);
        }
        if let Some(space) = tcb.space.as_ref() {
            space.save_state(machine);
        }
    }

    /// Restore the thread's private register bank into the machine and
    /// reinstall its address space.
    pub(crate) fn restore_user_state(&mut self, tid: ThreadId) {
        let Core {
            threads, machine, ..
        } = self;
        let tcb = threads[tid.0]
            .as_mut()
            .unwrap_or_else(|| panic!("thread {tid} has been reclaimed"));
        for reg in 0..NUM_TOTAL_REGS {
            machine.write_register(reg, tcb.user_registers[reg]);
        }
        if let Some(space) = tcb.space.as_ref() {
            space.restore_state(machine);
        }
    }

    /// Destroy a reclaimed carcass: drop the TCB and return its physical
    /// frames. The host thread behind it has already handed the CPU away and
    /// is exiting on its own.
    pub(crate) fn reclaim(&mut self, tid: ThreadId) {
        let tcb = self.threads[tid.0]
            .take()
            .unwrap_or_else(|| panic!("carcass {tid} already reclaimed"));
        debug!("reclaiming thread \"{}\"", tcb.name);
        if let Some(space) = tcb.space.as_ref() {
            space.free_frames(&mut self.machine);
        }
        if let Some(host) = tcb.host {
            // The host thread has already handed the CPU away; dropping the
            // handle detaches it while it exits.
            drop(host);
        }
    }
}

impl Kernel {
    /// Dispatch the CPU to `next`, consuming the core guard across the
    /// hand-off.
    ///
    /// The caller has already moved the outgoing thread to its destination
    /// state (ready, blocked, or the carcass slot). When the outgoing thread
    /// is dispatched again — possibly much later — this function finishes by
    /// reclaiming any carcass and restoring the outgoing thread's user
    /// state, then returns to the caller as if nothing had happened in
    /// between. A finishing thread never parks and never returns to user
    /// code; its caller unwinds the host thread immediately.
    pub(crate) fn run_thread(&self, mut core: MutexGuard<'_, Core>, next: ThreadId) {
        let old = core.current;
        debug_assert_ne!(old, next, "dispatching the running thread");
        assert_eq!(
            core.int_level,
            IntStatus::Off,
            "context switch with interrupts enabled"
        );

        if core.thread(old).space.is_some() {
            core.save_user_state(old);
        }
        core.thread(old).check_overflow();

        debug!(
            "switching from \"{}\" to \"{}\"",
            core.thread(old).name,
            core.thread(next).name
        );

        core.current = next;
        core.thread_mut(next).status = ThreadState::Running;
        debug_assert!(core.single_running());

        let old_baton = core.thread(old).baton.clone();
        let next_baton = core.thread(next).baton.clone();
        let finishing = core.scheduler.to_be_destroyed == Some(old);
        drop(core);

        next_baton.wake();
        if finishing {
            // Terminal hand-off: the caller is Thread::finish, which returns
            // straight up through the trampoline and ends the host thread.
            return;
        }
        old_baton.park();

        // Back on the CPU. Destroy whatever parked itself in the carcass
        // slot while we were away, then put our user state back.
        let mut core = self.core();
        trace!("now in thread \"{}\"", core.thread(core.current).name);
        if let Some(carcass) = core.scheduler.to_be_destroyed.take() {
            core.reclaim(carcass);
        }
        let me = core.current;
        if core.thread(me).space.is_some() {
            core.restore_user_state(me);
        }
    }
}
