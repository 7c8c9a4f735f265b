//! Simulated interrupt controller.
//!
//! On the simulated uniprocessor, masking interrupts is the kernel's only
//! atomicity primitive: every mutation of the ready queue, of semaphore state
//! or of a thread's status happens with interrupts off. The synchronization
//! primitives cannot use a blocking lock for this, because waiting on one
//! would recursively invoke the scheduler.
//!
//! In the hosted model there is no asynchronous interrupt delivery; the level
//! is explicit state that marks critical sections and backs the assertions in
//! the scheduler and the primitives (`sleep` with interrupts enabled is a
//! fatal bug, for instance).

use log::info;

use crate::Kernel;

/// Interrupt mask level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntStatus {
    /// Interrupts masked; the running thread cannot lose the CPU except by
    /// suspending itself.
    Off,
    /// Interrupts deliverable.
    On,
}

impl Kernel {
    /// Set the interrupt level, returning the prior one. Callers restore the
    /// returned level rather than unconditionally enabling, because many
    /// operations are themselves entered with interrupts already off.
    pub(crate) fn set_level(&self, level: IntStatus) -> IntStatus {
        let mut core = self.core();
        std::mem::replace(&mut core.int_level, level)
    }

    /// The current interrupt level.
    pub fn int_level(&self) -> IntStatus {
        self.core().int_level
    }

    /// Called by `sleep` when no thread is runnable. With no pending device
    /// interrupts, nothing can ever make a thread runnable again, so this is
    /// either a deadlock or the end of the workload; both are fatal here.
    pub(crate) fn idle(&self) -> ! {
        panic!("machine idle: no threads ready and no pending interrupts");
    }

    /// Stop the machine. The user-mode run loop observes the flag and
    /// returns; kernel threads keep running until they finish on their own.
    pub fn halt(&self) {
        info!("machine halt requested by {}", {
            let core = self.core();
            core.thread(core.current).name.clone()
        });
        self.set_halted();
    }
}

/// RAII critical section: masks interrupts on construction, restores the
/// prior level on drop.
pub(crate) struct IntGuard<'a> {
    kernel: &'a Kernel,
    prior: IntStatus,
}

impl<'a> IntGuard<'a> {
    pub(crate) fn new(kernel: &'a Kernel) -> Self {
        let prior = kernel.set_level(IntStatus::Off);
        IntGuard { kernel, prior }
    }
}

impl Drop for IntGuard<'_> {
    fn drop(&mut self) {
        self.kernel.set_level(self.prior);
    }
}
