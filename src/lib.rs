//! TeideOS — an instructional operating-system simulator.
//!
//! The crate models a cooperative uniprocessor kernel the way the classic
//! teaching systems do: a thread control block per thread, a multilevel
//! priority-FIFO ready queue, counting semaphores, mutex locks with priority
//! donation, Mesa condition variables, synchronous rendezvous ports, and a
//! trap handler that turns user-mode system calls into kernel operations.
//!
//! # The execution model
//!
//! Simulated threads are backed by host OS threads, but a hand-off baton
//! guarantees that **exactly one of them executes at any instant**. A context
//! switch wakes the incoming thread's baton and parks the outgoing one, so
//! the kernel behaves as a single thread of control that hops between stacks,
//! which is what the simulated uniprocessor demands. Interrupt masking is
//! tracked as explicit level state: it marks the critical sections and is
//! validated by assertions, while the baton invariant is what actually makes
//! them atomic.
//!
//! All mutable kernel state lives in one [`Kernel`] value: the thread arena,
//! the scheduler, the synchronization-object tables, and the simulated
//! machine (registers, memory, interrupt level). A `Kernel` is created with
//! [`Kernel::new`] and shared into forked threads as an `Arc`.
//!
//! ```no_run
//! use teide_os::Kernel;
//!
//! let kernel = Kernel::new();
//! let child = kernel.fork_joinable("worker", 1, {
//!     let kernel = kernel.clone();
//!     move || {
//!         for _ in 0..3 {
//!             kernel.yield_now();
//!         }
//!     }
//! });
//! assert_eq!(kernel.join(child), 0);
//! ```

pub mod config;
pub mod fs;
pub mod machine;
pub mod sched;
pub mod sync;
pub mod sys;
pub mod user;

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use fs::FileSystem;
use machine::console::SynchConsole;
use machine::interrupt::IntStatus;
use machine::Machine;
use sched::thread::Thread;
use sched::Scheduler;
use sync::condition::{CondId, Condition};
use sync::lock::Lock;
use sync::port::Port;
use sync::semaphore::{SemId, Semaphore};

pub use machine::ExceptionType;
pub use sched::priority::Priority;
pub use sched::thread::{ThreadId, ThreadState};
pub use sync::condition::CondId as ConditionId;
pub use sync::lock::LockId;
pub use sync::port::PortId;
pub use sync::semaphore::SemId as SemaphoreId;

/// The kernel: every piece of global state of the simulated machine and the
/// operating system running on it.
///
/// The scheduler, thread arena, synchronization-object tables and machine
/// state sit behind a single mutex; the running simulated thread is the only
/// one that touches them, so the mutex is uncontended and exists to satisfy
/// the host's aliasing rules, not to arbitrate.
pub struct Kernel {
    core: Mutex<Core>,
    halted: AtomicBool,
    console: SynchConsole,
    fs: FileSystem,
    /// Back-reference to the owning `Arc`, for handing clones into the host
    /// threads that carry forked simulated threads.
    weak: Weak<Kernel>,
}

/// Mutable kernel state. One of these per [`Kernel`], always behind its
/// mutex.
pub(crate) struct Core {
    /// Thread arena. A `ThreadId` is a stable index into this table; a slot
    /// goes back to `None` when the carcass is reclaimed.
    pub(crate) threads: Vec<Option<Thread>>,
    pub(crate) scheduler: Scheduler,
    /// The one running thread. Invariant: outside a context switch, exactly
    /// one live thread has status `Running`, and it is this one.
    pub(crate) current: ThreadId,
    /// Live threads, for `join` lookup. Inserted at fork, removed at finish.
    pub(crate) proc_list: Vec<ThreadId>,
    pub(crate) int_level: IntStatus,
    pub(crate) machine: Machine,
    pub(crate) semaphores: Vec<Option<Semaphore>>,
    pub(crate) locks: Vec<Option<Lock>>,
    pub(crate) conditions: Vec<Option<Condition>>,
    pub(crate) ports: Vec<Option<Port>>,
}

impl Kernel {
    /// Create a kernel whose console uses the process's stdin and stdout.
    ///
    /// The calling host thread becomes the simulated `main` thread, running
    /// at priority 0.
    pub fn new() -> Arc<Kernel> {
        Kernel::with_console(Box::new(std::io::stdin()), Box::new(std::io::stdout()))
    }

    /// Create a kernel with the given console endpoints. Tests inject
    /// buffers here; the driver passes the real stdin/stdout.
    pub fn with_console(
        input: Box<dyn Read + Send>,
        output: Box<dyn Write + Send>,
    ) -> Arc<Kernel> {
        let mut threads = Vec::new();
        let main = Thread::bootstrap_main();
        threads.push(Some(main));

        let core = Core {
            threads,
            scheduler: Scheduler::new(),
            current: ThreadId(0),
            proc_list: Vec::new(),
            int_level: IntStatus::On,
            machine: Machine::new(),
            semaphores: Vec::new(),
            locks: Vec::new(),
            conditions: Vec::new(),
            ports: Vec::new(),
        };

        Arc::new_cyclic(|weak| Kernel {
            core: Mutex::new(core),
            halted: AtomicBool::new(false),
            console: SynchConsole::with_endpoints(input, output),
            fs: FileSystem::new(),
            weak: weak.clone(),
        })
    }

    pub(crate) fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().expect("kernel state poisoned by an earlier panic")
    }

    /// A strong handle to this kernel, for closures that outlive the caller.
    pub(crate) fn arc(&self) -> Arc<Kernel> {
        self.weak.upgrade().expect("kernel already dropped")
    }

    /// The stub file system.
    pub fn file_system(&self) -> &FileSystem {
        &self.fs
    }

    /// The synchronous console.
    pub fn console(&self) -> &SynchConsole {
        &self.console
    }

    /// Whether a user program has asked the machine to stop.
    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub(crate) fn set_halted(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    /// Id of the running thread.
    pub fn current_thread(&self) -> ThreadId {
        self.core().current
    }

    /// Current (possibly donated) priority of the running thread.
    pub fn current_priority(&self) -> Priority {
        let core = self.core();
        core.thread(core.current).priority
    }

    /// Name of a live thread, if it still exists.
    pub fn thread_name(&self, tid: ThreadId) -> Option<String> {
        let core = self.core();
        core.threads
            .get(tid.0)
            .and_then(|slot| slot.as_ref())
            .map(|t| t.name.clone())
    }

    /// Read a machine register. Part of the machine collaborator surface,
    /// exposed so drivers and tests can stage trap arguments.
    pub fn read_register(&self, reg: usize) -> i32 {
        self.core().machine.read_register(reg)
    }

    /// Write a machine register.
    pub fn write_register(&self, reg: usize, value: i32) {
        self.core().machine.write_register(reg, value);
    }

    /// Read `size` bytes (1, 2 or 4) from simulated memory at a user virtual
    /// address. `None` if the address does not translate.
    pub fn read_mem(&self, addr: usize, size: usize) -> Option<i32> {
        self.core().machine.read_mem(addr, size)
    }

    /// Write `size` bytes to simulated memory. `false` if the address does
    /// not translate.
    pub fn write_mem(&self, addr: usize, size: usize, value: i32) -> bool {
        self.core().machine.write_mem(addr, size, value)
    }
}

impl Core {
    /// Borrow a live thread's TCB. Panics if the thread has been reclaimed;
    /// holding a dead `ThreadId` here is a kernel bug.
    pub(crate) fn thread(&self, tid: ThreadId) -> &Thread {
        self.threads[tid.0]
            .as_ref()
            .unwrap_or_else(|| panic!("thread {tid} has been reclaimed"))
    }

    pub(crate) fn thread_mut(&mut self, tid: ThreadId) -> &mut Thread {
        self.threads[tid.0]
            .as_mut()
            .unwrap_or_else(|| panic!("thread {tid} has been reclaimed"))
    }

    /// Thread slots are never reused: a reclaimed thread's id stays dead, so
    /// a stale id held by a joiner resolves to "already gone" instead of to
    /// an unrelated newer thread.
    pub(crate) fn add_thread(&mut self, thread: Thread) -> ThreadId {
        self.threads.push(Some(thread));
        ThreadId(self.threads.len() - 1)
    }

    pub(crate) fn semaphore(&self, id: SemId) -> &Semaphore {
        self.semaphores[id.0]
            .as_ref()
            .unwrap_or_else(|| panic!("semaphore {} has been destroyed", id.0))
    }

    pub(crate) fn semaphore_mut(&mut self, id: SemId) -> &mut Semaphore {
        self.semaphores[id.0]
            .as_mut()
            .unwrap_or_else(|| panic!("semaphore {} has been destroyed", id.0))
    }

    pub(crate) fn lock(&self, id: LockId) -> &Lock {
        self.locks[id.0]
            .as_ref()
            .unwrap_or_else(|| panic!("lock {} has been destroyed", id.0))
    }

    pub(crate) fn lock_mut(&mut self, id: LockId) -> &mut Lock {
        self.locks[id.0]
            .as_mut()
            .unwrap_or_else(|| panic!("lock {} has been destroyed", id.0))
    }

    pub(crate) fn condition(&self, id: CondId) -> &Condition {
        self.conditions[id.0]
            .as_ref()
            .unwrap_or_else(|| panic!("condition {} has been destroyed", id.0))
    }

    pub(crate) fn condition_mut(&mut self, id: CondId) -> &mut Condition {
        self.conditions[id.0]
            .as_mut()
            .unwrap_or_else(|| panic!("condition {} has been destroyed", id.0))
    }

    pub(crate) fn port(&self, id: PortId) -> &Port {
        self.ports[id.0]
            .as_ref()
            .unwrap_or_else(|| panic!("port {} has been destroyed", id.0))
    }

    pub(crate) fn port_mut(&mut self, id: PortId) -> &mut Port {
        self.ports[id.0]
            .as_mut()
            .unwrap_or_else(|| panic!("port {} has been destroyed", id.0))
    }

    /// Exactly one live thread is `Running` (used from debug assertions at
    /// dispatch points).
    pub(crate) fn single_running(&self) -> bool {
        self.threads
            .iter()
            .flatten()
            .filter(|t| t.status == ThreadState::Running)
            .count()
            == 1
    }
}

/// Install `value` in the first free slot of an id-indexed table, growing it
/// when every slot is taken. Slot indices are the object ids handed out to
/// callers.
pub(crate) fn alloc_slot<T>(table: &mut Vec<Option<T>>, value: T) -> usize {
    match table.iter_mut().position(|slot| slot.is_none()) {
        Some(idx) => {
            table[idx] = Some(value);
            idx
        }
        None => {
            table.push(Some(value));
            table.len() - 1
        }
    }
}
