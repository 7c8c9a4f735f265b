//! Threads: the control block and the lifecycle operations.
//!
//! Four operations drive a thread's life:
//!
//! - `fork` — create a thread running a closure concurrently with the caller
//! - `finish` — called when the forked closure returns, to clean up
//! - `yield_now` — relinquish the CPU to another ready thread
//! - `sleep` — relinquish the CPU and block until explicitly rewoken
//!
//! Each simulated thread is carried by a host OS thread that spends its
//! whole life parked on the thread's baton, except when the scheduler has
//! dispatched it. Forking spawns the host thread parked; the first dispatch
//! releases it into a trampoline that enables interrupts, runs the entry
//! closure, and finishes.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread as host;

use log::debug;

use crate::config::{FD_TABLE_SIZE, MAX_PRIORITY, STACK_FENCEPOST};
use crate::fs::OpenFile;
use crate::machine::interrupt::{IntGuard, IntStatus};
use crate::machine::NUM_TOTAL_REGS;
use crate::sched::priority::Priority;
use crate::sync::port::PortId;
use crate::user::addrspace::AddrSpace;
use crate::Kernel;

/// Identifies a thread for the whole run. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub(crate) usize);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid {}", self.0)
    }
}

/// A thread's scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Allocated but not yet handed to the scheduler.
    JustCreated,
    /// In a ready-queue bucket, waiting for the CPU.
    Ready,
    /// On the CPU. Exactly one live thread is in this state at any quiescent
    /// point, and it is never in the ready queue.
    Running,
    /// Waiting on a synchronization object; rewoken only by an explicit V,
    /// signal or rendezvous from another thread.
    Blocked,
}

/// The hand-off baton. `wake` grants the CPU, `park` waits for it; the
/// handshake flag absorbs the race where the grant lands before the park.
pub(crate) struct Baton {
    scheduled: Mutex<bool>,
    cv: Condvar,
}

impl Baton {
    pub(crate) fn new() -> Self {
        Baton {
            scheduled: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn wake(&self) {
        let mut scheduled = self.scheduled.lock().expect("baton poisoned");
        *scheduled = true;
        self.cv.notify_one();
    }

    pub(crate) fn park(&self) {
        let mut scheduled = self.scheduled.lock().expect("baton poisoned");
        while !*scheduled {
            scheduled = self.cv.wait(scheduled).expect("baton poisoned");
        }
        *scheduled = false;
    }
}

/// Thread control block.
pub(crate) struct Thread {
    pub(crate) name: String,
    pub(crate) status: ThreadState,
    /// Current scheduling priority; rises above `initial_priority` while a
    /// higher-priority waiter has donated to this thread.
    pub(crate) priority: Priority,
    pub(crate) initial_priority: Priority,
    pub(crate) joinable: bool,
    pub(crate) exit_status: i32,
    /// Rendezvous port a joiner receives the exit status on. Present for the
    /// whole lifetime iff the thread is joinable; destroyed by the joiner.
    pub(crate) join_port: Option<PortId>,
    pub(crate) space: Option<AddrSpace>,
    /// Per-thread descriptor table. Slots 0 and 1 denote the console and are
    /// never occupied here.
    pub(crate) fd_table: [Option<OpenFile>; FD_TABLE_SIZE],
    /// The user-mode register file while this thread is off the CPU.
    pub(crate) user_registers: [i32; NUM_TOTAL_REGS],
    /// Fencepost at the edge of the stack region; checked on every dispatch.
    pub(crate) stack_fence: u32,
    pub(crate) baton: Arc<Baton>,
    /// Handle of the carrying host thread; `None` only for the bootstrap
    /// main thread, which rides the caller's own host thread.
    pub(crate) host: Option<host::JoinHandle<()>>,
}

impl Thread {
    fn new(name: &str, priority: Priority, joinable: bool, join_port: Option<PortId>) -> Self {
        Thread {
            name: name.to_string(),
            status: ThreadState::JustCreated,
            priority,
            initial_priority: priority,
            joinable,
            exit_status: 0,
            join_port,
            space: None,
            fd_table: [const { None }; FD_TABLE_SIZE],
            user_registers: [0; NUM_TOTAL_REGS],
            stack_fence: STACK_FENCEPOST,
            baton: Arc::new(Baton::new()),
            host: None,
        }
    }

    /// TCB for the thread that called `Kernel::new`. It is already running
    /// on the caller's stack, so it starts `Running` with no host handle.
    pub(crate) fn bootstrap_main() -> Self {
        let mut main = Thread::new("main", 0, false, None);
        main.status = ThreadState::Running;
        main
    }

    /// Assert the stack fencepost is intact.
    pub(crate) fn check_overflow(&self) {
        assert_eq!(
            self.stack_fence, STACK_FENCEPOST,
            "stack overflow detected in thread \"{}\"",
            self.name
        );
    }

    /// Look up an open descriptor. Slots 0 and 1 are the console and have no
    /// table entry.
    pub(crate) fn fd_get(&self, fd: i32) -> Option<OpenFile> {
        let idx = usize::try_from(fd).ok()?;
        self.fd_table.get(idx)?.clone()
    }

    /// Install `file` in the first free slot at index 2 or above; `None`
    /// when the table is full.
    pub(crate) fn fd_create(&mut self, file: OpenFile) -> Option<i32> {
        for (idx, slot) in self.fd_table.iter_mut().enumerate().skip(2) {
            if slot.is_none() {
                *slot = Some(file);
                return Some(idx as i32);
            }
        }
        None
    }

    /// Close and clear a descriptor. Unknown descriptors are ignored.
    pub(crate) fn fd_remove(&mut self, fd: i32) {
        if let Ok(idx) = usize::try_from(fd) {
            if idx >= 2 && idx < FD_TABLE_SIZE {
                self.fd_table[idx] = None;
            }
        }
    }
}

impl Kernel {
    /// Fork a thread running `entry` concurrently with the caller.
    ///
    /// The thread starts on the ready queue at `priority`; it actually runs
    /// once the scheduler dispatches it, with interrupts enabled, and
    /// finishes when `entry` returns.
    ///
    /// # Arguments
    ///
    /// * `name` - Thread name, for debug output
    /// * `priority` - Scheduling priority, `0..MAX_PRIORITY`
    /// * `entry` - Body to run on the new thread
    ///
    /// # Returns
    ///
    /// The new thread's id. Ids stay valid forever; a finished thread's id
    /// simply stops matching anything.
    pub fn fork<F>(&self, name: &str, priority: Priority, entry: F) -> ThreadId
    where
        F: FnOnce() + Send + 'static,
    {
        self.fork_inner(name, priority, false, Box::new(entry))
    }

    /// Fork a thread whose exit status can be collected with [`Kernel::join`].
    ///
    /// A joinable thread owns a rendezvous port for its whole life; `finish`
    /// sends the exit status through it and blocks until the joiner
    /// receives.
    pub fn fork_joinable<F>(&self, name: &str, priority: Priority, entry: F) -> ThreadId
    where
        F: FnOnce() + Send + 'static,
    {
        self.fork_inner(name, priority, true, Box::new(entry))
    }

    fn fork_inner(
        &self,
        name: &str,
        priority: Priority,
        joinable: bool,
        entry: Box<dyn FnOnce() + Send>,
    ) -> ThreadId {
        assert!(priority < MAX_PRIORITY, "priority {priority} out of range");
        debug!("forking thread \"{name}\" at priority {priority}");

        let join_port = joinable.then(|| self.port_create(&format!("{name} join port")));
        let tid = self.core().add_thread(Thread::new(name, priority, joinable, join_port));

        let kernel = self.arc();
        let baton = self.core().thread(tid).baton.clone();
        let handle = host::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                // Wait for the first dispatch, then behave like a fresh
                // context: enable interrupts, run the body, finish.
                baton.park();
                kernel.set_level(IntStatus::On);
                // A panic in kernel code is a fatal assertion; it must take
                // the whole simulator down, not strand the CPU in a thread
                // that will never hand it off.
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(entry)).is_err() {
                    std::process::abort();
                }
                kernel.finish_current();
            })
            .expect("failed to spawn host thread");
        self.core().thread_mut(tid).host = Some(handle);

        let _masked = IntGuard::new(self);
        let mut core = self.core();
        core.ready_to_run(tid);
        core.proc_list.push(tid);
        tid
    }

    /// Relinquish the CPU if a thread of equal or higher priority is ready.
    ///
    /// Peeks the best ready thread; when its priority is at least the
    /// caller's, the caller goes back on the ready queue and the peeked
    /// thread runs. A strictly lower-priority thread is reinserted and the
    /// caller keeps the CPU — cooperative yielding never violates strict
    /// priority. Returns immediately when nothing is ready.
    pub fn yield_now(&self) {
        let _masked = IntGuard::new(self);
        let mut core = self.core();
        let me = core.current;
        debug!("yielding thread \"{}\"", core.thread(me).name);

        if let Some(next) = core.find_next_to_run() {
            if core.thread(me).priority <= core.thread(next).priority {
                core.ready_to_run(me);
                self.run_thread(core, next);
            } else {
                core.ready_to_run(next);
            }
        }
    }

    /// Block the current thread. Requires interrupts masked; consumes the
    /// core guard across the dispatch. The caller must already have arranged
    /// for someone to rewake the thread.
    ///
    /// While nothing is runnable the machine idles, which in this simulator
    /// is fatal (see [`Kernel::idle`]).
    pub(crate) fn sleep(&self, mut core: MutexGuard<'_, crate::Core>) {
        assert_eq!(
            core.int_level,
            IntStatus::Off,
            "sleep with interrupts enabled"
        );
        let me = core.current;
        debug!("sleeping thread \"{}\"", core.thread(me).name);
        core.thread_mut(me).status = ThreadState::Blocked;

        let next = loop {
            match core.find_next_to_run() {
                Some(next) => break next,
                None => self.idle(),
            }
        };
        self.run_thread(core, next);
    }

    /// Terminate the current thread.
    ///
    /// Sends the exit status to the joiner when the thread is joinable (this
    /// blocks until the joiner receives), removes the thread from the
    /// process list, parks the TCB in the carcass slot and hands the CPU
    /// away for the last time. The simulated thread never runs again; the
    /// caller — the fork trampoline — returns immediately afterwards and the
    /// host thread exits.
    pub(crate) fn finish_current(&self) {
        self.set_level(IntStatus::Off);
        let (me, join_port, status) = {
            let core = self.core();
            let tcb = core.thread(core.current);
            debug!("finishing thread \"{}\"", tcb.name);
            (core.current, tcb.join_port, tcb.exit_status)
        };

        if let Some(port) = join_port {
            self.port_send(port, status);
        }

        let mut core = self.core();
        core.proc_list.retain(|&t| t != me);
        if let Some(leaked) = core.scheduler.to_be_destroyed.replace(me) {
            // The previous carcass was never reclaimed (its successor was a
            // first-dispatch); it leaks, as in the original design.
            debug!("carcass {leaked} leaked by back-to-back finishes");
        }
        self.sleep(core);
    }

    /// Wait for `child` to finish and return its exit status, or −1 when no
    /// such thread is live (already finished and joined, or never existed).
    ///
    /// The joiner receives on the child's port — the send side sits in the
    /// child's `finish` — and then destroys the port. Destroying it here
    /// rather than in the child keeps the port alive for as long as the
    /// child could still be touching it.
    ///
    /// # Panics
    ///
    /// Joining a live thread that was not forked joinable is a caller bug.
    pub fn join(&self, child: ThreadId) -> i32 {
        let port = {
            let core = self.core();
            if !core.proc_list.contains(&child) {
                return -1;
            }
            let tcb = core.thread(child);
            assert!(tcb.joinable, "join on non-joinable thread \"{}\"", tcb.name);
            tcb.join_port.expect("joinable thread without a port")
        };
        let status = self.port_receive(port);
        self.port_destroy(port);
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FD_TABLE_SIZE, STACK_FENCEPOST};
    use crate::fs::FileSystem;

    fn open_file() -> crate::fs::OpenFile {
        let fs = FileSystem::new();
        fs.preload("f", vec![1, 2, 3]);
        fs.open("f").unwrap()
    }

    #[test]
    fn descriptors_start_after_the_console_slots() {
        let mut t = Thread::bootstrap_main();
        assert_eq!(t.fd_create(open_file()), Some(2));
        assert_eq!(t.fd_create(open_file()), Some(3));
        assert!(t.fd_get(2).is_some());
        assert!(t.fd_get(0).is_none());
        assert!(t.fd_get(1).is_none());
    }

    #[test]
    fn removed_descriptors_are_reused_first() {
        let mut t = Thread::bootstrap_main();
        assert_eq!(t.fd_create(open_file()), Some(2));
        assert_eq!(t.fd_create(open_file()), Some(3));
        t.fd_remove(2);
        assert!(t.fd_get(2).is_none());
        assert_eq!(t.fd_create(open_file()), Some(2));
    }

    #[test]
    fn a_full_table_yields_no_descriptor() {
        let mut t = Thread::bootstrap_main();
        for _ in 2..FD_TABLE_SIZE {
            assert!(t.fd_create(open_file()).is_some());
        }
        assert_eq!(t.fd_create(open_file()), None);
    }

    #[test]
    fn out_of_range_descriptors_are_ignored() {
        let mut t = Thread::bootstrap_main();
        t.fd_remove(-1);
        t.fd_remove(FD_TABLE_SIZE as i32 + 5);
        assert!(t.fd_get(-1).is_none());
        assert!(t.fd_get(1000).is_none());
    }

    #[test]
    fn fresh_fencepost_passes_the_overflow_check() {
        let t = Thread::bootstrap_main();
        t.check_overflow();
    }

    #[test]
    #[should_panic(expected = "stack overflow")]
    fn corrupted_fencepost_is_fatal() {
        let mut t = Thread::bootstrap_main();
        t.stack_fence = !STACK_FENCEPOST;
        t.check_overflow();
    }
}
