//! System-call dispatch.
//!
//! Entry point into the kernel from user programs. The calling convention is
//! the wire-level contract with compiled user code: the syscall number
//! arrives in r2, arguments in r4–r7, and the result, if any, goes back in
//! r2. After every dispatched call except Exit the program counters advance
//! exactly once — forgetting that would re-execute the same trap forever,
//! and advancing twice would skip an instruction.
//!
//! Errors never unwind across this boundary: every syscall either produces a
//! well-defined integer in r2 or terminates the caller. Translation faults
//! while marshalling arguments turn into −1 (or a silent drop where the
//! signature returns nothing); a non-syscall exception from user mode is a
//! fatal assertion.

use log::{debug, warn};
use thiserror::Error;

use crate::config::{CONSOLE_INPUT, CONSOLE_OUTPUT, MAX_SYSCALL_STRING};
use crate::machine::{ExceptionType, RunOutcome, R2, R4, R5, R6};
use crate::sched::thread::ThreadId;
use crate::user::addrspace::{AddrSpace, ExecError};
use crate::{Core, Kernel};

/// Syscall numbers, fixed by the user-side library.
pub mod sc {
    pub const HALT: i32 = 0;
    pub const EXIT: i32 = 1;
    pub const EXEC: i32 = 2;
    pub const JOIN: i32 = 3;
    pub const CREATE: i32 = 4;
    pub const OPEN: i32 = 5;
    pub const READ: i32 = 6;
    pub const WRITE: i32 = 7;
    pub const CLOSE: i32 = 8;
}

/// How the trap handler left the current thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    /// Back to user mode at the advanced PC.
    Return,
    /// The thread called Exit; it does not return to user mode.
    Exited,
}

/// A user address that failed to translate during argument marshalling.
#[derive(Debug, Error)]
#[error("user address {addr:#x} failed to translate")]
struct TranslationFault {
    addr: usize,
}

fn syscall_name(code: i32) -> &'static str {
    match code {
        sc::HALT => "Halt",
        sc::EXIT => "Exit",
        sc::EXEC => "Exec",
        sc::JOIN => "Join",
        sc::CREATE => "Create",
        sc::OPEN => "Open",
        sc::READ => "Read",
        sc::WRITE => "Write",
        sc::CLOSE => "Close",
        _ => "Unknown",
    }
}

impl Kernel {
    /// Public trap entry, called by the machine (and by tests that stage a
    /// register bank directly).
    pub fn exception(&self, which: ExceptionType) {
        exception_handler(self, which);
    }

    /// Spawn a user program: open `name`, build an address space for it, and
    /// fork a joinable priority-0 thread that enters user mode on it. The
    /// returned id doubles as the SpaceId user code sees.
    pub fn exec(&self, name: &str) -> Result<ThreadId, ExecError> {
        let executable = self
            .fs
            .open(name)
            .ok_or_else(|| ExecError::NotFound(name.to_string()))?;
        let space = AddrSpace::new(&executable, &mut self.core().machine)?;

        let kernel = self.arc();
        let tid = self.fork_joinable(name, 0, move || {
            {
                let mut core = kernel.core();
                let Core {
                    threads,
                    machine,
                    current,
                    ..
                } = &mut *core;
                let tcb = threads[current.0]
                    .as_mut()
                    .expect("running thread reclaimed");
                let space = tcb.space.as_ref().expect("user thread without a space");
                space.init_registers(machine);
                space.restore_state(machine);
            }
            match kernel.machine_run() {
                // The trampoline finishes the thread either way; Exit has
                // already recorded the status it wants reported.
                RunOutcome::Exited | RunOutcome::Halted => {}
            }
        });
        self.core().thread_mut(tid).space = Some(space);
        Ok(tid)
    }
}

/// Decode and perform one trap. On return (except for Exit) the program
/// counters have advanced past the trapping instruction.
pub(crate) fn exception_handler(kernel: &Kernel, which: ExceptionType) -> Dispatch {
    assert_eq!(
        which,
        ExceptionType::Syscall,
        "unexpected user mode exception {which:?}"
    );

    let (code, arg1, arg2, arg3) = {
        let core = kernel.core();
        (
            core.machine.read_register(R2),
            core.machine.read_register(R4),
            core.machine.read_register(R5),
            core.machine.read_register(R6),
        )
    };
    debug!("syscall {} ({code})", syscall_name(code));

    match code {
        sc::HALT => {
            debug!("shutdown initiated by user program");
            kernel.halt();
        }
        sc::EXIT => {
            let mut core = kernel.core();
            let me = core.current;
            core.thread_mut(me).exit_status = arg1;
            debug!("thread \"{}\" exiting with status {arg1}", core.thread(me).name);
            return Dispatch::Exited;
        }
        sc::EXEC => {
            let result = sys_exec(kernel, arg1 as usize);
            set_result(kernel, result);
        }
        sc::JOIN => {
            let status = kernel.join(ThreadId(arg1 as usize));
            set_result(kernel, status);
        }
        sc::CREATE => sys_create(kernel, arg1 as usize),
        sc::OPEN => {
            let result = sys_open(kernel, arg1 as usize);
            set_result(kernel, result);
        }
        sc::READ => {
            let result = sys_read(kernel, arg1 as usize, arg2, arg3);
            set_result(kernel, result);
        }
        sc::WRITE => sys_write(kernel, arg1 as usize, arg2, arg3),
        sc::CLOSE => {
            let mut core = kernel.core();
            let me = core.current;
            core.thread_mut(me).fd_remove(arg1);
            debug!("closed file descriptor {arg1}");
        }
        unknown => warn!("unknown syscall code {unknown}"),
    }

    kernel.core().machine.advance_pc();
    Dispatch::Return
}

fn set_result(kernel: &Kernel, value: i32) {
    kernel.core().machine.write_register(R2, value);
}

/// SpaceId Exec(char *name). −1 on any failure before the fork.
fn sys_exec(kernel: &Kernel, name_addr: usize) -> i32 {
    let name = match read_string(kernel, name_addr) {
        Ok(name) => name,
        Err(fault) => {
            debug!("Exec: {fault}");
            return -1;
        }
    };
    match kernel.exec(&name) {
        Ok(tid) => tid.0 as i32,
        Err(err) => {
            debug!("Exec \"{name}\": {err}");
            -1
        }
    }
}

/// void Create(char *name). Errors are dropped silently.
fn sys_create(kernel: &Kernel, name_addr: usize) {
    match read_string(kernel, name_addr) {
        Ok(name) => {
            if let Err(err) = kernel.file_system().create(&name, 0) {
                debug!("Create: {err}");
            } else {
                debug!("created file \"{name}\"");
            }
        }
        Err(fault) => debug!("Create: {fault}"),
    }
}

/// OpenFileId Open(char *name). −1 on any failure.
fn sys_open(kernel: &Kernel, name_addr: usize) -> i32 {
    let name = match read_string(kernel, name_addr) {
        Ok(name) => name,
        Err(fault) => {
            debug!("Open: {fault}");
            return -1;
        }
    };
    let Some(file) = kernel.file_system().open(&name) else {
        debug!("Open: no file \"{name}\"");
        return -1;
    };
    let mut core = kernel.core();
    let me = core.current;
    match core.thread_mut(me).fd_create(file) {
        Some(fd) => {
            debug!("opened \"{name}\" as descriptor {fd}");
            fd
        }
        None => {
            debug!("Open \"{name}\": descriptor table full");
            -1
        }
    }
}

/// void Write(char *buffer, int size, OpenFileId id).
fn sys_write(kernel: &Kernel, buf_addr: usize, size: i32, fd: i32) {
    if fd == CONSOLE_INPUT {
        warn!("Write to console input rejected");
        return;
    }
    let Ok(size) = usize::try_from(size) else {
        debug!("Write: negative size {size}");
        return;
    };
    let bytes = match read_buffer(kernel, buf_addr, size) {
        Ok(bytes) => bytes,
        Err(fault) => {
            debug!("Write: {fault}");
            return;
        }
    };
    if fd == CONSOLE_OUTPUT {
        kernel.console().write_all(&bytes);
        return;
    }
    let file = {
        let core = kernel.core();
        core.thread(core.current).fd_get(fd)
    };
    match file {
        Some(file) => file.write(&bytes),
        None => debug!("Write: no descriptor {fd}"),
    }
}

/// int Read(char *buffer, int size, OpenFileId id).
fn sys_read(kernel: &Kernel, buf_addr: usize, size: i32, fd: i32) -> i32 {
    if fd == CONSOLE_OUTPUT {
        warn!("Read from console output rejected");
        return -1;
    }
    let Ok(size) = usize::try_from(size) else {
        debug!("Read: negative size {size}");
        return -1;
    };

    if fd == CONSOLE_INPUT {
        let mut line = vec![0u8; size + 1];
        let count = kernel.console().read_line(&mut line);
        return match write_buffer(kernel, buf_addr, &line[..count]) {
            Ok(()) => count as i32,
            Err(fault) => {
                debug!("Read: {fault}");
                -1
            }
        };
    }

    let file = {
        let core = kernel.core();
        core.thread(core.current).fd_get(fd)
    };
    let Some(file) = file else {
        debug!("Read: no descriptor {fd}");
        return -1;
    };
    let mut bytes = vec![0u8; size];
    let count = file.read(&mut bytes);
    match write_buffer(kernel, buf_addr, &bytes[..count]) {
        Ok(()) => count as i32,
        Err(fault) => {
            debug!("Read: {fault}");
            -1
        }
    }
}

/// Copy a NUL-terminated string out of user space, one byte at a time,
/// capped at `MAX_SYSCALL_STRING` bytes.
fn read_string(kernel: &Kernel, addr: usize) -> Result<String, TranslationFault> {
    let core = kernel.core();
    let mut bytes = Vec::new();
    for offset in 0.. {
        let at = addr + offset;
        let byte = core
            .machine
            .read_mem(at, 1)
            .ok_or(TranslationFault { addr: at })? as u8;
        if byte == 0 || bytes.len() >= MAX_SYSCALL_STRING {
            break;
        }
        bytes.push(byte);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Copy `size` bytes out of user space, aborting on the first byte that
/// fails to translate.
fn read_buffer(kernel: &Kernel, addr: usize, size: usize) -> Result<Vec<u8>, TranslationFault> {
    let core = kernel.core();
    let mut bytes = Vec::with_capacity(size);
    for offset in 0..size {
        let at = addr + offset;
        let byte = core
            .machine
            .read_mem(at, 1)
            .ok_or(TranslationFault { addr: at })? as u8;
        bytes.push(byte);
    }
    Ok(bytes)
}

/// Copy bytes into user space, failing before any byte is written past a
/// translation fault.
fn write_buffer(kernel: &Kernel, addr: usize, bytes: &[u8]) -> Result<(), TranslationFault> {
    let mut core = kernel.core();
    for (offset, &byte) in bytes.iter().enumerate() {
        let at = addr + offset;
        if !core.machine.write_mem(at, 1, i32::from(byte)) {
            return Err(TranslationFault { addr: at });
        }
    }
    Ok(())
}
