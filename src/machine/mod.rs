//! The simulated machine: register file, physical memory, address
//! translation and the user-mode execution loop.
//!
//! The register layout and the trap calling convention (syscall number in
//! r2, arguments in r4–r7, result in r2) are the wire-level contract user
//! programs are compiled against; they must not change.
//!
//! Only the slice of the instruction set that the kernel's contract needs is
//! interpreted here: `nop` executes, the SYSCALL encoding traps, anything
//! else is a fatal unknown instruction.

pub mod console;
pub mod interrupt;

use log::trace;

use crate::config::{NUM_PHYS_PAGES, PAGE_SIZE};
use crate::sys::syscall::{exception_handler, Dispatch};
use crate::Kernel;

/// General-purpose registers.
pub const NUM_GP_REGS: usize = 32;
/// Multiply/divide result registers.
pub const HI_REG: usize = 32;
pub const LO_REG: usize = 33;
/// Current program counter.
pub const PC_REG: usize = 34;
/// Next program counter, accounting for the branch delay slot.
pub const NEXT_PC_REG: usize = 35;
/// Previous program counter, for debugging.
pub const PREV_PC_REG: usize = 36;
/// Delayed-load bookkeeping.
pub const LOAD_REG: usize = 37;
pub const LOAD_VALUE_REG: usize = 38;
/// Faulting virtual address on an address error.
pub const BAD_VADDR_REG: usize = 39;
/// Total registers in the file.
pub const NUM_TOTAL_REGS: usize = 40;

/// Syscall-number register.
pub const R2: usize = 2;
/// Argument registers.
pub const R4: usize = 4;
pub const R5: usize = 5;
pub const R6: usize = 6;
pub const R7: usize = 7;

const OP_NOP: u32 = 0x0000_0000;
const OP_SYSCALL: u32 = 0x0000_000c;

/// What pulled execution out of user mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionType {
    /// A user program executed the SYSCALL instruction.
    Syscall,
    /// A memory reference could not be translated.
    PageFault,
    /// A misaligned or out-of-space memory reference.
    AddressError,
    /// An instruction the machine does not implement.
    IllegalInstruction,
}

/// Why the user-mode run loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    /// A user program asked the interrupt controller to stop the machine.
    Halted,
    /// The current thread exited via the Exit syscall.
    Exited,
}

/// Register file, physical memory and the current translation.
pub(crate) struct Machine {
    registers: [i32; NUM_TOTAL_REGS],
    memory: Vec<u8>,
    /// Physical frame per virtual page of the running address space; `None`
    /// while a pure kernel thread is current (addresses then translate
    /// one-to-one, bounds-checked).
    pub(crate) page_table: Option<Vec<usize>>,
    /// Which physical frames are taken.
    frame_map: [bool; NUM_PHYS_PAGES],
}

impl Machine {
    pub(crate) fn new() -> Self {
        Machine {
            registers: [0; NUM_TOTAL_REGS],
            memory: vec![0; NUM_PHYS_PAGES * PAGE_SIZE],
            page_table: None,
            frame_map: [false; NUM_PHYS_PAGES],
        }
    }

    pub(crate) fn read_register(&self, reg: usize) -> i32 {
        assert!(reg < NUM_TOTAL_REGS, "register {reg} out of range");
        self.registers[reg]
    }

    pub(crate) fn write_register(&mut self, reg: usize, value: i32) {
        assert!(reg < NUM_TOTAL_REGS, "register {reg} out of range");
        self.registers[reg] = value;
    }

    /// Translate a user virtual address to a physical one, or `None` when it
    /// does not map. Accesses are size-aligned, so a translated access never
    /// straddles a page.
    fn translate(&self, vaddr: usize, size: usize) -> Option<usize> {
        assert!(size == 1 || size == 2 || size == 4, "bad access size {size}");
        if vaddr % size != 0 {
            return None;
        }
        match &self.page_table {
            Some(table) => {
                let vpage = vaddr / PAGE_SIZE;
                let offset = vaddr % PAGE_SIZE;
                let frame = *table.get(vpage)?;
                Some(frame * PAGE_SIZE + offset)
            }
            None => (vaddr + size <= self.memory.len()).then_some(vaddr),
        }
    }

    /// Read `size` bytes (little-endian) at `vaddr`.
    pub(crate) fn read_mem(&self, vaddr: usize, size: usize) -> Option<i32> {
        let paddr = self.translate(vaddr, size)?;
        let bytes = &self.memory[paddr..paddr + size];
        let value = bytes
            .iter()
            .rev()
            .fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
        trace!("read {size} bytes at {vaddr:#x}: {value:#x}");
        Some(value as i32)
    }

    /// Write the low `size` bytes of `value` at `vaddr`. Returns whether the
    /// address translated.
    pub(crate) fn write_mem(&mut self, vaddr: usize, size: usize, value: i32) -> bool {
        let Some(paddr) = self.translate(vaddr, size) else {
            return false;
        };
        let bytes = (value as u32).to_le_bytes();
        self.memory[paddr..paddr + size].copy_from_slice(&bytes[..size]);
        trace!("wrote {size} bytes at {vaddr:#x}: {value:#x}");
        true
    }

    /// Direct physical access, for loading program images.
    pub(crate) fn physical_mut(&mut self, frame: usize) -> &mut [u8] {
        let start = frame * PAGE_SIZE;
        &mut self.memory[start..start + PAGE_SIZE]
    }

    /// Claim a free physical frame.
    pub(crate) fn alloc_frame(&mut self) -> Option<usize> {
        let frame = self.frame_map.iter().position(|taken| !taken)?;
        self.frame_map[frame] = true;
        Some(frame)
    }

    pub(crate) fn free_frame(&mut self, frame: usize) {
        assert!(self.frame_map[frame], "freeing frame {frame} twice");
        self.frame_map[frame] = false;
    }

    pub(crate) fn free_frame_count(&self) -> usize {
        self.frame_map.iter().filter(|taken| !**taken).count()
    }

    /// One PC advance: PrevPC ← PC, PC ← NextPC, NextPC ← NextPC + 4.
    pub(crate) fn advance_pc(&mut self) {
        let pc = self.registers[PC_REG];
        self.registers[PREV_PC_REG] = pc;
        let next = self.registers[NEXT_PC_REG];
        self.registers[PC_REG] = next;
        self.registers[NEXT_PC_REG] = next + 4;
    }
}

impl Kernel {
    /// Enter user mode for the current thread: fetch and execute
    /// instructions until the machine halts or the thread exits.
    ///
    /// Every other failure — an unmapped fetch, an instruction outside the
    /// interpreted slice — is fatal: user programs that reach such states
    /// are broken builds, not recoverable conditions.
    pub(crate) fn machine_run(&self) -> RunOutcome {
        loop {
            if self.halted() {
                return RunOutcome::Halted;
            }
            let (pc, instr) = {
                let core = self.core();
                let pc = core.machine.read_register(PC_REG);
                let instr = core.machine.read_mem(pc as usize, 4);
                (pc, instr)
            };
            let instr = instr
                .unwrap_or_else(|| panic!("instruction fetch fault at pc {pc:#x}"))
                as u32;

            match instr {
                OP_SYSCALL => {
                    if exception_handler(self, ExceptionType::Syscall) == Dispatch::Exited {
                        return RunOutcome::Exited;
                    }
                }
                OP_NOP => self.core().machine.advance_pc(),
                unknown => panic!("unknown instruction {unknown:#010x} at pc {pc:#x}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_round_trips_through_identity_translation() {
        let mut m = Machine::new();
        assert!(m.write_mem(0x40, 4, 0x1234_5678));
        assert_eq!(m.read_mem(0x40, 4), Some(0x1234_5678));
        assert_eq!(m.read_mem(0x40, 1), Some(0x78));
        assert_eq!(m.read_mem(0x43, 1), Some(0x12));
    }

    #[test]
    fn out_of_range_addresses_fail_to_translate() {
        let mut m = Machine::new();
        let top = NUM_PHYS_PAGES * PAGE_SIZE;
        assert_eq!(m.read_mem(top, 1), None);
        assert!(!m.write_mem(top - 2, 4, 1));
    }

    #[test]
    fn misaligned_accesses_fail() {
        let m = Machine::new();
        assert_eq!(m.read_mem(0x41, 4), None);
        assert_eq!(m.read_mem(0x42, 4), None);
    }

    #[test]
    fn paged_translation_follows_the_table() {
        let mut m = Machine::new();
        m.page_table = Some(vec![3]);
        assert!(m.write_mem(0x10, 4, 0xabcd));
        assert_eq!(m.read_mem(0x10, 4), Some(0xabcd));
        // The write landed in frame 3, not frame 0.
        assert_eq!(m.memory[3 * PAGE_SIZE + 0x10], 0xcd);
        // Pages beyond the table do not map.
        assert_eq!(m.read_mem(PAGE_SIZE, 1), None);
    }

    #[test]
    fn frames_allocate_and_free() {
        let mut m = Machine::new();
        let before = m.free_frame_count();
        let f = m.alloc_frame().unwrap();
        assert_eq!(m.free_frame_count(), before - 1);
        m.free_frame(f);
        assert_eq!(m.free_frame_count(), before);
    }

    #[test]
    fn advance_pc_shifts_the_three_counters() {
        let mut m = Machine::new();
        m.write_register(PC_REG, 0);
        m.write_register(NEXT_PC_REG, 4);
        m.advance_pc();
        assert_eq!(m.read_register(PREV_PC_REG), 0);
        assert_eq!(m.read_register(PC_REG), 4);
        assert_eq!(m.read_register(NEXT_PC_REG), 8);
    }
}
