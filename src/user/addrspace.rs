//! User address spaces.
//!
//! An address space owns the physical frames backing a user program: the
//! image pages plus a fixed stack region above them. The loader here takes
//! the executable as a raw image placed at virtual address 0 — the richer
//! object-format parsing lives outside the core.

use log::debug;
use thiserror::Error;

use crate::config::{PAGE_SIZE, USER_STACK_PAGES};
use crate::fs::OpenFile;
use crate::machine::{Machine, NEXT_PC_REG, NUM_TOTAL_REGS, PC_REG};

/// Stack-pointer register in the user calling convention.
const SP_REG: usize = 29;

/// Errors constructing an address space.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("executable \"{0}\" not found")]
    NotFound(String),
    #[error("executable image is empty")]
    EmptyImage,
    #[error("out of physical frames: need {needed}, have {available}")]
    OutOfFrames { needed: usize, available: usize },
}

/// A user program's memory: a linear page table over the machine's physical
/// frames.
pub(crate) struct AddrSpace {
    page_table: Vec<usize>,
    num_pages: usize,
}

impl AddrSpace {
    /// Build an address space for `executable`: allocate frames for the
    /// image and the user stack, zero them, and copy the image in at
    /// virtual address 0.
    pub(crate) fn new(executable: &OpenFile, machine: &mut Machine) -> Result<Self, ExecError> {
        let image_size = executable.len();
        if image_size == 0 {
            return Err(ExecError::EmptyImage);
        }
        let image_pages = image_size.div_ceil(PAGE_SIZE);
        let num_pages = image_pages + USER_STACK_PAGES;

        let available = machine.free_frame_count();
        if num_pages > available {
            return Err(ExecError::OutOfFrames {
                needed: num_pages,
                available,
            });
        }

        let mut page_table = Vec::with_capacity(num_pages);
        for _ in 0..num_pages {
            // Checked above; the frame map is only touched here and in
            // free_frames.
            let frame = machine.alloc_frame().expect("frame map changed underfoot");
            machine.physical_mut(frame).fill(0);
            page_table.push(frame);
        }

        for (vpage, &frame) in page_table.iter().take(image_pages).enumerate() {
            let offset = vpage * PAGE_SIZE;
            executable.read_at(offset, machine.physical_mut(frame));
        }

        debug!(
            "initialized address space: {image_pages} image pages + {USER_STACK_PAGES} stack pages"
        );
        Ok(AddrSpace {
            page_table,
            num_pages,
        })
    }

    /// Set the machine registers for a fresh run of the program: everything
    /// zero, PC at the entry point, SP just under the top of the stack with
    /// a little headroom for the startup convention.
    pub(crate) fn init_registers(&self, machine: &mut Machine) {
        for reg in 0..NUM_TOTAL_REGS {
            machine.write_register(reg, 0);
        }
        machine.write_register(PC_REG, 0);
        machine.write_register(NEXT_PC_REG, 4);
        let stack_top = self.num_pages * PAGE_SIZE - 16;
        machine.write_register(SP_REG, stack_top as i32);
        debug!("initialized user registers, stack pointer {stack_top:#x}");
    }

    /// Stash machine-side translation state on a context switch away from
    /// this space. The linear table has nothing to stash.
    pub(crate) fn save_state(&self, _machine: &Machine) {}

    /// Reinstall this space's translation on the machine.
    pub(crate) fn restore_state(&self, machine: &mut Machine) {
        machine.page_table = Some(self.page_table.clone());
    }

    /// Return every frame to the machine. Called when the owning thread's
    /// carcass is reclaimed.
    pub(crate) fn free_frames(&self, machine: &mut Machine) {
        for &frame in &self.page_table {
            machine.free_frame(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FileSystem;

    fn space_for(image: &[u8]) -> (AddrSpace, Machine) {
        let fs = FileSystem::new();
        fs.preload("prog", image.to_vec());
        let file = fs.open("prog").unwrap();
        let mut machine = Machine::new();
        let space = AddrSpace::new(&file, &mut machine).unwrap();
        (space, machine)
    }

    #[test]
    fn image_is_loaded_at_virtual_zero() {
        let (space, mut machine) = space_for(&[0xde, 0xad, 0xbe, 0xef]);
        space.restore_state(&mut machine);
        assert_eq!(machine.read_mem(0, 4), Some(u32::from_le_bytes([0xde, 0xad, 0xbe, 0xef]) as i32));
    }

    #[test]
    fn frames_cover_image_plus_stack_and_come_back() {
        let image = vec![1u8; PAGE_SIZE * 2 + 1];
        let (space, mut machine) = space_for(&image);
        let expected = 3 + USER_STACK_PAGES;
        assert_eq!(machine.free_frame_count(), crate::config::NUM_PHYS_PAGES - expected);
        space.free_frames(&mut machine);
        assert_eq!(machine.free_frame_count(), crate::config::NUM_PHYS_PAGES);
    }

    #[test]
    fn init_registers_sets_pc_chain_and_stack() {
        let (space, mut machine) = space_for(&[0; 8]);
        space.init_registers(&mut machine);
        assert_eq!(machine.read_register(PC_REG), 0);
        assert_eq!(machine.read_register(NEXT_PC_REG), 4);
        let top = (1 + USER_STACK_PAGES) * PAGE_SIZE - 16;
        assert_eq!(machine.read_register(SP_REG), top as i32);
    }

    #[test]
    fn empty_image_is_rejected() {
        let fs = FileSystem::new();
        fs.preload("empty", Vec::new());
        let file = fs.open("empty").unwrap();
        let mut machine = Machine::new();
        assert!(matches!(
            AddrSpace::new(&file, &mut machine),
            Err(ExecError::EmptyImage)
        ));
    }

    #[test]
    fn frame_exhaustion_is_reported() {
        let fs = FileSystem::new();
        let huge = vec![0u8; PAGE_SIZE * crate::config::NUM_PHYS_PAGES];
        fs.preload("huge", huge);
        let file = fs.open("huge").unwrap();
        let mut machine = Machine::new();
        assert!(matches!(
            AddrSpace::new(&file, &mut machine),
            Err(ExecError::OutOfFrames { .. })
        ));
    }
}
