//! Kernel-wide constants.

/// Number of scheduling priorities. Valid priorities are `0..MAX_PRIORITY`,
/// higher is better.
pub const MAX_PRIORITY: usize = 8;

/// Slots in each thread's file-descriptor table, including the two console
/// descriptors.
pub const FD_TABLE_SIZE: usize = 16;

/// Descriptor reserved for console input.
pub const CONSOLE_INPUT: i32 = 0;

/// Descriptor reserved for console output.
pub const CONSOLE_OUTPUT: i32 = 1;

/// Size of a simulated physical page in bytes.
pub const PAGE_SIZE: usize = 128;

/// Number of physical page frames in the simulated machine.
pub const NUM_PHYS_PAGES: usize = 64;

/// Pages reserved for a user program's stack, above its image.
pub const USER_STACK_PAGES: usize = 8;

/// Word written at the edge of every thread's stack region; a dispatch with a
/// different value there is a stack overflow.
pub const STACK_FENCEPOST: u32 = 0xdead_beef;

/// Upper bound on NUL-terminated strings copied in from user space.
pub const MAX_SYSCALL_STRING: usize = 256;
