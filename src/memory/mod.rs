//! Accelerator-shared memory
//!
//! Memory shared with the QPUs is obtained from the firmware, locked to a
//! fixed bus address and mapped into the process. The [`Allocator`] keeps
//! one record per live allocation so host pointers can be translated into
//! the bus addresses placed in kernel parameter blocks.
//!
//! # Pattern
//!
//! 1. Firmware allocate (size + alignment - 1 bytes) and lock
//! 2. Map the bus range through a [`crate::backend::BusMemory`] backend
//! 3. Align the host pointer; the recorded bus address follows the same offset
//! 4. Free unmaps, unlocks and releases in reverse order

pub mod allocator;
pub mod buffer;

pub use allocator::{AllocationRecord, Allocator};
pub use buffer::SharedBuffer;

/// Page size the firmware allocations and mappings are aligned to
pub const PAGE_SIZE: usize = 4096;

pub(crate) fn align_up(offset: usize, alignment: usize) -> usize {
    (offset + alignment - 1) & !(alignment - 1)
}
