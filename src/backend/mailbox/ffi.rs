//! VideoCore mailbox property interface constants
//!
//! Tag values, status words, memory flags and the ioctl request number are
//! firmware ABI and must stay bit exact.

use std::ffi::c_char;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// Request code placed in word 1 of a property buffer
pub const MBOX_PROCESS_REQUEST: u32 = 0x0000_0000;
/// Response code: request processed successfully
pub const MBOX_SUCCESS: u32 = 0x8000_0000;
/// Response code: error parsing the request buffer
pub const MBOX_ERROR: u32 = 0x8000_0001;
/// Terminating tag
pub const MBOX_END_TAG: u32 = 0x0000_0000;
/// Set by the firmware in the tag's request/response length word
pub const MBOX_RESPONSE_BIT: u32 = 0x8000_0000;

pub const TAG_ALLOCATE_MEMORY: u32 = 0x0003_000c;
pub const TAG_LOCK_MEMORY: u32 = 0x0003_000d;
pub const TAG_UNLOCK_MEMORY: u32 = 0x0003_000e;
pub const TAG_RELEASE_MEMORY: u32 = 0x0003_000f;
pub const TAG_EXECUTE_QPU: u32 = 0x0003_0011;
pub const TAG_SET_ENABLE_QPU: u32 = 0x0003_0012;

/// Major number of the vcio character device
pub const VCIO_MAJOR_NUM: u32 = 100;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

/// Linux `_IOWR(ty, nr, size)`
pub const fn iowr(ty: u32, nr: u32, size: usize) -> u32 {
    ((IOC_READ | IOC_WRITE) << 30) | ((size as u32 & 0x3fff) << 16) | (ty << 8) | nr
}

/// `_IOWR(100, 0, char *)`
pub const IOCTL_MBOX_PROPERTY: u32 = iowr(VCIO_MAJOR_NUM, 0, std::mem::size_of::<*mut c_char>());

/// Alias bits selecting the cache behaviour of a bus address
pub const BUS_ALIAS_MASK: u32 = 0xC000_0000;

/// Convert a VideoCore bus address into an ARM physical address
pub const fn bus_to_phys(bus: u32) -> u32 {
    bus & !BUS_ALIAS_MASK
}

/// Flags for `TAG_ALLOCATE_MEMORY`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemFlags(u32);

impl MemFlags {
    /// Can be resized to 0 at any time
    pub const DISCARDABLE: MemFlags = MemFlags(1 << 0);
    /// Normal allocating alias
    pub const NORMAL: MemFlags = MemFlags(0 << 2);
    /// 0xC alias, uncached
    pub const DIRECT: MemFlags = MemFlags(1 << 2);
    /// 0x8 alias, non-allocating in L2 but coherent
    pub const COHERENT: MemFlags = MemFlags(1 << 3);
    /// Allocating in L2
    pub const L1_NONALLOCATING: MemFlags = MemFlags((1 << 2) | (1 << 3));
    /// Initialise buffer to all zeros
    pub const ZERO: MemFlags = MemFlags(1 << 4);
    /// Don't initialise (default is initialise to all ones)
    pub const NO_INIT: MemFlags = MemFlags(1 << 5);
    /// Likely to be locked for long periods of time
    pub const HINT_PERMALOCK: MemFlags = MemFlags(1 << 6);

    pub const fn from_bits(bits: u32) -> Self {
        MemFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: MemFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MemFlags {
    type Output = MemFlags;

    fn bitor(self, rhs: MemFlags) -> MemFlags {
        MemFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for MemFlags {
    fn bitor_assign(&mut self, rhs: MemFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for MemFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
