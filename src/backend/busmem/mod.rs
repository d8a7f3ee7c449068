//! Mapping of GPU bus memory into the host address space
//!
//! The allocator obtains memory from the firmware as bus addresses; a
//! [`BusMemory`] backend makes those ranges addressable from the CPU and
//! performs the cache maintenance needed to share them with the QPUs.

mod devmem;

use std::any::Any;
use std::ptr::NonNull;

use serde::{Deserialize, Serialize};

use crate::error::ForgeResult;

pub use devmem::{DevMemMapper, DEFAULT_DEVMEM_PATH};

/// Whether the CPU mapping of an allocation goes through the data cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    /// Cached mapping; every kernel call is bracketed by clean/invalidate
    #[default]
    Cached,
    /// Uncached mapping; never holds stale lines
    Uncached,
}

/// Cache maintenance direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheOp {
    /// Write dirty lines back so the device sees host writes
    Clean,
    /// Drop lines so the host sees device writes
    Invalidate,
}

/// Host mapping of a contiguous bus range
///
/// The backing object (a memory map or simulated storage) is owned by the
/// region, so the pointer stays valid for as long as the region lives.
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
    bus_address: u32,
    policy: CachePolicy,
    _backing: Box<dyn Any + Send + Sync>,
}

// SAFETY: MappedRegion only hands out its pointer; the memory behind it is
// owned by `_backing` which is itself Send + Sync. Host access is serialized
// by the runtime's `&mut self` API.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Wrap a mapping
    ///
    /// # Safety
    /// `ptr` must point to `len` bytes that stay valid and writable for as
    /// long as `backing` is alive.
    pub unsafe fn new(
        ptr: NonNull<u8>,
        len: usize,
        bus_address: u32,
        policy: CachePolicy,
        backing: Box<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            ptr,
            len,
            bus_address,
            policy,
            _backing: backing,
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bus_address(&self) -> u32 {
        self.bus_address
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("bus_address", &format_args!("{:#x}", self.bus_address))
            .field("policy", &self.policy)
            .finish()
    }
}

/// Backend that maps bus ranges and maintains caches for them
pub trait BusMemory: Send {
    fn open(&mut self) -> ForgeResult<()>;

    fn close(&mut self) -> ForgeResult<()>;

    /// Map `len` bytes starting at `bus_address`
    fn map(&mut self, bus_address: u32, len: usize, policy: CachePolicy)
        -> ForgeResult<MappedRegion>;

    /// Synchronize `len` bytes at `offset` inside `region`
    fn sync(
        &mut self,
        region: &MappedRegion,
        offset: usize,
        len: usize,
        op: CacheOp,
    ) -> ForgeResult<()>;
}
