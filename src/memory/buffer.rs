//! Host handle to one shared allocation

use std::ptr::NonNull;
use std::sync::Arc;

use crate::backend::{CachePolicy, MappedRegion};
use crate::error::{ForgeResult, QpuForgeError};

/// One live shared-memory allocation, as seen by the caller
///
/// The handle keeps its host mapping alive, so the slice views are always
/// backed by mapped memory. Returning the memory to the firmware goes through
/// [`crate::runtime::Runtime::free`], which consumes the handle.
pub struct SharedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    bus_address: u32,
    region: Arc<MappedRegion>,
}

// SAFETY: SharedBuffer owns its view of the mapping exclusively (it is not
// Clone) and the mapping itself is Send + Sync.
unsafe impl Send for SharedBuffer {}
unsafe impl Sync for SharedBuffer {}

impl SharedBuffer {
    pub(crate) fn new(
        ptr: NonNull<u8>,
        len: usize,
        bus_address: u32,
        region: Arc<MappedRegion>,
    ) -> Self {
        Self {
            ptr,
            len,
            bus_address,
            region,
        }
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of whole f32 elements
    pub fn len_f32(&self) -> usize {
        self.len / 4
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Bus address of the first byte
    pub fn bus_address(&self) -> u32 {
        self.bus_address
    }

    pub fn cache_policy(&self) -> CachePolicy {
        self.region.policy()
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: ptr..ptr+len lies inside the mapping kept alive by `region`
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; &mut self guarantees exclusive host access
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_u32(&self) -> &[u32] {
        // SAFETY: allocations are at least 4-byte aligned
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const u32, self.len / 4) }
    }

    pub fn as_u32_mut(&mut self) -> &mut [u32] {
        // SAFETY: allocations are at least 4-byte aligned
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut u32, self.len / 4) }
    }

    pub fn as_f32(&self) -> &[f32] {
        // SAFETY: allocations are at least 4-byte aligned
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const f32, self.len / 4) }
    }

    pub fn as_f32_mut(&mut self) -> &mut [f32] {
        // SAFETY: allocations are at least 4-byte aligned
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut f32, self.len / 4) }
    }

    /// Copy `data` to the start of the buffer
    pub fn copy_from_f32(&mut self, data: &[f32]) -> ForgeResult<()> {
        if data.len() > self.len_f32() {
            return Err(QpuForgeError::AllocationFailed(format!(
                "source of {} floats does not fit a buffer of {} bytes",
                data.len(),
                self.len
            )));
        }
        self.as_f32_mut()[..data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("bus_address", &format_args!("{:#x}", self.bus_address))
            .finish()
    }
}
