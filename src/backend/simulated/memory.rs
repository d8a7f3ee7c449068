//! Storage and bus-address view of simulated GPU memory

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

use super::EmulationError;

/// Page-aligned, zero-initialized heap block standing in for GPU memory
pub(crate) struct SimStorage {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the storage is a plain heap block; concurrent access is
// coordinated by the runtime (host side) and by disjoint kernel tiles
// (device side), exactly as for real shared memory.
unsafe impl Send for SimStorage {}
unsafe impl Sync for SimStorage {}

impl SimStorage {
    pub(crate) fn new(len: usize, align: usize) -> Option<Arc<Self>> {
        let layout = Layout::from_size_align(len.max(1), align).ok()?;
        // SAFETY: layout has a non-zero size
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        NonNull::new(raw).map(|ptr| Arc::new(Self { ptr, layout }))
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for SimStorage {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

struct DeviceRegion {
    bus: u32,
    len: usize,
    storage: Arc<SimStorage>,
}

/// What a QPU sees: every locked allocation addressed by bus address
///
/// Built once per execution from the live allocations. Accessors check that
/// the whole requested range lies inside one allocation, so an emulator
/// reading a wrong address from a parameter block fails instead of touching
/// unrelated memory.
pub struct DeviceMemory {
    regions: Vec<DeviceRegion>,
}

impl DeviceMemory {
    pub(crate) fn new() -> Self {
        Self { regions: Vec::new() }
    }

    pub(crate) fn add_region(&mut self, bus: u32, len: usize, storage: Arc<SimStorage>) {
        let at = self.regions.partition_point(|r| r.bus < bus);
        self.regions.insert(at, DeviceRegion { bus, len, storage });
    }

    fn locate(&self, bus: u32, bytes: usize) -> Result<*mut u8, EmulationError> {
        let idx = self.regions.partition_point(|r| r.bus <= bus);
        let region = idx
            .checked_sub(1)
            .map(|i| &self.regions[i])
            .ok_or_else(|| EmulationError(format!("bus address {:#x} is not mapped", bus)))?;
        let offset = (bus - region.bus) as usize;
        if offset + bytes > region.len {
            return Err(EmulationError(format!(
                "range {:#x}+{} overruns allocation at {:#x} ({} bytes)",
                bus, bytes, region.bus, region.len
            )));
        }
        debug_assert!(region.len <= region.storage.len());
        // SAFETY: offset + bytes is inside the storage block
        Ok(unsafe { region.storage.as_ptr().add(offset) })
    }

    pub fn read_u32(&self, bus: u32) -> Result<u32, EmulationError> {
        let ptr = self.locate(bus, 4)?;
        // SAFETY: locate checked the range
        Ok(unsafe { (ptr as *const u32).read_unaligned() })
    }

    pub fn read_words(&self, bus: u32, count: usize) -> Result<Vec<u32>, EmulationError> {
        let ptr = self.locate(bus, count * 4)? as *const u32;
        // SAFETY: locate checked the range
        Ok((0..count)
            .map(|i| unsafe { ptr.add(i).read_unaligned() })
            .collect())
    }

    /// Base pointer of `count` f32 elements starting at `bus`
    pub fn f32_span(&self, bus: u32, count: usize) -> Result<*mut f32, EmulationError> {
        if bus % 4 != 0 {
            return Err(EmulationError(format!("bus address {:#x} is not word aligned", bus)));
        }
        Ok(self.locate(bus, count * 4)? as *mut f32)
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }
}
