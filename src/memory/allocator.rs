//! Firmware-backed shared memory allocator

use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::Arc;

use super::{align_up, SharedBuffer, PAGE_SIZE};
use crate::backend::{BusMemory, CacheOp, CachePolicy, FirmwareChannel, MappedRegion, MemFlags};
use crate::error::{ForgeResult, QpuForgeError};

/// Bookkeeping for one live allocation
#[derive(Debug)]
pub struct AllocationRecord {
    /// Usable size in bytes, as requested
    pub size: usize,
    /// Firmware memory handle
    pub handle: u32,
    /// Bus address matching `cpu_address`
    pub bus_address: u32,
    /// Aligned host address handed to the caller
    pub cpu_address: usize,
    /// Host address of the mapping before alignment
    pub raw_cpu_address: usize,
    /// Bus address returned by the lock request
    pub raw_bus_address: u32,
    region: Arc<MappedRegion>,
}

impl AllocationRecord {
    fn contains(&self, addr: usize, len: usize) -> bool {
        addr >= self.cpu_address && addr + len <= self.cpu_address + self.size
    }

    pub fn cache_policy(&self) -> CachePolicy {
        self.region.policy()
    }
}

/// Shared memory allocator
///
/// Live records are indexed by aligned host address; containment lookups are
/// a range query for the greatest start address not above the pointer.
pub struct Allocator {
    bus: Box<dyn BusMemory>,
    flags: MemFlags,
    default_policy: CachePolicy,
    records: BTreeMap<usize, AllocationRecord>,
    open: bool,
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("flags", &self.flags)
            .field("default_policy", &self.default_policy)
            .field("live_allocations", &self.records.len())
            .field("open", &self.open)
            .finish()
    }
}

impl Allocator {
    pub fn new(bus: Box<dyn BusMemory>, flags: MemFlags, default_policy: CachePolicy) -> Self {
        Self {
            bus,
            flags,
            default_policy,
            records: BTreeMap::new(),
            open: false,
        }
    }

    pub fn open(&mut self) -> ForgeResult<()> {
        self.bus.open()?;
        self.open = true;
        Ok(())
    }

    /// Release everything still allocated and close the mapper
    pub fn close(&mut self, firmware: &mut FirmwareChannel) -> ForgeResult<()> {
        if !self.records.is_empty() {
            tracing::warn!(
                "Allocator::close: releasing {} allocations that were never freed",
                self.records.len()
            );
            self.dump_allocated();
        }
        let mut first_error = None;
        while let Some((_, record)) = self.records.pop_first() {
            if let Err(e) = Self::release(firmware, record) {
                first_error.get_or_insert(e);
            }
        }
        self.bus.close()?;
        self.open = false;
        first_error.map_or(Ok(()), Err)
    }

    pub fn default_policy(&self) -> CachePolicy {
        self.default_policy
    }

    /// Allocate `size` bytes aligned to `alignment` with the default cache policy
    pub fn allocate(
        &mut self,
        firmware: &mut FirmwareChannel,
        size: usize,
        alignment: usize,
    ) -> ForgeResult<SharedBuffer> {
        self.allocate_with_policy(firmware, size, alignment, self.default_policy)
    }

    pub fn allocate_with_policy(
        &mut self,
        firmware: &mut FirmwareChannel,
        size: usize,
        alignment: usize,
        policy: CachePolicy,
    ) -> ForgeResult<SharedBuffer> {
        if size == 0 {
            return Err(crate::param_error!("allocate", "size", size, "must be non-zero"));
        }
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(crate::param_error!(
                "allocate",
                "alignment",
                alignment,
                "must be a power of two"
            ));
        }
        if !self.open {
            return Err(QpuForgeError::NotInitialized("memory"));
        }
        // f32/u32 views need at least word alignment
        let alignment = alignment.max(4);
        let alloc_size = size
            .checked_add(alignment - 1)
            .filter(|s| *s <= u32::MAX as usize)
            .ok_or_else(|| {
                QpuForgeError::AllocationFailed(format!(
                    "{} bytes aligned to {} exceeds the 32-bit bus space",
                    size, alignment
                ))
            })?;

        tracing::trace!(
            "Allocator::allocate: size={} alignment={} alloc_size={} policy={:?}",
            size,
            alignment,
            alloc_size,
            policy
        );

        let handle = firmware
            .allocate_memory(alloc_size as u32, PAGE_SIZE as u32, self.flags)
            .map_err(|e| self.fail(format!("firmware allocation of {} bytes: {}", alloc_size, e)))?;

        let raw_bus = match firmware.lock_memory(handle) {
            Ok(bus) => bus,
            Err(e) => {
                if let Err(release) = firmware.release_memory(handle) {
                    tracing::warn!("Allocator::allocate: releasing handle {} failed: {}", handle, release);
                }
                return Err(self.fail(format!("locking handle {}: {}", handle, e)));
            }
        };

        let map_len = align_up(alloc_size, PAGE_SIZE);
        let region = match self.bus.map(raw_bus, map_len, policy) {
            Ok(region) => Arc::new(region),
            Err(e) => {
                if let Err(unlock) = firmware.unlock_memory(raw_bus) {
                    tracing::warn!("Allocator::allocate: unlocking {:#x} failed: {}", raw_bus, unlock);
                }
                if let Err(release) = firmware.release_memory(handle) {
                    tracing::warn!("Allocator::allocate: releasing handle {} failed: {}", handle, release);
                }
                tracing::error!("Allocator::allocate: mapping {:#x} failed", raw_bus);
                self.dump_allocated();
                return Err(e);
            }
        };

        let raw_cpu = region.as_ptr() as usize;
        let cpu = align_up(raw_cpu, alignment);
        let offset = cpu - raw_cpu;
        let bus_address = raw_bus + offset as u32;
        let ptr = NonNull::new(cpu as *mut u8)
            .ok_or_else(|| crate::internal_error!("mapping returned a null pointer"))?;

        tracing::debug!(
            "Allocator::allocate: {} bytes at cpu={:#x} bus={:#x} (handle {})",
            size,
            cpu,
            bus_address,
            handle
        );

        self.records.insert(
            cpu,
            AllocationRecord {
                size,
                handle,
                bus_address,
                cpu_address: cpu,
                raw_cpu_address: raw_cpu,
                raw_bus_address: raw_bus,
                region: region.clone(),
            },
        );
        Ok(SharedBuffer::new(ptr, size, bus_address, region))
    }

    /// Return `buffer` to the firmware
    pub fn free(&mut self, firmware: &mut FirmwareChannel, buffer: SharedBuffer) -> ForgeResult<()> {
        self.free_ptr(firmware, buffer.as_ptr())
    }

    /// Free the allocation starting at `ptr`
    ///
    /// `ptr` must be the address returned by an allocation; anything else,
    /// including a second free of the same address, is an error.
    pub fn free_ptr(&mut self, firmware: &mut FirmwareChannel, ptr: *const u8) -> ForgeResult<()> {
        let record = match self.records.remove(&(ptr as usize)) {
            Some(record) => record,
            None => {
                tracing::error!("Allocator::free: {:p} is not a live allocation", ptr);
                self.dump_allocated();
                return Err(QpuForgeError::UnknownPointer {
                    ptr: ptr as usize,
                    operation: "free",
                });
            }
        };
        tracing::debug!(
            "Allocator::free: {} bytes at cpu={:#x} (handle {})",
            record.size,
            record.cpu_address,
            record.handle
        );
        Self::release(firmware, record)
    }

    fn release(firmware: &mut FirmwareChannel, record: AllocationRecord) -> ForgeResult<()> {
        let AllocationRecord {
            handle,
            raw_bus_address,
            region,
            ..
        } = record;
        // Unmap first; a caller still holding the handle keeps its own mapping
        drop(region);
        firmware.unlock_memory(raw_bus_address)?;
        firmware.release_memory(handle)?;
        Ok(())
    }

    fn record_containing(&self, addr: usize, len: usize) -> Option<&AllocationRecord> {
        self.records
            .range(..=addr)
            .next_back()
            .map(|(_, record)| record)
            .filter(|record| record.contains(addr, len))
    }

    /// Bus address of any byte inside a live allocation
    pub fn resolve_bus_address(&self, ptr: *const u8) -> ForgeResult<u32> {
        let addr = ptr as usize;
        match self.record_containing(addr, 1) {
            Some(record) => Ok(record.bus_address + (addr - record.cpu_address) as u32),
            None => {
                tracing::error!("Allocator::resolve_bus_address: {:p} is not allocated", ptr);
                self.dump_allocated();
                Err(QpuForgeError::UnknownPointer {
                    ptr: addr,
                    operation: "resolve",
                })
            }
        }
    }

    /// Synchronize the host cache for `len` bytes at `ptr`
    ///
    /// The whole range must lie inside one live allocation.
    pub fn cache_maintenance(&mut self, ptr: *const u8, len: usize, op: CacheOp) -> ForgeResult<()> {
        let addr = ptr as usize;
        let (region, offset) = match self.record_containing(addr, len.max(1)) {
            Some(record) => (record.region.clone(), addr - record.raw_cpu_address),
            None => {
                self.dump_allocated();
                return Err(QpuForgeError::UnknownPointer {
                    ptr: addr,
                    operation: "cache maintenance",
                });
            }
        };
        tracing::trace!("Allocator::cache_maintenance: {:?} {:#x}+{}", op, addr, len);
        self.bus.sync(&region, offset, len, op)
    }

    pub fn live_allocations(&self) -> usize {
        self.records.len()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.records.values().map(|r| r.size).sum()
    }

    pub fn records(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.records.values()
    }

    /// Log every live allocation
    pub fn dump_allocated(&self) {
        tracing::error!("Live shared allocations: {}", self.records.len());
        for (i, record) in self.records.values().enumerate() {
            tracing::error!(
                "  [{}] cpu={:#x} raw={:#x} bus={:#x} size={} handle={} policy={:?}",
                i,
                record.cpu_address,
                record.raw_cpu_address,
                record.bus_address,
                record.size,
                record.handle,
                record.cache_policy()
            );
        }
    }

    fn fail(&self, msg: String) -> QpuForgeError {
        tracing::error!("Allocator: {}", msg);
        self.dump_allocated();
        QpuForgeError::AllocationFailed(msg)
    }
}
