//! In-process VideoCore simulator
//!
//! [`SimulatedDevice`] answers mailbox property requests the way the firmware
//! does, backs GPU allocations with host memory and executes launches by
//! matching the staged code against registered [`KernelEmulator`]s. All
//! clones share one device state, so a test can hand a [`Platform`] to a
//! runtime and keep a handle for inspection.

mod emulators;
mod memory;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use rayon::prelude::*;

use crate::backend::busmem::{BusMemory, CacheOp, CachePolicy, MappedRegion};
use crate::backend::mailbox::ffi::{
    MBOX_ERROR, MBOX_PROCESS_REQUEST, MBOX_RESPONSE_BIT, MBOX_SUCCESS, TAG_ALLOCATE_MEMORY,
    TAG_EXECUTE_QPU, TAG_LOCK_MEMORY, TAG_RELEASE_MEMORY, TAG_SET_ENABLE_QPU, TAG_UNLOCK_MEMORY,
};
use crate::backend::mailbox::{FirmwareTransport, MailboxError, MailboxResult};
use crate::backend::Platform;
use crate::error::{ForgeResult, QpuForgeError};
use crate::kernels::{KernelId, KernelImage, KernelLibrary};

pub use emulators::{KernelEmulator, OmatcopyEmulator, SgemmEmulator, VectorEmulator, VectorOp};
pub use memory::DeviceMemory;

use memory::SimStorage;

/// First bus address handed out; 0xC alias like `MEM_FLAG_DIRECT` memory
const BUS_BASE: u32 = 0xC010_0000;
const PAGE: u32 = 4096;
/// Return value of `execute_qpu` when a unit failed
const EXECUTE_FAILED: u32 = 0x0000_0010;

/// Failure raised by a kernel emulator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct EmulationError(pub String);

/// Something the simulated device observed, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    MailboxOpened,
    MailboxClosed,
    MemoryOpened,
    MemoryClosed,
    Property { tag: u32 },
    CacheSync { op: CacheOp, bus: u32, len: usize },
    Executed { units: u32, noflush: bool, timeout_ms: u32 },
}

/// Call counters of the simulated device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub property_calls: u64,
    pub allocations: u64,
    pub releases: u64,
    pub qpu_enables: u64,
    pub qpu_disables: u64,
    pub executions: u64,
    pub units_launched: u64,
    pub cache_cleans: u64,
    pub cache_invalidates: u64,
    pub live_blocks: usize,
    pub live_bytes: usize,
}

/// One-shot response override for the next request carrying a tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Replace the buffer status word
    Status(u32),
    /// Succeed at the protocol level but return this value in word 0
    Return(u32),
}

struct SimBlock {
    size: usize,
    bus: u32,
    locked: bool,
    storage: Arc<SimStorage>,
}

struct SimState {
    mailbox_open: bool,
    memory_open: bool,
    qpu_enabled: bool,
    capacity: usize,
    next_handle: u32,
    next_bus: u32,
    blocks: BTreeMap<u32, SimBlock>,
    kernels: Vec<(Vec<u32>, Arc<dyn KernelEmulator>)>,
    faults: HashMap<u32, Fault>,
    stats: SimStats,
    events: Vec<SimEvent>,
    last_error: Option<EmulationError>,
}

impl SimState {
    fn new(capacity: usize) -> Self {
        Self {
            mailbox_open: false,
            memory_open: false,
            qpu_enabled: false,
            capacity,
            next_handle: 1,
            next_bus: BUS_BASE,
            blocks: BTreeMap::new(),
            kernels: Vec::new(),
            faults: HashMap::new(),
            stats: SimStats::default(),
            events: Vec::new(),
            last_error: None,
        }
    }

    fn live_bytes(&self) -> usize {
        self.blocks.values().map(|b| b.size).sum()
    }

    fn block_by_bus(&self, bus: u32) -> Option<(&u32, &SimBlock)> {
        self.blocks
            .iter()
            .find(|(_, b)| bus >= b.bus && ((bus - b.bus) as usize) < b.storage.len())
    }

    fn allocate(&mut self, size: u32, align: u32) -> u32 {
        let size = size as usize;
        if size == 0 || self.live_bytes() + size > self.capacity {
            return 0;
        }
        let align = align.max(PAGE);
        if !align.is_power_of_two() {
            return 0;
        }
        let rounded = (size + PAGE as usize - 1) & !(PAGE as usize - 1);
        let bus = (self.next_bus + align - 1) & !(align - 1);
        let Some(next) = bus.checked_add(rounded as u32) else {
            return 0;
        };
        let Some(storage) = SimStorage::new(rounded, PAGE as usize) else {
            return 0;
        };
        self.next_bus = next;

        let handle = self.next_handle;
        self.next_handle += 1;
        self.blocks.insert(
            handle,
            SimBlock {
                size,
                bus,
                locked: false,
                storage,
            },
        );
        self.stats.allocations += 1;
        handle
    }

    fn lock(&mut self, handle: u32) -> u32 {
        match self.blocks.get_mut(&handle) {
            Some(block) => {
                block.locked = true;
                block.bus
            }
            None => 0,
        }
    }

    fn unlock(&mut self, bus: u32) -> u32 {
        match self.blocks.values_mut().find(|b| b.bus == bus && b.locked) {
            Some(block) => {
                block.locked = false;
                0
            }
            None => 1,
        }
    }

    fn release(&mut self, handle: u32) -> u32 {
        match self.blocks.get(&handle) {
            Some(block) if !block.locked => {
                self.blocks.remove(&handle);
                self.stats.releases += 1;
                0
            }
            _ => 1,
        }
    }

    fn set_enable(&mut self, enable: u32) -> u32 {
        self.qpu_enabled = enable != 0;
        if self.qpu_enabled {
            self.stats.qpu_enables += 1;
        } else {
            self.stats.qpu_disables += 1;
        }
        0
    }

    fn device_memory(&self) -> DeviceMemory {
        let mut memory = DeviceMemory::new();
        for block in self.blocks.values().filter(|b| b.locked) {
            memory.add_region(block.bus, block.storage.len(), block.storage.clone());
        }
        memory
    }

    fn execute(&mut self, num_qpus: u32, control: u32, noflush: u32, timeout_ms: u32) -> u32 {
        self.events.push(SimEvent::Executed {
            units: num_qpus,
            noflush: noflush != 0,
            timeout_ms,
        });
        self.stats.executions += 1;

        if !self.qpu_enabled {
            self.last_error = Some(EmulationError("QPUs are not enabled".to_string()));
            return EXECUTE_FAILED;
        }
        if num_qpus == 0 || num_qpus > 12 {
            self.last_error = Some(EmulationError(format!("{} units requested", num_qpus)));
            return EXECUTE_FAILED;
        }

        let memory = self.device_memory();
        let units = match self.resolve_units(&memory, num_qpus, control) {
            Ok(units) => units,
            Err(err) => {
                tracing::error!("SimulatedDevice: {}", err);
                self.last_error = Some(err);
                return EXECUTE_FAILED;
            }
        };

        let result = units
            .par_iter()
            .try_for_each(|(kernel, uniforms)| kernel.run(&memory, *uniforms));
        self.stats.units_launched += num_qpus as u64;

        match result {
            Ok(()) => 0,
            Err(err) => {
                tracing::error!("SimulatedDevice: kernel failed: {}", err);
                self.last_error = Some(err);
                EXECUTE_FAILED
            }
        }
    }

    fn resolve_units(
        &self,
        memory: &DeviceMemory,
        num_qpus: u32,
        control: u32,
    ) -> Result<Vec<(Arc<dyn KernelEmulator>, u32)>, EmulationError> {
        let entries = memory.read_words(control, num_qpus as usize * 2)?;
        entries
            .chunks_exact(2)
            .map(|pair| {
                let (uniforms, code) = (pair[0], pair[1]);
                let kernel = self
                    .kernels
                    .iter()
                    .find(|(words, _)| {
                        memory
                            .read_words(code, words.len())
                            .map(|staged| staged == *words)
                            .unwrap_or(false)
                    })
                    .map(|(_, kernel)| kernel.clone())
                    .ok_or_else(|| {
                        EmulationError(format!("no kernel matches code at {:#x}", code))
                    })?;
                Ok((kernel, uniforms))
            })
            .collect()
    }

    fn handle_property(&mut self, buffer: &mut [u32]) -> MailboxResult<()> {
        let tag = buffer.get(2).copied().unwrap_or(0);
        if buffer.len() < 6
            || buffer[0] as usize != buffer.len() * 4
            || buffer[1] != MBOX_PROCESS_REQUEST
        {
            return Err(MailboxError::MalformedResponse {
                tag,
                reason: "request buffer header is inconsistent".to_string(),
            });
        }
        let words = buffer[3] as usize / 4;
        if 5 + words >= buffer.len() {
            return Err(MailboxError::MalformedResponse {
                tag,
                reason: format!("payload of {} words overruns the buffer", words),
            });
        }

        self.stats.property_calls += 1;
        self.events.push(SimEvent::Property { tag });

        let payload = &mut buffer[5..5 + words];
        if let Some(fault) = self.faults.remove(&tag) {
            match fault {
                Fault::Status(status) => {
                    buffer[1] = status;
                    return Ok(());
                }
                Fault::Return(value) => {
                    if let Some(word) = payload.first_mut() {
                        *word = value;
                    }
                    buffer[1] = MBOX_SUCCESS;
                    buffer[4] = MBOX_RESPONSE_BIT | 4;
                    return Ok(());
                }
            }
        }

        let arg = |i: usize| payload.get(i).copied().unwrap_or(0);
        let (result, expected_words) = match tag {
            TAG_ALLOCATE_MEMORY => (self.allocate(arg(0), arg(1)), 3),
            TAG_LOCK_MEMORY => (self.lock(arg(0)), 1),
            TAG_UNLOCK_MEMORY => (self.unlock(arg(0)), 1),
            TAG_RELEASE_MEMORY => (self.release(arg(0)), 1),
            TAG_SET_ENABLE_QPU => (self.set_enable(arg(0)), 1),
            TAG_EXECUTE_QPU => (self.execute(arg(0), arg(1), arg(2), arg(3)), 4),
            _ => {
                buffer[1] = MBOX_ERROR;
                return Ok(());
            }
        };
        if words < expected_words {
            buffer[1] = MBOX_ERROR;
            return Ok(());
        }

        buffer[5] = result;
        buffer[1] = MBOX_SUCCESS;
        buffer[4] = MBOX_RESPONSE_BIT | 4;
        Ok(())
    }
}

/// Simulated VideoCore: firmware mailbox, bus memory and QPUs
#[derive(Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<SimState>>,
}

impl std::fmt::Debug for SimulatedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedDevice")
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDevice {
    /// Device with 256 MiB of GPU memory, the largest split on a Pi
    pub fn new() -> Self {
        Self::with_capacity(256 << 20)
    }

    /// Device whose allocations fail once `capacity` bytes are live
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new(capacity))),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        // A panicking emulator must not hide the device from later inspection
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mailbox transport and bus memory sharing this device
    pub fn platform(&self) -> Platform {
        Platform::new(Box::new(self.clone()), Box::new(self.clone()))
    }

    /// Register `emulator` for launches whose staged code starts with `image`
    pub fn register_kernel(&self, image: &KernelImage, emulator: Arc<dyn KernelEmulator>) {
        self.state()
            .kernels
            .push((image.words().to_vec(), emulator));
    }

    /// Synthetic images for every kernel, each registered with its emulator
    pub fn kernel_library(&self) -> KernelLibrary {
        let mut library = KernelLibrary::new();
        for id in KernelId::ALL {
            // Distinct signature per image, padded to a realistic length
            let mut words = vec![0x5150_5500 | id as u32, 0xe002_4c67];
            words.extend((0..30u32).map(|i| 0x1002_0827 ^ (i << 8) ^ id as u32));
            words.push(0x3000_9037);
            if let Ok(image) = KernelImage::new(id, words) {
                self.register_kernel(&image, emulator_for(id));
                library.insert(image);
            }
        }
        library
    }

    /// Make the next request carrying `tag` fail with `fault`
    pub fn inject_fault(&self, tag: u32, fault: Fault) {
        self.state().faults.insert(tag, fault);
    }

    pub fn stats(&self) -> SimStats {
        let state = self.state();
        SimStats {
            live_blocks: state.blocks.len(),
            live_bytes: state.live_bytes(),
            ..state.stats
        }
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.state().events.clone()
    }

    pub fn clear_events(&self) {
        self.state().events.clear();
    }

    pub fn qpu_enabled(&self) -> bool {
        self.state().qpu_enabled
    }

    pub fn mailbox_open(&self) -> bool {
        self.state().mailbox_open
    }

    pub fn memory_open(&self) -> bool {
        self.state().memory_open
    }

    /// Why the last failed execution failed
    pub fn last_error(&self) -> Option<EmulationError> {
        self.state().last_error.clone()
    }
}

/// Emulator implementing the ABI of each kernel image
pub fn emulator_for(id: KernelId) -> Arc<dyn KernelEmulator> {
    match id {
        KernelId::Sgemm => Arc::new(SgemmEmulator::new(false, false)),
        KernelId::SgemmSingle => Arc::new(SgemmEmulator::new(false, true)),
        KernelId::SgemmTransposed => Arc::new(SgemmEmulator::new(true, false)),
        KernelId::SgemmTransposedSingle => Arc::new(SgemmEmulator::new(true, true)),
        KernelId::Scopy => Arc::new(VectorEmulator::new(VectorOp::Copy, 1024, false)),
        KernelId::ScopySingle => Arc::new(VectorEmulator::new(VectorOp::Copy, 1024, true)),
        KernelId::Somatcopy => Arc::new(OmatcopyEmulator::new(false)),
        KernelId::SomatcopySingle => Arc::new(OmatcopyEmulator::new(true)),
        KernelId::Sabs => Arc::new(VectorEmulator::new(VectorOp::Abs, 768, false)),
        KernelId::SabsSingle => Arc::new(VectorEmulator::new(VectorOp::Abs, 768, true)),
    }
}

impl FirmwareTransport for SimulatedDevice {
    fn open(&mut self) -> MailboxResult<()> {
        let mut state = self.state();
        state.mailbox_open = true;
        state.events.push(SimEvent::MailboxOpened);
        Ok(())
    }

    fn close(&mut self) -> MailboxResult<()> {
        let mut state = self.state();
        state.mailbox_open = false;
        state.events.push(SimEvent::MailboxClosed);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state().mailbox_open
    }

    fn exchange(&mut self, buffer: &mut [u32]) -> MailboxResult<()> {
        let mut state = self.state();
        if !state.mailbox_open {
            return Err(MailboxError::NotOpen);
        }
        state.handle_property(buffer)
    }
}

impl BusMemory for SimulatedDevice {
    fn open(&mut self) -> ForgeResult<()> {
        let mut state = self.state();
        state.memory_open = true;
        state.events.push(SimEvent::MemoryOpened);
        Ok(())
    }

    fn close(&mut self) -> ForgeResult<()> {
        let mut state = self.state();
        state.memory_open = false;
        state.events.push(SimEvent::MemoryClosed);
        Ok(())
    }

    fn map(
        &mut self,
        bus_address: u32,
        len: usize,
        policy: CachePolicy,
    ) -> ForgeResult<MappedRegion> {
        let state = self.state();
        if !state.memory_open {
            return Err(QpuForgeError::MappingFailed("bus memory is not open".to_string()));
        }
        let (_, block) = state.block_by_bus(bus_address).ok_or_else(|| {
            QpuForgeError::MappingFailed(format!("bus address {:#x} is not allocated", bus_address))
        })?;
        let offset = (bus_address - block.bus) as usize;
        if offset + len > block.storage.len() {
            return Err(QpuForgeError::MappingFailed(format!(
                "mapping {:#x}+{} overruns its allocation",
                bus_address, len
            )));
        }
        let storage = block.storage.clone();
        // SAFETY: offset + len is inside the storage block
        let ptr = unsafe { storage.as_ptr().add(offset) };
        let ptr = std::ptr::NonNull::new(ptr)
            .ok_or_else(|| QpuForgeError::MappingFailed("null storage".to_string()))?;
        // SAFETY: the Arc moved into the region keeps the storage alive
        Ok(unsafe { MappedRegion::new(ptr, len, bus_address, policy, Box::new(storage)) })
    }

    fn sync(
        &mut self,
        region: &MappedRegion,
        offset: usize,
        len: usize,
        op: CacheOp,
    ) -> ForgeResult<()> {
        let mut state = self.state();
        match op {
            CacheOp::Clean => state.stats.cache_cleans += 1,
            CacheOp::Invalidate => state.stats.cache_invalidates += 1,
        }
        state.events.push(SimEvent::CacheSync {
            op,
            bus: region.bus_address() + offset as u32,
            len,
        });
        Ok(())
    }
}
