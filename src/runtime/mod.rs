//! Runtime context
//!
//! A [`Runtime`] owns every piece of device state: the firmware channel, the
//! allocator, the launcher, the shared kernel buffers and the kernel images.
//! Subsystems are reference counted so that nested init/finalize pairs only
//! touch the device on the outermost call.
//!
//! # Usage
//! ```ignore
//! let mut rt = Runtime::open_hardware(RuntimeConfig::from_env()?)?;
//! let x = rt.allocate(4096 * 4, 4096)?;
//! let mut y = rt.allocate(4096 * 4, 4096)?;
//! rt.scopy(4096, &x, 1, &mut y, 1)?;
//! rt.free(x)?;
//! rt.free(y)?;
//! rt.shutdown()?;
//! ```

pub mod config;
pub mod lifecycle;
pub mod shared;

pub use config::{RuntimeConfig, TimeoutPolicy};
pub use lifecycle::{LifecycleLedger, Subsystem};
pub use shared::SharedKernelBuffers;

use serde::Serialize;

use crate::backend::{CacheOp, CachePolicy, FirmwareChannel, Platform};
use crate::error::{ForgeResult, QpuForgeError};
use crate::kernels::{
    abs, copy, gemm, omatcopy, DispatchContext, FamilyDescriptor, KernelLibrary, Layout,
    Transpose,
};
use crate::launch::{DispatchList, Launcher};
use crate::memory::{AllocationRecord, Allocator, SharedBuffer};

/// Snapshot of runtime resource usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RuntimeStats {
    /// Live shared-memory allocations, including runtime-owned buffers
    pub live_allocations: usize,
    /// Bytes requested by the live allocations
    pub allocated_bytes: usize,
    pub uniform_buffer_bytes: usize,
    pub code_buffer_bytes: usize,
    /// Successful launches since the runtime was created
    pub launches: u64,
    /// Mailbox property calls since the runtime was created
    pub firmware_calls: u64,
}

/// QPU runtime for one VideoCore device
pub struct Runtime {
    config: RuntimeConfig,
    firmware: FirmwareChannel,
    allocator: Allocator,
    launcher: Launcher,
    shared: SharedKernelBuffers,
    library: KernelLibrary,
    ledger: LifecycleLedger,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("ledger", &self.ledger)
            .field("allocator", &self.allocator)
            .field("kernels", &self.library.len())
            .finish()
    }
}

impl Runtime {
    /// Runtime with no subsystem initialized
    pub fn new(platform: Platform, library: KernelLibrary, config: RuntimeConfig) -> ForgeResult<Self> {
        config.validate()?;
        let (transport, memory) = platform.into_parts();
        Ok(Self {
            allocator: Allocator::new(memory, config.mem_flags, config.cache_policy),
            firmware: FirmwareChannel::new(transport),
            launcher: Launcher::new(),
            shared: SharedKernelBuffers::new(),
            library,
            ledger: LifecycleLedger::new(),
            config,
        })
    }

    /// Runtime with every subsystem initialized, ready for kernel calls
    pub fn open(platform: Platform, library: KernelLibrary, config: RuntimeConfig) -> ForgeResult<Self> {
        let mut runtime = Self::new(platform, library, config)?;
        runtime.init_subsystem(Subsystem::Main)?;
        tracing::info!(
            "Runtime ready: {} kernel images, uniforms {} bytes, code {} bytes",
            runtime.library.len(),
            runtime.shared.allocated().uniform_bytes,
            runtime.shared.allocated().code_bytes
        );
        Ok(runtime)
    }

    /// Open the VideoCore devices named in `config`
    ///
    /// Kernel images come from `config.kernel_dir` when set, otherwise from
    /// the images located at build time.
    pub fn open_hardware(config: RuntimeConfig) -> ForgeResult<Self> {
        let library = match &config.kernel_dir {
            Some(dir) => KernelLibrary::from_dir(dir)?,
            None => KernelLibrary::from_build_env()?,
        };
        let platform = Platform::hardware(&config);
        Self::open(platform, library, config)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn library(&self) -> &KernelLibrary {
        &self.library
    }

    // ========== Lifecycle ==========

    pub fn ref_count(&self, subsystem: Subsystem) -> u32 {
        self.ledger.count(subsystem)
    }

    /// Initialize `subsystem` and its dependencies
    ///
    /// Only the first call touches the device; later calls count.
    pub fn init_subsystem(&mut self, subsystem: Subsystem) -> ForgeResult<()> {
        if self.ledger.is_active(subsystem) {
            self.ledger.acquire(subsystem);
            return Ok(());
        }

        let deps = subsystem.dependencies();
        for (i, dep) in deps.iter().enumerate() {
            if let Err(e) = self.init_subsystem(*dep) {
                self.unwind(&deps[..i]);
                return Err(e);
            }
        }
        if let Err(e) = self.setup(subsystem) {
            tracing::error!("init {} failed: {}", subsystem, e);
            self.unwind(deps);
            return Err(e);
        }
        self.ledger.acquire(subsystem);
        tracing::debug!("{} initialized", subsystem);
        Ok(())
    }

    /// Finalize `subsystem`; the last call tears it and its dependencies down
    pub fn finalize_subsystem(&mut self, subsystem: Subsystem) -> ForgeResult<()> {
        if !self.ledger.release(subsystem)? {
            return Ok(());
        }
        let teardown = self.teardown(subsystem);
        tracing::debug!("{} finalized", subsystem);
        for dep in subsystem.dependencies().iter().rev() {
            self.finalize_subsystem(*dep)?;
        }
        teardown
    }

    /// Finalize the runtime and check that every init had its finalize
    pub fn shutdown(mut self) -> ForgeResult<()> {
        if self.ledger.is_active(Subsystem::Main) {
            self.finalize_subsystem(Subsystem::Main)?;
        }
        self.ledger.ensure_balanced()
    }

    fn unwind(&mut self, initialized: &[Subsystem]) {
        for dep in initialized.iter().rev() {
            if let Err(e) = self.finalize_subsystem(*dep) {
                tracing::warn!("unwinding {}: {}", dep, e);
            }
        }
    }

    fn setup(&mut self, subsystem: Subsystem) -> ForgeResult<()> {
        match subsystem {
            Subsystem::Mailbox => Ok(self.firmware.open()?),
            Subsystem::Memory => self.allocator.open(),
            Subsystem::Launcher => self.launcher.setup(
                &mut self.firmware,
                &mut self.allocator,
                self.config.control_alignment,
            ),
            Subsystem::Main => self.shared.ensure_allocated(
                &mut self.firmware,
                &mut self.allocator,
                self.config.control_alignment,
            ),
            family => {
                let profile = family_descriptor(family)?.profile(&self.library)?;
                self.shared.register(profile);
                Ok(())
            }
        }
    }

    fn teardown(&mut self, subsystem: Subsystem) -> ForgeResult<()> {
        match subsystem {
            Subsystem::Mailbox => Ok(self.firmware.close()?),
            Subsystem::Memory => self.allocator.close(&mut self.firmware),
            Subsystem::Launcher => self.launcher.teardown(&mut self.firmware, &mut self.allocator),
            Subsystem::Main => self.shared.release(&mut self.firmware, &mut self.allocator),
            Subsystem::Gemm | Subsystem::Copy | Subsystem::Omatcopy | Subsystem::Abs => Ok(()),
        }
    }

    // ========== Shared memory ==========

    /// Allocate `size` bytes of shared memory aligned to `alignment`
    pub fn allocate(&mut self, size: usize, alignment: usize) -> ForgeResult<SharedBuffer> {
        self.allocator.allocate(&mut self.firmware, size, alignment)
    }

    pub fn allocate_with_policy(
        &mut self,
        size: usize,
        alignment: usize,
        policy: CachePolicy,
    ) -> ForgeResult<SharedBuffer> {
        self.allocator
            .allocate_with_policy(&mut self.firmware, size, alignment, policy)
    }

    pub fn free(&mut self, buffer: SharedBuffer) -> ForgeResult<()> {
        self.allocator.free(&mut self.firmware, buffer)
    }

    pub fn resolve_bus_address(&self, ptr: *const u8) -> ForgeResult<u32> {
        self.allocator.resolve_bus_address(ptr)
    }

    pub fn cache_maintenance(&mut self, ptr: *const u8, len: usize, op: CacheOp) -> ForgeResult<()> {
        self.allocator.cache_maintenance(ptr, len, op)
    }

    pub fn allocations(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.allocator.records()
    }

    /// Log every live allocation
    pub fn dump_allocated(&self) {
        self.allocator.dump_allocated();
    }

    // ========== Launch ==========

    /// Launch a caller-built dispatch list
    pub fn submit(&mut self, list: &DispatchList, noflush: bool, timeout_ms: u32) -> ForgeResult<()> {
        self.launcher
            .submit(&mut self.firmware, &mut self.allocator, list, noflush, timeout_ms)
    }

    fn dispatch_context(&mut self, family: Subsystem) -> ForgeResult<DispatchContext<'_>> {
        if !self.ledger.is_active(family) {
            return Err(QpuForgeError::NotInitialized(family.name()));
        }
        if !self.launcher.is_ready() {
            return Err(QpuForgeError::NotInitialized(Subsystem::Launcher.name()));
        }
        let (uniforms, code) = self
            .shared
            .buffers_mut()
            .ok_or(QpuForgeError::NotInitialized(Subsystem::Main.name()))?;
        Ok(DispatchContext {
            firmware: &mut self.firmware,
            allocator: &mut self.allocator,
            launcher: &mut self.launcher,
            uniforms,
            code,
            library: &self.library,
            timeouts: self.config.timeouts,
        })
    }

    // ========== Kernels ==========

    /// `C = alpha * op(A) * op(B) + beta * C`
    pub fn sgemm(
        &mut self,
        layout: Layout,
        transa: Transpose,
        transb: Transpose,
        m: usize,
        n: usize,
        k: usize,
        alpha: f32,
        a: &SharedBuffer,
        lda: usize,
        b: &SharedBuffer,
        ldb: usize,
        beta: f32,
        c: &mut SharedBuffer,
        ldc: usize,
    ) -> ForgeResult<()> {
        let args = gemm::SgemmArgs {
            layout,
            transa,
            transb,
            m,
            n,
            k,
            alpha,
            a,
            lda,
            b,
            ldb,
            beta,
            c,
            ldc,
        };
        gemm::validate(&args)?;
        let mut ctx = self.dispatch_context(Subsystem::Gemm)?;
        gemm::run(&mut ctx, &args)
    }

    /// `y = x` for `n` floats
    pub fn scopy(
        &mut self,
        n: usize,
        x: &SharedBuffer,
        incx: isize,
        y: &mut SharedBuffer,
        incy: isize,
    ) -> ForgeResult<()> {
        copy::validate(n, x, incx, y, incy)?;
        let mut ctx = self.dispatch_context(Subsystem::Copy)?;
        copy::run(&mut ctx, n, x, y)
    }

    /// `B = op(A)` for a `rows x cols` matrix `A`; `alpha` must be 1
    pub fn somatcopy(
        &mut self,
        layout: Layout,
        trans: Transpose,
        rows: usize,
        cols: usize,
        alpha: f32,
        a: &SharedBuffer,
        lda: usize,
        b: &mut SharedBuffer,
        ldb: usize,
    ) -> ForgeResult<()> {
        let args = omatcopy::OmatcopyArgs {
            layout,
            trans,
            rows,
            cols,
            alpha,
            a,
            lda,
            b,
            ldb,
        };
        omatcopy::validate(&args)?;
        let mut ctx = self.dispatch_context(Subsystem::Omatcopy)?;
        omatcopy::run(&mut ctx, &args)
    }

    /// `y[i] = |a[i]|` for `n` floats
    pub fn vs_abs(&mut self, n: usize, a: &SharedBuffer, y: &mut SharedBuffer) -> ForgeResult<()> {
        abs::validate(n, a, y)?;
        let mut ctx = self.dispatch_context(Subsystem::Abs)?;
        abs::run(&mut ctx, n, a, y)
    }

    // ========== Diagnostics ==========

    pub fn stats(&self) -> RuntimeStats {
        let buffers = self.shared.allocated();
        RuntimeStats {
            live_allocations: self.allocator.live_allocations(),
            allocated_bytes: self.allocator.allocated_bytes(),
            uniform_buffer_bytes: buffers.uniform_bytes,
            code_buffer_bytes: buffers.code_bytes,
            launches: self.launcher.launch_count(),
            firmware_calls: self.firmware.call_count(),
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let outstanding = self.ledger.outstanding();
        if outstanding.is_empty() {
            return;
        }
        tracing::warn!("Runtime dropped with live subsystems: {:?}", outstanding);
        for subsystem in Subsystem::ALL.iter().rev() {
            if self.ledger.is_active(*subsystem) {
                if let Err(e) = self.teardown(*subsystem) {
                    tracing::warn!("teardown of {} on drop: {}", subsystem, e);
                }
            }
        }
        self.ledger = LifecycleLedger::new();
    }
}

fn family_descriptor(subsystem: Subsystem) -> ForgeResult<&'static FamilyDescriptor> {
    match subsystem {
        Subsystem::Gemm => Ok(&gemm::DESCRIPTOR),
        Subsystem::Copy => Ok(&copy::DESCRIPTOR),
        Subsystem::Omatcopy => Ok(&omatcopy::DESCRIPTOR),
        Subsystem::Abs => Ok(&abs::DESCRIPTOR),
        other => Err(crate::internal_error!("{} is not a kernel family", other)),
    }
}
