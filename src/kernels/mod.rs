//! QPU kernel families
//!
//! Each family validates its arguments, partitions the work, writes one
//! parameter block per unit into the shared uniforms buffer, stages its code
//! image and submits the launch:
//! - `gemm`: single-precision matrix multiply
//! - `copy`: vector copy
//! - `omatcopy`: scaled matrix transpose-copy
//! - `abs`: element-wise absolute value

pub mod abs;
pub mod copy;
pub mod gemm;
pub mod image;
pub mod omatcopy;
pub mod partition;

pub use image::{KernelId, KernelImage, KernelLibrary};
pub use partition::{PartitionPlan, Tile, TileGranularity};

use crate::backend::{CacheOp, FirmwareChannel};
use crate::error::ForgeResult;
use crate::launch::{DispatchList, Launcher, MAX_UNITS};
use crate::memory::{Allocator, SharedBuffer};
use crate::runtime::TimeoutPolicy;

/// Storage order of a matrix argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    RowMajor,
    ColMajor,
}

/// Orientation of a matrix argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transpose {
    NoTrans,
    Trans,
    ConjTrans,
}

/// Shared-buffer requirement of a kernel family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelProfile {
    pub uniform_bytes: usize,
    pub code_bytes: usize,
}

impl KernelProfile {
    pub fn max(self, other: KernelProfile) -> KernelProfile {
        KernelProfile {
            uniform_bytes: self.uniform_bytes.max(other.uniform_bytes),
            code_bytes: self.code_bytes.max(other.code_bytes),
        }
    }
}

/// Static description of a kernel family
#[derive(Debug, Clone, Copy)]
pub struct FamilyDescriptor {
    pub name: &'static str,
    pub images: &'static [KernelId],
    /// Words in the parameter block of one unit of a parallel launch
    pub multi_unit_words: usize,
    /// Words in the parameter block of a single-unit launch
    pub single_unit_words: usize,
}

impl FamilyDescriptor {
    /// Buffer sizes this family needs; every image must be present
    pub fn profile(&self, library: &KernelLibrary) -> ForgeResult<KernelProfile> {
        let uniform_words = (self.multi_unit_words * MAX_UNITS).max(self.single_unit_words);
        Ok(KernelProfile {
            uniform_bytes: uniform_words * 4,
            code_bytes: library.max_code_bytes(self.images)?,
        })
    }
}

/// A buffer a launch reads or writes, with the number of bytes touched
pub(crate) struct Operand<'b> {
    pub buffer: &'b SharedBuffer,
    pub bytes: usize,
    pub output: bool,
}

impl<'b> Operand<'b> {
    pub fn input(buffer: &'b SharedBuffer, elems: usize) -> Self {
        Self {
            buffer,
            bytes: elems * 4,
            output: false,
        }
    }

    pub fn output(buffer: &'b SharedBuffer, elems: usize) -> Self {
        Self {
            buffer,
            bytes: elems * 4,
            output: true,
        }
    }
}

/// Everything a kernel family needs from the runtime for one launch
pub(crate) struct DispatchContext<'a> {
    pub firmware: &'a mut FirmwareChannel,
    pub allocator: &'a mut Allocator,
    pub launcher: &'a mut Launcher,
    pub uniforms: &'a mut SharedBuffer,
    pub code: &'a mut SharedBuffer,
    pub library: &'a KernelLibrary,
    pub timeouts: TimeoutPolicy,
}

impl DispatchContext<'_> {
    /// Bus address of an operand; the buffer must be a live allocation
    pub fn resolve(&self, buffer: &SharedBuffer) -> ForgeResult<u32> {
        self.allocator.resolve_bus_address(buffer.as_ptr())
    }

    /// Stage `kernel`, write one parameter block per tile and run the launch
    ///
    /// `block` receives the tile and the bus address its block will live at.
    /// Operands are cleaned before submission and outputs invalidated after.
    pub fn launch<F>(
        &mut self,
        kernel: KernelId,
        plan: &PartitionPlan,
        noflush: bool,
        operands: &[Operand<'_>],
        mut block: F,
    ) -> ForgeResult<()>
    where
        F: FnMut(&Tile, u32) -> Vec<u32>,
    {
        let library = self.library;
        let image = library.get(kernel)?;
        if image.code_bytes() > self.code.len() {
            return Err(crate::internal_error!(
                "code buffer of {} bytes cannot hold {} ({} bytes)",
                self.code.len(),
                kernel,
                image.code_bytes()
            ));
        }
        self.code.as_u32_mut()[..image.words().len()].copy_from_slice(image.words());
        let code_bus = self.code.bus_address();

        let uniforms_bus = self.uniforms.bus_address();
        let capacity = self.uniforms.len() / 4;
        let mut list = DispatchList::new();
        let mut used = 0;
        for tile in plan.tiles() {
            let block_bus = uniforms_bus + (used * 4) as u32;
            let words = block(tile, block_bus);
            if used + words.len() > capacity {
                return Err(crate::internal_error!(
                    "uniforms buffer of {} words overflows at unit {} of {}",
                    capacity,
                    tile.index,
                    kernel
                ));
            }
            self.uniforms.as_u32_mut()[used..used + words.len()].copy_from_slice(&words);
            list.push(block_bus, code_bus)?;
            used += words.len();
        }

        self.allocator
            .cache_maintenance(self.uniforms.as_ptr(), used * 4, CacheOp::Clean)?;
        self.allocator
            .cache_maintenance(self.code.as_ptr(), image.code_bytes(), CacheOp::Clean)?;
        for operand in operands {
            self.allocator
                .cache_maintenance(operand.buffer.as_ptr(), operand.bytes, CacheOp::Clean)?;
        }

        let timeout = self.timeouts.for_units(plan.unit_count());
        tracing::debug!(
            "launch {}: {} units, {} uniform words, timeout {}ms",
            kernel,
            list.len(),
            used,
            timeout
        );
        self.launcher
            .submit(self.firmware, self.allocator, &list, noflush, timeout)?;

        for operand in operands.iter().filter(|o| o.output) {
            self.allocator.cache_maintenance(
                operand.buffer.as_ptr(),
                operand.bytes,
                CacheOp::Invalidate,
            )?;
        }
        Ok(())
    }
}

/// Floats spanned by `lines` lines of `width` elements, `ld` apart
///
/// Fails on `param` when the span or the byte stride `4 * ld` does not fit
/// the 32-bit bus offsets the kernels use.
pub(crate) fn strided_extent(
    routine: &'static str,
    param: &'static str,
    lines: usize,
    ld: usize,
    width: usize,
) -> ForgeResult<usize> {
    const BUS_LIMIT: usize = u32::MAX as usize;
    crate::error::ensure_param(
        ld <= BUS_LIMIT / 4,
        routine,
        param,
        ld,
        "byte stride does not fit in 32 bits",
    )?;
    lines
        .saturating_sub(1)
        .checked_mul(ld)
        .and_then(|span| span.checked_add(width))
        .filter(|&elems| elems <= BUS_LIMIT / 4)
        .ok_or_else(|| {
            crate::param_error!(
                routine,
                param,
                ld,
                "{} lines of {} floats overflow the 32-bit bus range",
                lines,
                width
            )
        })
}

/// Check that `buffer` holds at least `elems` f32 values
pub(crate) fn check_extent(
    routine: &'static str,
    param: &'static str,
    buffer: &SharedBuffer,
    elems: usize,
) -> ForgeResult<()> {
    crate::error::ensure_param(
        buffer.len_f32() >= elems,
        routine,
        param,
        format!("{} floats", buffer.len_f32()),
        format!("buffer must hold at least {} floats", elems),
    )
}
