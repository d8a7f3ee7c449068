//! Element-wise absolute value, `y[i] = |a[i]|`

use super::{check_extent, DispatchContext, FamilyDescriptor, KernelId, Operand, PartitionPlan};
use crate::error::{ensure_param, ForgeResult};
use crate::memory::SharedBuffer;

const ROUTINE: &str = "vs_abs";

/// Floats per chunk: three 16x16 VPM blocks
pub const CHUNK: usize = 3 * 16 * 16;

pub const DESCRIPTOR: FamilyDescriptor = FamilyDescriptor {
    name: "abs",
    images: &[KernelId::Sabs, KernelId::SabsSingle],
    multi_unit_words: 6,
    single_unit_words: 3,
};

pub fn validate(n: usize, a: &SharedBuffer, y: &SharedBuffer) -> ForgeResult<()> {
    ensure_param(n > CHUNK, ROUTINE, "n", n, format!("must be > {}", CHUNK))?;
    ensure_param(n % CHUNK == 0, ROUTINE, "n", n, format!("must be a multiple of {}", CHUNK))?;
    check_extent(ROUTINE, "a", a, n)?;
    check_extent(ROUTINE, "y", y, n)
}

pub(crate) fn run(
    ctx: &mut DispatchContext<'_>,
    n: usize,
    a: &SharedBuffer,
    y: &SharedBuffer,
) -> ForgeResult<()> {
    let a_bus = ctx.resolve(a)?;
    let y_bus = ctx.resolve(y)?;

    // Every unit streams at least two chunks
    let plan = PartitionPlan::linear(n, CHUNK, 2);
    let single = plan.is_single_unit();
    let kernel = if single { KernelId::SabsSingle } else { KernelId::Sabs };
    let unit_count = plan.unit_count() as u32;
    tracing::trace!("vs_abs n={} on {} units", n, unit_count);

    let operands = [Operand::input(a, n), Operand::output(y, n)];
    ctx.launch(kernel, &plan, false, &operands, |tile, self_bus| {
        let chunks = (tile.cols / CHUNK) as u32 - 1;
        let offset = (tile.col0 * 4) as u32;
        if single {
            vec![chunks, a_bus, y_bus]
        } else {
            vec![
                self_bus,
                chunks,
                a_bus + offset,
                y_bus + offset,
                tile.index as u32,
                unit_count,
            ]
        }
    })
}
