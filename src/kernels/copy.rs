//! Vector copy, `y = x`

use super::{check_extent, DispatchContext, FamilyDescriptor, KernelId, Operand, PartitionPlan};
use crate::error::{ensure_param, ForgeResult};
use crate::memory::SharedBuffer;

const ROUTINE: &str = "scopy";

/// Floats per partition chunk
pub const CHUNK: usize = 4096;
/// Floats per block in the kernel's count field
pub const BLOCK: usize = 1024;

pub const DESCRIPTOR: FamilyDescriptor = FamilyDescriptor {
    name: "copy",
    images: &[KernelId::Scopy, KernelId::ScopySingle],
    multi_unit_words: 6,
    single_unit_words: 3,
};

pub fn validate(n: usize, x: &SharedBuffer, incx: isize, y: &SharedBuffer, incy: isize) -> ForgeResult<()> {
    ensure_param(incx == 1, ROUTINE, "incx", incx, "only unit stride is supported")?;
    ensure_param(incy == 1, ROUTINE, "incy", incy, "only unit stride is supported")?;
    ensure_param(n >= CHUNK, ROUTINE, "n", n, format!("must be >= {}", CHUNK))?;
    ensure_param(n % CHUNK == 0, ROUTINE, "n", n, format!("must be a multiple of {}", CHUNK))?;
    check_extent(ROUTINE, "x", x, n)?;
    check_extent(ROUTINE, "y", y, n)
}

/// Launch a copy whose arguments passed [`validate`]
pub(crate) fn run(
    ctx: &mut DispatchContext<'_>,
    n: usize,
    x: &SharedBuffer,
    y: &SharedBuffer,
) -> ForgeResult<()> {
    let x_bus = ctx.resolve(x)?;
    let y_bus = ctx.resolve(y)?;

    let plan = PartitionPlan::linear(n, CHUNK, 1);
    let single = plan.is_single_unit();
    let kernel = if single { KernelId::ScopySingle } else { KernelId::Scopy };
    let unit_count = plan.unit_count() as u32;
    tracing::trace!("scopy n={} on {} units", n, unit_count);

    let operands = [Operand::input(x, n), Operand::output(y, n)];
    ctx.launch(kernel, &plan, true, &operands, |tile, self_bus| {
        let blocks = (tile.cols / BLOCK) as u32 - 1;
        let offset = (tile.col0 * 4) as u32;
        if single {
            vec![blocks, x_bus, y_bus]
        } else {
            vec![
                self_bus,
                blocks,
                x_bus + offset,
                y_bus + offset,
                tile.index as u32,
                unit_count,
            ]
        }
    })
}
