//! Matrix copy with optional transpose, `B = alpha * op(A)`
//!
//! The kernel cannot scale, so `alpha` must be exactly 1. It moves 16x16
//! blocks through the VPM. Loads are always
//! horizontal; the store direction selects between a plain copy
//! (horizontal) and a transpose (vertical). Units work on slabs of 16 rows
//! of `A`.

use super::{
    check_extent, strided_extent, DispatchContext, FamilyDescriptor, KernelId, Layout, Operand,
    PartitionPlan, Transpose,
};
use crate::error::{ensure_param, ForgeResult, QpuForgeError};
use crate::memory::SharedBuffer;

const ROUTINE: &str = "somatcopy";

/// Rows of `A` per VPM block
pub const ROW_BLOCK: usize = 16;
/// VPM DMA stride fields are 13 bits wide
const STRIDE_FIELD_MASK: usize = (1 << 13) - 1;

pub const DESCRIPTOR: FamilyDescriptor = FamilyDescriptor {
    name: "omatcopy",
    images: &[KernelId::Somatcopy, KernelId::SomatcopySingle],
    multi_unit_words: 17,
    single_unit_words: 14,
};

/// Arguments of one `somatcopy` call
pub struct OmatcopyArgs<'a> {
    pub layout: Layout,
    pub trans: Transpose,
    pub rows: usize,
    pub cols: usize,
    pub alpha: f32,
    pub a: &'a SharedBuffer,
    pub lda: usize,
    pub b: &'a SharedBuffer,
    pub ldb: usize,
}

impl OmatcopyArgs<'_> {
    fn transposed(&self) -> bool {
        self.trans == Transpose::Trans
    }

    /// Row length of `B`
    fn dst_width(&self) -> usize {
        if self.transposed() {
            self.rows
        } else {
            self.cols
        }
    }

    fn extents(&self) -> ForgeResult<(usize, usize)> {
        let a = strided_extent(ROUTINE, "lda", self.rows, self.lda, self.cols)?;
        let b = if self.transposed() {
            strided_extent(ROUTINE, "ldb", self.cols, self.ldb, self.rows)?
        } else {
            strided_extent(ROUTINE, "ldb", self.rows, self.ldb, self.cols)?
        };
        Ok((a, b))
    }
}

pub fn validate(args: &OmatcopyArgs<'_>) -> ForgeResult<()> {
    if args.layout != Layout::RowMajor {
        return Err(QpuForgeError::UnsupportedLayout {
            routine: ROUTINE,
            detail: "only row-major storage is supported".to_string(),
        });
    }
    ensure_param(
        args.trans != Transpose::ConjTrans,
        ROUTINE,
        "trans",
        "ConjTrans",
        "conjugate transpose is not supported",
    )?;
    ensure_param(
        args.alpha == 1.0,
        ROUTINE,
        "alpha",
        args.alpha,
        "scaling is not supported, must be 1",
    )?;
    ensure_param(
        args.rows >= ROW_BLOCK && args.rows % ROW_BLOCK == 0,
        ROUTINE,
        "rows",
        args.rows,
        "must be a non-zero multiple of 16",
    )?;
    ensure_param(
        args.cols >= 16 && (args.cols - 16) % 32 == 0,
        ROUTINE,
        "cols",
        args.cols,
        "must be 16 + 32 * k",
    )?;
    ensure_param(
        args.lda >= args.cols,
        ROUTINE,
        "lda",
        args.lda,
        format!("must be >= cols ({})", args.cols),
    )?;
    ensure_param(
        args.lda & !STRIDE_FIELD_MASK == 0,
        ROUTINE,
        "lda",
        args.lda,
        "does not fit the 13-bit DMA load stride",
    )?;
    let width = args.dst_width();
    ensure_param(
        args.ldb >= width,
        ROUTINE,
        "ldb",
        args.ldb,
        format!("must be >= {} for {:?}", width, args.trans),
    )?;
    ensure_param(
        (args.ldb - width) & !STRIDE_FIELD_MASK == 0,
        ROUTINE,
        "ldb",
        args.ldb,
        "does not fit the 13-bit DMA store stride",
    )?;

    let (a_elems, b_elems) = args.extents()?;
    check_extent(ROUTINE, "a", args.a, a_elems)?;
    check_extent(ROUTINE, "b", args.b, b_elems)
}

/// VPM DMA setup words shared by every unit of a launch
///
/// Returns `load_setup_0, load_setup_16, store_setup_0, store_setup_16,
/// load_stride, store_stride`.
pub fn dma_setup(lda: usize, ldb: usize, horizontal_store: bool) -> [u32; 6] {
    // DMA load, 32-bit width, rowlen 16, nrows 16, vpitch 1, horizontal
    let load_setup_0 = (1 << 31) | (1 << 12);
    let load_setup_16 = load_setup_0 | (16 << 4);
    // DMA store, 16 units of depth 16
    let store_setup_0 = (2 << 30) | (16 << 23) | (16 << 16) | ((horizontal_store as u32) << 14);
    let store_setup_16 = store_setup_0 | (16 << 7);
    let load_stride = (9 << 28) | (4 * lda) as u32;
    let store_stride = (3 << 30) | (4 * ldb - 4 * 16) as u32;
    [
        load_setup_0,
        load_setup_16,
        store_setup_0,
        store_setup_16,
        load_stride,
        store_stride,
    ]
}

/// Launch a call whose arguments passed [`validate`]
pub(crate) fn run(ctx: &mut DispatchContext<'_>, args: &OmatcopyArgs<'_>) -> ForgeResult<()> {
    let a_bus = ctx.resolve(args.a)?;
    let b_bus = ctx.resolve(args.b)?;

    let plan = PartitionPlan::row_slabs(args.rows, args.cols, ROW_BLOCK);
    let single = plan.is_single_unit();
    let kernel = if single {
        KernelId::SomatcopySingle
    } else {
        KernelId::Somatcopy
    };
    let transposed = args.transposed();
    let unit_count = plan.unit_count() as u32;
    tracing::trace!(
        "somatcopy {}x{} {:?} on {} units",
        args.rows,
        args.cols,
        args.trans,
        unit_count
    );

    let (a_elems, b_elems) = args.extents()?;
    let operands = [Operand::input(args.a, a_elems), Operand::output(args.b, b_elems)];
    let setup = dma_setup(args.lda, args.ldb, !transposed);
    let col_blocks = ((args.cols - 16) / 32) as u32;

    ctx.launch(kernel, &plan, false, &operands, |tile, self_bus| {
        let a_off = tile.row0 * args.lda * 4;
        let b_off = if transposed {
            tile.row0 * 4
        } else {
            tile.row0 * args.ldb * 4
        };
        let mut words = Vec::with_capacity(DESCRIPTOR.multi_unit_words);
        if !single {
            words.push(self_bus);
        }
        words.extend_from_slice(&[
            (tile.rows / ROW_BLOCK) as u32,
            col_blocks,
            a_bus + a_off as u32,
            b_bus + b_off as u32,
            4 * 16,
            (4 * args.lda * 16) as u32,
            4 * 16,
            (4 * args.ldb * 16) as u32,
        ]);
        words.extend_from_slice(&setup);
        if !single {
            words.push(tile.index as u32);
            words.push(unit_count);
        }
        words
    })
}
