//! Single-precision matrix multiply
//!
//! `C = alpha * op(A) * op(B) + beta * C` for row-major operands where both
//! `op`s are the identity or both are the transpose. The output is cut into a
//! 2-D grid of tiles; each unit multiplies a band of `op(A)` rows with a band
//! of `op(B)` columns.

use super::{
    check_extent, strided_extent, DispatchContext, FamilyDescriptor, KernelId, Layout, Operand,
    PartitionPlan, TileGranularity, Transpose,
};
use crate::error::{ensure_param, ForgeResult, QpuForgeError};
use crate::memory::SharedBuffer;

const ROUTINE: &str = "sgemm";

pub const DESCRIPTOR: FamilyDescriptor = FamilyDescriptor {
    name: "gemm",
    images: &[
        KernelId::Sgemm,
        KernelId::SgemmSingle,
        KernelId::SgemmTransposed,
        KernelId::SgemmTransposedSingle,
    ],
    multi_unit_words: 14,
    single_unit_words: 12,
};

/// Tile granularity of the `NoTrans x NoTrans` kernel
pub const GRANULARITY_NN: TileGranularity = TileGranularity::new(16, 64);
/// Tile granularity of the `Trans x Trans` kernel
pub const GRANULARITY_TT: TileGranularity = TileGranularity::new(64, 16);

/// Arguments of one `sgemm` call
pub struct SgemmArgs<'a> {
    pub layout: Layout,
    pub transa: Transpose,
    pub transb: Transpose,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub alpha: f32,
    pub a: &'a SharedBuffer,
    pub lda: usize,
    pub b: &'a SharedBuffer,
    pub ldb: usize,
    pub beta: f32,
    pub c: &'a SharedBuffer,
    pub ldc: usize,
}

impl SgemmArgs<'_> {
    /// Floats of A, B and C the call touches
    fn extents(&self, transposed: bool) -> ForgeResult<(usize, usize, usize)> {
        let (m, n, k) = (self.m, self.n, self.k);
        let (a, b) = if transposed {
            (
                strided_extent(ROUTINE, "lda", k, self.lda, m)?,
                strided_extent(ROUTINE, "ldb", n, self.ldb, k)?,
            )
        } else {
            (
                strided_extent(ROUTINE, "lda", m, self.lda, k)?,
                strided_extent(ROUTINE, "ldb", k, self.ldb, n)?,
            )
        };
        let c = strided_extent(ROUTINE, "ldc", m, self.ldc, n)?;
        Ok((a, b, c))
    }
}

/// Check every argument; returns whether the transposed kernels apply
pub fn validate(args: &SgemmArgs<'_>) -> ForgeResult<bool> {
    if args.layout != Layout::RowMajor {
        return Err(QpuForgeError::UnsupportedLayout {
            routine: ROUTINE,
            detail: "only row-major storage is supported".to_string(),
        });
    }
    for (param, trans) in [("transa", args.transa), ("transb", args.transb)] {
        ensure_param(
            trans != Transpose::ConjTrans,
            ROUTINE,
            param,
            "ConjTrans",
            "conjugate transpose is not supported",
        )?;
    }
    let transposed = match (args.transa, args.transb) {
        (Transpose::NoTrans, Transpose::NoTrans) => false,
        (Transpose::Trans, Transpose::Trans) => true,
        (a, b) => {
            return Err(QpuForgeError::UnsupportedLayout {
                routine: ROUTINE,
                detail: format!("{:?} x {:?} is not supported, both operands must agree", a, b),
            })
        }
    };

    ensure_param(args.m >= 1, ROUTINE, "m", args.m, "must be >= 1")?;
    ensure_param(args.n >= 1, ROUTINE, "n", args.n, "must be >= 1")?;
    ensure_param(args.k >= 2, ROUTINE, "k", args.k, "must be >= 2")?;
    if transposed {
        ensure_param(args.lda >= args.m, ROUTINE, "lda", args.lda, format!("must be >= m ({})", args.m))?;
        ensure_param(args.ldb >= args.k, ROUTINE, "ldb", args.ldb, format!("must be >= k ({})", args.k))?;
    } else {
        ensure_param(args.lda >= args.k, ROUTINE, "lda", args.lda, format!("must be >= k ({})", args.k))?;
        ensure_param(args.ldb >= args.n, ROUTINE, "ldb", args.ldb, format!("must be >= n ({})", args.n))?;
    }
    ensure_param(args.ldc >= args.n, ROUTINE, "ldc", args.ldc, format!("must be >= n ({})", args.n))?;

    let (a_elems, b_elems, c_elems) = args.extents(transposed)?;
    check_extent(ROUTINE, "a", args.a, a_elems)?;
    check_extent(ROUTINE, "b", args.b, b_elems)?;
    check_extent(ROUTINE, "c", args.c, c_elems)?;
    Ok(transposed)
}

/// Launch a call whose arguments passed [`validate`]
pub(crate) fn run(ctx: &mut DispatchContext<'_>, args: &SgemmArgs<'_>) -> ForgeResult<()> {
    let transposed = args.transa == Transpose::Trans;
    let a_bus = ctx.resolve(args.a)?;
    let b_bus = ctx.resolve(args.b)?;
    let c_bus = ctx.resolve(args.c)?;

    let granularity = if transposed { GRANULARITY_TT } else { GRANULARITY_NN };
    let plan = PartitionPlan::grid(args.m, args.n, granularity);
    let kernel = match (transposed, plan.is_single_unit()) {
        (false, false) => KernelId::Sgemm,
        (false, true) => KernelId::SgemmSingle,
        (true, false) => KernelId::SgemmTransposed,
        (true, true) => KernelId::SgemmTransposedSingle,
    };
    tracing::trace!(
        "sgemm {}x{}x{} transposed={} on {} units",
        args.m,
        args.n,
        args.k,
        transposed,
        plan.unit_count()
    );

    let (a_elems, b_elems, c_elems) = args.extents(transposed)?;
    let operands = [
        Operand::input(args.a, a_elems),
        Operand::input(args.b, b_elems),
        Operand::output(args.c, c_elems),
    ];
    let strides = [
        (args.lda * 4) as u32,
        (args.ldb * 4) as u32,
        (args.ldc * 4) as u32,
    ];
    let scalars = [args.alpha.to_bits(), args.beta.to_bits()];
    let unit_count = plan.unit_count() as u32;
    let single = plan.is_single_unit();
    let k = args.k as u32;

    ctx.launch(kernel, &plan, true, &operands, |tile, self_bus| {
        let (a_off, b_off) = if transposed {
            (tile.row0 * 4, tile.col0 * args.ldb * 4)
        } else {
            (tile.row0 * args.lda * 4, tile.col0 * 4)
        };
        let c_off = (tile.row0 * args.ldc + tile.col0) * 4;
        let mut words = vec![
            self_bus,
            tile.rows as u32,
            k,
            tile.cols as u32,
            a_bus + a_off as u32,
            b_bus + b_off as u32,
            c_bus + c_off as u32,
        ];
        words.extend_from_slice(&strides);
        words.extend_from_slice(&scalars);
        if !single {
            words.push(tile.index as u32);
            words.push(unit_count);
        }
        words
    })
}
