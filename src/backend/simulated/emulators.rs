//! Host-side stand-ins for the QPU kernel images
//!
//! Each emulator decodes the parameter block a unit receives and performs
//! the work that unit's kernel would do on its tile. Decoding is strict: a
//! wrong self address, inconsistent thread fields or an out-of-range operand
//! address fails the execution.

use super::memory::DeviceMemory;
use super::EmulationError;

/// One unit's kernel, executed against simulated device memory
pub trait KernelEmulator: Send + Sync {
    fn name(&self) -> &str;

    /// Run the unit whose parameter block starts at `uniforms`
    fn run(&self, memory: &DeviceMemory, uniforms: u32) -> Result<(), EmulationError>;
}

fn fail<T>(kernel: &str, msg: impl std::fmt::Display) -> Result<T, EmulationError> {
    Err(EmulationError(format!("{}: {}", kernel, msg)))
}

fn check_self_address(kernel: &str, word: u32, uniforms: u32) -> Result<(), EmulationError> {
    if word != uniforms {
        return fail(
            kernel,
            format!("self address {:#x} does not match block at {:#x}", word, uniforms),
        );
    }
    Ok(())
}

fn check_thread(kernel: &str, index: u32, count: u32) -> Result<(), EmulationError> {
    if count == 0 || count > 12 || index >= count {
        return fail(kernel, format!("thread {} of {} is out of range", index, count));
    }
    Ok(())
}

fn stride_elems(kernel: &str, bytes: u32) -> Result<usize, EmulationError> {
    if bytes % 4 != 0 {
        return fail(kernel, format!("stride {} is not a multiple of 4 bytes", bytes));
    }
    Ok((bytes / 4) as usize)
}

/// Matrix multiply, C = alpha * op(A) * op(B) + beta * C on one tile
pub struct SgemmEmulator {
    name: &'static str,
    transposed: bool,
    single_unit: bool,
}

impl SgemmEmulator {
    pub fn new(transposed: bool, single_unit: bool) -> Self {
        let name = match (transposed, single_unit) {
            (false, false) => "sgemm",
            (false, true) => "sgemm_1th",
            (true, false) => "sgemm_tt",
            (true, true) => "sgemm_tt_1th",
        };
        Self {
            name,
            transposed,
            single_unit,
        }
    }
}

impl KernelEmulator for SgemmEmulator {
    fn name(&self) -> &str {
        self.name
    }

    fn run(&self, memory: &DeviceMemory, uniforms: u32) -> Result<(), EmulationError> {
        let words = memory.read_words(uniforms, if self.single_unit { 12 } else { 14 })?;
        check_self_address(self.name, words[0], uniforms)?;
        if !self.single_unit {
            check_thread(self.name, words[12], words[13])?;
        }

        let (p, q, r) = (words[1] as usize, words[2] as usize, words[3] as usize);
        let (a_bus, b_bus, c_bus) = (words[4], words[5], words[6]);
        let sa = stride_elems(self.name, words[7])?;
        let sb = stride_elems(self.name, words[8])?;
        let sc = stride_elems(self.name, words[9])?;
        let alpha = f32::from_bits(words[10]);
        let beta = f32::from_bits(words[11]);
        if p == 0 || q == 0 || r == 0 {
            return fail(self.name, format!("empty tile {}x{}x{}", p, q, r));
        }

        // Element (i, k) of op(A) and (k, j) of op(B) as offsets from the base
        let (a_extent, b_extent) = if self.transposed {
            ((q - 1) * sa + p, (r - 1) * sb + q)
        } else {
            ((p - 1) * sa + q, (q - 1) * sb + r)
        };
        let a_ptr = memory.f32_span(a_bus, a_extent)?;
        let b_ptr = memory.f32_span(b_bus, b_extent)?;
        let c_ptr = memory.f32_span(c_bus, (p - 1) * sc + r)?;

        // SAFETY: spans were bounds-checked above; inputs are only read
        let a = unsafe { std::slice::from_raw_parts(a_ptr as *const f32, a_extent) };
        let b = unsafe { std::slice::from_raw_parts(b_ptr as *const f32, b_extent) };

        let mut row = vec![0f32; r];
        for i in 0..p {
            row.iter_mut().for_each(|x| *x = 0.0);
            for k in 0..q {
                let aik = if self.transposed { a[k * sa + i] } else { a[i * sa + k] };
                if self.transposed {
                    for (j, acc) in row.iter_mut().enumerate() {
                        *acc += aik * b[j * sb + k];
                    }
                } else {
                    let b_row = &b[k * sb..k * sb + r];
                    for (acc, bkj) in row.iter_mut().zip(b_row) {
                        *acc += aik * bkj;
                    }
                }
            }
            for (j, acc) in row.iter().enumerate() {
                // SAFETY: (i, j) lies inside the checked C span; tiles of one
                // launch cover disjoint parts of C
                unsafe {
                    let cij = c_ptr.add(i * sc + j);
                    cij.write(alpha * acc + beta * cij.read());
                }
            }
        }
        Ok(())
    }
}

/// Element-wise vector operation supported by [`VectorEmulator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorOp {
    Copy,
    Abs,
}

/// Streaming vector kernel processing `count + 1` fixed-size blocks
pub struct VectorEmulator {
    name: &'static str,
    op: VectorOp,
    block_elems: usize,
    single_unit: bool,
}

impl VectorEmulator {
    pub fn new(op: VectorOp, block_elems: usize, single_unit: bool) -> Self {
        let name = match (op, single_unit) {
            (VectorOp::Copy, false) => "scopy",
            (VectorOp::Copy, true) => "scopy_1th",
            (VectorOp::Abs, false) => "sabs",
            (VectorOp::Abs, true) => "sabs_1th",
        };
        Self {
            name,
            op,
            block_elems,
            single_unit,
        }
    }
}

impl KernelEmulator for VectorEmulator {
    fn name(&self) -> &str {
        self.name
    }

    fn run(&self, memory: &DeviceMemory, uniforms: u32) -> Result<(), EmulationError> {
        let (count, src_bus, dst_bus) = if self.single_unit {
            let w = memory.read_words(uniforms, 3)?;
            (w[0], w[1], w[2])
        } else {
            let w = memory.read_words(uniforms, 6)?;
            check_self_address(self.name, w[0], uniforms)?;
            check_thread(self.name, w[4], w[5])?;
            (w[1], w[2], w[3])
        };

        let n = (count as usize + 1) * self.block_elems;
        let src = memory.f32_span(src_bus, n)?;
        let dst = memory.f32_span(dst_bus, n)?;
        for i in 0..n {
            // SAFETY: both spans hold n elements
            unsafe {
                match self.op {
                    VectorOp::Copy => {
                        let bits = (src.add(i) as *const u32).read();
                        (dst.add(i) as *mut u32).write(bits);
                    }
                    VectorOp::Abs => dst.add(i).write(src.add(i).read().abs()),
                }
            }
        }
        Ok(())
    }
}

/// Transpose-copy driven by VPM DMA setup words
pub struct OmatcopyEmulator {
    name: &'static str,
    single_unit: bool,
}

impl OmatcopyEmulator {
    pub fn new(single_unit: bool) -> Self {
        Self {
            name: if single_unit { "somatcopy_1th" } else { "somatcopy" },
            single_unit,
        }
    }
}

impl KernelEmulator for OmatcopyEmulator {
    fn name(&self) -> &str {
        self.name
    }

    fn run(&self, memory: &DeviceMemory, uniforms: u32) -> Result<(), EmulationError> {
        let w = if self.single_unit {
            memory.read_words(uniforms, 14)?
        } else {
            let all = memory.read_words(uniforms, 17)?;
            check_self_address(self.name, all[0], uniforms)?;
            check_thread(self.name, all[15], all[16])?;
            all[1..15].to_vec()
        };

        let rows = w[0] as usize * 16;
        let cols = w[1] as usize * 32 + 16;
        let (a_bus, b_bus) = (w[2], w[3]);
        let lda = (w[5] / 64) as usize;
        let ldb = (w[7] / 64) as usize;
        let horizontal = (w[10] >> 14) & 1 == 1;

        let load_setup_0 = (1 << 31) | (1 << 12);
        let store_setup_0 = (2 << 30) | (16 << 23) | (16 << 16) | ((horizontal as u32) << 14);
        if w[4] != 64 || w[6] != 64 {
            return fail(self.name, "VPM row pitch must be 64 bytes");
        }
        if w[8] != load_setup_0 || w[9] != load_setup_0 | (16 << 4) {
            return fail(self.name, format!("bad load setup {:#x}/{:#x}", w[8], w[9]));
        }
        if w[10] != store_setup_0 || w[11] != store_setup_0 | (16 << 7) {
            return fail(self.name, format!("bad store setup {:#x}/{:#x}", w[10], w[11]));
        }
        if w[12] != (9 << 28) | (4 * lda as u32) {
            return fail(self.name, format!("bad load stride {:#x}", w[12]));
        }
        if w[13] != (3 << 30) | (4 * ldb as u32).wrapping_sub(64) {
            return fail(self.name, format!("bad store stride {:#x}", w[13]));
        }
        if rows == 0 {
            return fail(self.name, "empty row slab");
        }

        let a = memory.f32_span(a_bus, (rows - 1) * lda + cols)?;
        let b_extent = if horizontal {
            (rows - 1) * ldb + cols
        } else {
            (cols - 1) * ldb + rows
        };
        let b = memory.f32_span(b_bus, b_extent)?;
        for i in 0..rows {
            for j in 0..cols {
                let dst = if horizontal { i * ldb + j } else { j * ldb + i };
                // SAFETY: indices are inside the checked spans
                unsafe { b.add(dst).write(a.add(i * lda + j).read()) };
            }
        }
        Ok(())
    }
}
