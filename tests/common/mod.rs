//! Common test utilities for runtime tests
//!
//! Every test gets its own [`SimulatedDevice`] so that device counters and
//! event logs start from zero. The fixture opens a [`Runtime`] on it with the
//! simulated kernel images and offers helpers to stage host data.
//!
//! # Usage
//!
//! ```ignore
//! let mut fixture = SimFixture::open();
//! let x = fixture.upload(&[1.0; 4096]);
//! // ... kernel calls through fixture.rt ...
//! fixture.finish();
//! ```

#![allow(dead_code)]

use qpuforge::backend::simulated::{SimEvent, SimulatedDevice};
use qpuforge::{Runtime, RuntimeConfig, SharedBuffer};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Alignment used for operand buffers in tests
pub const TEST_ALIGNMENT: usize = 4096;

/// Simulated device plus a fully initialized runtime
pub struct SimFixture {
    pub device: SimulatedDevice,
    pub rt: Runtime,
    buffers: Vec<SharedBuffer>,
}

impl SimFixture {
    /// Open a runtime with every subsystem initialized
    pub fn open() -> Self {
        Self::open_with(RuntimeConfig::default())
    }

    pub fn open_with(config: RuntimeConfig) -> Self {
        let device = SimulatedDevice::new();
        let rt = Runtime::open(device.platform(), device.kernel_library(), config)
            .expect("runtime should open on the simulated device");
        Self {
            device,
            rt,
            buffers: Vec::new(),
        }
    }

    /// Allocate a buffer of `elems` floats, zero filled
    pub fn zeros(&mut self, elems: usize) -> SharedBuffer {
        let mut buffer = self
            .rt
            .allocate(elems * 4, TEST_ALIGNMENT)
            .expect("allocation should succeed");
        buffer.as_f32_mut().fill(0.0);
        buffer
    }

    /// Allocate a buffer holding `data`
    pub fn upload(&mut self, data: &[f32]) -> SharedBuffer {
        let mut buffer = self.zeros(data.len());
        buffer.copy_from_f32(data).expect("copy into shared buffer");
        buffer
    }

    /// Hand a buffer to the fixture so that [`finish`](Self::finish) frees it
    pub fn keep(&mut self, buffer: SharedBuffer) {
        self.buffers.push(buffer);
    }

    /// Free kept buffers, shut the runtime down and check for leaks
    pub fn finish(mut self) {
        for buffer in self.buffers.drain(..) {
            self.rt.free(buffer).expect("free kept buffer");
        }
        let device = self.device.clone();
        self.rt.shutdown().expect("balanced shutdown");
        assert_no_leak(&device);
    }

    /// Events recorded since the last call to `clear_events`
    pub fn events(&self) -> Vec<SimEvent> {
        self.device.events()
    }
}

/// Assert that the device holds no memory and is powered down
pub fn assert_no_leak(device: &SimulatedDevice) {
    let stats = device.stats();
    assert_eq!(stats.live_blocks, 0, "device blocks leaked: {:?}", stats);
    assert_eq!(stats.live_bytes, 0, "device bytes leaked: {:?}", stats);
    assert!(!device.qpu_enabled(), "QPUs left enabled");
    assert!(!device.mailbox_open(), "mailbox left open");
}

/// Deterministic values in `[-1, 1)`
pub fn random_matrix(seed: u64, len: usize) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

#[allow(clippy::too_many_arguments)]
/// Row-major `C = alpha * op(A) * op(B) + beta * C` on the host
pub fn reference_sgemm(
    transposed: bool,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    lda: usize,
    b: &[f32],
    ldb: usize,
    beta: f32,
    c: &mut [f32],
    ldc: usize,
) {
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0f32;
            for p in 0..k {
                let (aip, bpj) = if transposed {
                    (a[p * lda + i], b[j * ldb + p])
                } else {
                    (a[i * lda + p], b[p * ldb + j])
                };
                acc += aip * bpj;
            }
            c[i * ldc + j] = alpha * acc + beta * c[i * ldc + j];
        }
    }
}

/// Largest absolute element-wise difference
pub fn max_abs_diff(lhs: &[f32], rhs: &[f32]) -> f32 {
    assert_eq!(lhs.len(), rhs.len());
    lhs.iter()
        .zip(rhs)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}
