//! Process-wide uniforms and code buffers
//!
//! Every kernel family registers the space it needs when it is initialized.
//! One pair of shared buffers, sized to the largest registered requirement,
//! serves every launch. Sizes never shrink while the runtime is up.

use crate::backend::FirmwareChannel;
use crate::error::ForgeResult;
use crate::kernels::KernelProfile;
use crate::memory::{Allocator, SharedBuffer};

#[derive(Debug, Default)]
pub struct SharedKernelBuffers {
    required: KernelProfile,
    uniforms: Option<SharedBuffer>,
    code: Option<SharedBuffer>,
}

impl SharedKernelBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the requirement to cover `profile`
    pub fn register(&mut self, profile: KernelProfile) {
        self.required = self.required.max(profile);
    }

    pub fn required(&self) -> KernelProfile {
        self.required
    }

    pub fn is_allocated(&self) -> bool {
        self.uniforms.is_some() && self.code.is_some()
    }

    /// Current sizes in bytes; zero when not allocated
    pub fn allocated(&self) -> KernelProfile {
        KernelProfile {
            uniform_bytes: self.uniforms.as_ref().map_or(0, SharedBuffer::len),
            code_bytes: self.code.as_ref().map_or(0, SharedBuffer::len),
        }
    }

    /// Allocate the buffers, or grow them to the registered requirement
    pub fn ensure_allocated(
        &mut self,
        firmware: &mut FirmwareChannel,
        allocator: &mut Allocator,
        alignment: usize,
    ) -> ForgeResult<()> {
        let current = self.allocated();
        let target = self.required.max(current);
        let target = KernelProfile {
            uniform_bytes: target.uniform_bytes.max(4),
            code_bytes: target.code_bytes.max(4),
        };
        if self.is_allocated() && target == current {
            return Ok(());
        }

        self.release(firmware, allocator)?;
        let uniforms = allocator.allocate(firmware, target.uniform_bytes, alignment)?;
        let code = match allocator.allocate(firmware, target.code_bytes, alignment) {
            Ok(code) => code,
            Err(e) => {
                if let Err(free) = allocator.free(firmware, uniforms) {
                    tracing::warn!(
                        "SharedKernelBuffers: freeing uniforms after failed code allocation: {}",
                        free
                    );
                }
                return Err(e);
            }
        };
        tracing::debug!(
            "SharedKernelBuffers: uniforms {} bytes at {:#x}, code {} bytes at {:#x}",
            uniforms.len(),
            uniforms.bus_address(),
            code.len(),
            code.bus_address()
        );
        self.uniforms = Some(uniforms);
        self.code = Some(code);
        Ok(())
    }

    /// Free both buffers; the registered requirement is kept
    pub fn release(
        &mut self,
        firmware: &mut FirmwareChannel,
        allocator: &mut Allocator,
    ) -> ForgeResult<()> {
        let mut result = Ok(());
        for buffer in [self.uniforms.take(), self.code.take()].into_iter().flatten() {
            if let Err(e) = allocator.free(firmware, buffer) {
                tracing::error!("SharedKernelBuffers::release: {}", e);
                result = Err(e);
            }
        }
        result
    }

    /// Uniforms and code buffers, when allocated
    pub fn buffers_mut(&mut self) -> Option<(&mut SharedBuffer, &mut SharedBuffer)> {
        match (self.uniforms.as_mut(), self.code.as_mut()) {
            (Some(uniforms), Some(code)) => Some((uniforms, code)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::simulated::SimulatedDevice;
    use crate::backend::{CachePolicy, MemFlags};

    #[test]
    fn test_sizes_follow_largest_registration() {
        let device = SimulatedDevice::new();
        let mut firmware = FirmwareChannel::new(Box::new(device.clone()));
        firmware.open().unwrap();
        let mut allocator =
            Allocator::new(Box::new(device.clone()), MemFlags::DIRECT, CachePolicy::Cached);
        allocator.open().unwrap();

        let mut shared = SharedKernelBuffers::new();
        shared.register(KernelProfile {
            uniform_bytes: 288,
            code_bytes: 1024,
        });
        shared.register(KernelProfile {
            uniform_bytes: 672,
            code_bytes: 512,
        });
        assert!(shared.buffers_mut().is_none());

        shared.ensure_allocated(&mut firmware, &mut allocator, 4096).unwrap();
        assert_eq!(
            shared.allocated(),
            KernelProfile {
                uniform_bytes: 672,
                code_bytes: 1024
            }
        );
        assert_eq!(allocator.live_allocations(), 2);

        // Already large enough: no new allocations
        shared.ensure_allocated(&mut firmware, &mut allocator, 4096).unwrap();
        assert_eq!(device.stats().allocations, 2);

        shared.register(KernelProfile {
            uniform_bytes: 672,
            code_bytes: 2048,
        });
        shared.ensure_allocated(&mut firmware, &mut allocator, 4096).unwrap();
        assert_eq!(shared.allocated().code_bytes, 2048);
        assert_eq!(allocator.live_allocations(), 2);

        shared.release(&mut firmware, &mut allocator).unwrap();
        assert!(!shared.is_allocated());
        assert_eq!(allocator.live_allocations(), 0);
        assert_eq!(shared.required().code_bytes, 2048);
    }
}
