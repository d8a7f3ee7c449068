//! QPU launch control
//!
//! The firmware starts units from a control block in shared memory holding
//! one `(uniforms address, code address)` pair per unit. [`Launcher`] owns
//! that block, fills it from a [`DispatchList`] and blocks in the firmware
//! until every unit has finished.

use crate::backend::{CacheOp, FirmwareChannel};
use crate::error::{ForgeResult, QpuForgeError};
use crate::memory::{Allocator, SharedBuffer};

/// Number of QPUs on a VideoCore IV
pub const MAX_UNITS: usize = 12;

/// Start addresses of one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchEntry {
    pub uniforms: u32,
    pub code: u32,
}

/// Fixed-capacity list of units to start together
#[derive(Debug, Clone, Default)]
pub struct DispatchList {
    entries: [DispatchEntry; MAX_UNITS],
    len: usize,
}

impl DispatchList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, uniforms: u32, code: u32) -> ForgeResult<()> {
        if self.len == MAX_UNITS {
            return Err(QpuForgeError::DispatchOverflow {
                max: MAX_UNITS,
                requested: self.len + 1,
            });
        }
        self.entries[self.len] = DispatchEntry { uniforms, code };
        self.len += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn entries(&self) -> &[DispatchEntry] {
        &self.entries[..self.len]
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

/// Owner of the launch control block
#[derive(Debug, Default)]
pub struct Launcher {
    control: Option<SharedBuffer>,
    launches: u64,
}

impl Launcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.control.is_some()
    }

    /// Number of successful submissions
    pub fn launch_count(&self) -> u64 {
        self.launches
    }

    /// Power up the QPUs and allocate the control block
    pub fn setup(
        &mut self,
        firmware: &mut FirmwareChannel,
        allocator: &mut Allocator,
        alignment: usize,
    ) -> ForgeResult<()> {
        firmware.enable_qpu(true)?;
        match allocator.allocate(firmware, MAX_UNITS * 2 * 4, alignment) {
            Ok(control) => {
                tracing::debug!("Launcher::setup: control block at bus {:#x}", control.bus_address());
                self.control = Some(control);
                Ok(())
            }
            Err(e) => {
                if let Err(disable) = firmware.enable_qpu(false) {
                    tracing::warn!("Launcher::setup: disabling QPUs after failed setup: {}", disable);
                }
                Err(e)
            }
        }
    }

    /// Free the control block and power the QPUs down
    pub fn teardown(
        &mut self,
        firmware: &mut FirmwareChannel,
        allocator: &mut Allocator,
    ) -> ForgeResult<()> {
        let freed = match self.control.take() {
            Some(control) => allocator.free(firmware, control),
            None => Ok(()),
        };
        tracing::debug!("Launcher::teardown after {} launches", self.launches);
        firmware.enable_qpu(false)?;
        freed
    }

    /// Start every unit in `list` and wait for completion
    pub fn submit(
        &mut self,
        firmware: &mut FirmwareChannel,
        allocator: &mut Allocator,
        list: &DispatchList,
        noflush: bool,
        timeout_ms: u32,
    ) -> ForgeResult<()> {
        if list.is_empty() {
            return Err(crate::param_error!("submit", "list", 0, "at least one unit is required"));
        }
        let control = self
            .control
            .as_mut()
            .ok_or(QpuForgeError::NotInitialized("launcher"))?;

        let words = control.as_u32_mut();
        for (i, entry) in list.entries().iter().enumerate() {
            words[2 * i] = entry.uniforms;
            words[2 * i + 1] = entry.code;
        }
        allocator.cache_maintenance(control.as_ptr(), list.len() * 8, CacheOp::Clean)?;

        tracing::trace!(
            "Launcher::submit: {} units noflush={} timeout={}ms",
            list.len(),
            noflush,
            timeout_ms
        );
        firmware.execute_qpu(list.len() as u32, control.bus_address(), noflush, timeout_ms)?;
        self.launches += 1;
        Ok(())
    }
}
