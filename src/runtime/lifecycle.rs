//! Reference-counted subsystem bookkeeping
//!
//! The ledger only counts. [`super::Runtime`] performs the physical setup on
//! a 0 -> 1 transition and the teardown on 1 -> 0.

use std::fmt;

use crate::error::{ForgeResult, QpuForgeError};

/// A unit of runtime state with its own init/finalize count
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Subsystem {
    /// Firmware mailbox channel
    Mailbox,
    /// Shared-memory allocator and bus mapping
    Memory,
    /// QPU power and the launch control block
    Launcher,
    Gemm,
    Copy,
    Omatcopy,
    Abs,
    /// Everything above plus the shared uniforms/code buffers
    Main,
}

impl Subsystem {
    /// Every subsystem, dependencies before dependents
    pub const ALL: [Subsystem; 8] = [
        Subsystem::Mailbox,
        Subsystem::Memory,
        Subsystem::Launcher,
        Subsystem::Gemm,
        Subsystem::Copy,
        Subsystem::Omatcopy,
        Subsystem::Abs,
        Subsystem::Main,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Subsystem::Mailbox => "mailbox",
            Subsystem::Memory => "memory",
            Subsystem::Launcher => "launcher",
            Subsystem::Gemm => "gemm",
            Subsystem::Copy => "copy",
            Subsystem::Omatcopy => "omatcopy",
            Subsystem::Abs => "abs",
            Subsystem::Main => "main",
        }
    }

    /// Subsystems initialized before this one, in init order
    pub fn dependencies(self) -> &'static [Subsystem] {
        match self {
            Subsystem::Mailbox => &[],
            Subsystem::Memory => &[Subsystem::Mailbox],
            Subsystem::Launcher => &[Subsystem::Memory],
            Subsystem::Gemm | Subsystem::Copy | Subsystem::Omatcopy | Subsystem::Abs => &[],
            Subsystem::Main => &[
                Subsystem::Mailbox,
                Subsystem::Memory,
                Subsystem::Launcher,
                Subsystem::Gemm,
                Subsystem::Copy,
                Subsystem::Omatcopy,
                Subsystem::Abs,
            ],
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Init/finalize counts of every subsystem
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifecycleLedger {
    counts: [u32; Subsystem::ALL.len()],
}

impl LifecycleLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, subsystem: Subsystem) -> u32 {
        self.counts[subsystem.slot()]
    }

    pub fn is_active(&self, subsystem: Subsystem) -> bool {
        self.count(subsystem) > 0
    }

    /// Increment; returns true on the 0 -> 1 transition
    pub fn acquire(&mut self, subsystem: Subsystem) -> bool {
        let count = &mut self.counts[subsystem.slot()];
        *count += 1;
        *count == 1
    }

    /// Decrement; returns true on the 1 -> 0 transition
    pub fn release(&mut self, subsystem: Subsystem) -> ForgeResult<bool> {
        let count = &mut self.counts[subsystem.slot()];
        if *count == 0 {
            return Err(QpuForgeError::RefCountUnderflow(subsystem.name()));
        }
        *count -= 1;
        Ok(*count == 0)
    }

    /// Subsystems whose count is not zero
    pub fn outstanding(&self) -> Vec<(Subsystem, u32)> {
        Subsystem::ALL
            .iter()
            .map(|&s| (s, self.count(s)))
            .filter(|&(_, count)| count > 0)
            .collect()
    }

    /// Fail with [`QpuForgeError::Unbalanced`] naming every non-zero count
    pub fn ensure_balanced(&self) -> ForgeResult<()> {
        let outstanding = self.outstanding();
        if outstanding.is_empty() {
            return Ok(());
        }
        let detail = outstanding
            .iter()
            .map(|(s, count)| format!("{}={}", s, count))
            .collect::<Vec<_>>()
            .join(", ");
        Err(QpuForgeError::Unbalanced(detail))
    }
}
