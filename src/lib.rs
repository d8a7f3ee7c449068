//! QPUForge - BLAS-style kernels on the VideoCore IV QPUs
//!
//! A host runtime that runs single-precision matrix multiply, vector copy,
//! scaled matrix transpose-copy and absolute value on the 12 QPUs of a
//! Raspberry Pi. It allocates GPU-shared memory through the firmware
//! mailbox, splits each call across the units, writes their parameter
//! blocks and waits for the firmware to run them.

#![allow(clippy::too_many_arguments)] // BLAS entry points take many scalars
#![allow(clippy::missing_safety_doc)] // Mapping constructors documented at module level

pub mod backend;
pub mod error;
pub mod kernels;
pub mod launch;
pub mod logging;
pub mod memory;
pub mod runtime;

pub use backend::{CacheOp, CachePolicy, MemFlags, Platform};
pub use error::{ErrorCategory, ForgeResult, QpuForgeError};
pub use kernels::{KernelId, KernelImage, KernelLibrary, Layout, Transpose};
pub use launch::{DispatchList, MAX_UNITS};
pub use logging::{init_logging_default, init_logging_from_env, init_with_config, LoggingConfig};
pub use memory::SharedBuffer;
pub use runtime::{Runtime, RuntimeConfig, RuntimeStats, Subsystem, TimeoutPolicy};
