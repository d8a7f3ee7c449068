//! Unified error handling for QPUForge
//!
//! Every fallible operation in the crate returns [`ForgeResult`]. Errors are
//! grouped into categories that tell the caller what went wrong:
//! - Contract errors (bad arguments, detected before any firmware call)
//! - Resource errors (shared memory, mappings, kernel images)
//! - Protocol errors (the firmware rejected or failed a request)
//! - Lifecycle errors (unbalanced init/finalize)
//! - Internal errors (bugs)

use std::fmt;

use crate::backend::mailbox::MailboxError;

// Re-export thiserror for convenience
pub use thiserror;

/// Unified error type for QPUForge
#[derive(Debug, thiserror::Error)]
pub enum QpuForgeError {
    // ========== Contract Errors ==========
    /// A routine argument violated its documented contract
    ///
    /// Mirrors the classic BLAS `xerbla` diagnostic: the routine, the
    /// parameter name and the rejected value are always reported.
    #[error("Parameter '{param}' (value {value}) was incorrect on entry to {routine}: {reason}")]
    InvalidParameter {
        routine: &'static str,
        param: &'static str,
        value: String,
        reason: String,
    },

    /// More dispatch entries than parallel units
    #[error("Dispatch list overflow: {requested} units requested, at most {max} available")]
    DispatchOverflow { max: usize, requested: usize },

    /// Memory layout or orientation combination not supported by a kernel family
    #[error("Unsupported layout for {routine}: {detail}")]
    UnsupportedLayout { routine: &'static str, detail: String },

    // ========== Resource Errors ==========
    /// Shared memory could not be obtained
    #[error("Shared memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Bus range could not be mapped into the process
    #[error("Bus memory mapping failed: {0}")]
    MappingFailed(String),

    /// Pointer does not belong to any live allocation
    #[error("Pointer {ptr:#x} is not inside any live allocation ({operation})")]
    UnknownPointer { ptr: usize, operation: &'static str },

    /// A kernel image required by a kernel family is not available
    #[error("Kernel image not found: {0}")]
    KernelImageMissing(String),

    /// A kernel image file could not be parsed
    #[error("Invalid kernel image {name}: {reason}")]
    KernelImageInvalid { name: String, reason: String },

    /// File or device I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    // ========== Protocol Errors ==========
    /// Firmware channel failure
    #[error("Firmware error: {0}")]
    Firmware(#[from] MailboxError),

    // ========== Lifecycle Errors ==========
    /// Operation requires a subsystem that has not been initialized
    #[error("Subsystem '{0}' is not initialized")]
    NotInitialized(&'static str),

    /// Finalize called more times than init
    #[error("Subsystem '{0}' finalized more times than initialized")]
    RefCountUnderflow(&'static str),

    /// Reference counts not back to zero at teardown
    #[error("Unbalanced lifecycle at teardown: {0}")]
    Unbalanced(String),

    // ========== Internal Errors ==========
    /// Internal error (indicates a bug)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Lock poisoned (indicates a panic while a lock was held)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl QpuForgeError {
    /// Categorize the error for handling decisions
    ///
    /// # Examples
    /// ```ignore
    /// match error.category() {
    ///     ErrorCategory::Contract => println!("fix the call site"),
    ///     ErrorCategory::Protocol => println!("firmware refused the request"),
    ///     _ => println!("report this"),
    /// }
    /// ```
    pub fn category(&self) -> ErrorCategory {
        match self {
            QpuForgeError::InvalidParameter { .. }
            | QpuForgeError::DispatchOverflow { .. }
            | QpuForgeError::UnsupportedLayout { .. } => ErrorCategory::Contract,

            QpuForgeError::AllocationFailed(_)
            | QpuForgeError::MappingFailed(_)
            | QpuForgeError::UnknownPointer { .. }
            | QpuForgeError::KernelImageMissing(_)
            | QpuForgeError::KernelImageInvalid { .. }
            | QpuForgeError::IoError(_) => ErrorCategory::Resource,

            QpuForgeError::Firmware(_) => ErrorCategory::Protocol,

            QpuForgeError::NotInitialized(_)
            | QpuForgeError::RefCountUnderflow(_)
            | QpuForgeError::Unbalanced(_) => ErrorCategory::Lifecycle,

            QpuForgeError::InternalError(_) | QpuForgeError::LockPoisoned(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Check if this error was caused by the caller's arguments
    ///
    /// Contract errors are detected before any firmware interaction, so the
    /// device state is unchanged and the call can be corrected and retried.
    pub fn is_contract_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Contract)
    }

    /// Check if the firmware reported a failure
    pub fn is_protocol_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Protocol)
    }

    pub fn is_lifecycle_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Lifecycle)
    }

    /// Check if this is an internal error (indicates a bug)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid argument, rejected before touching the device
    Contract,
    /// Shared memory, mapping or kernel image problem
    Resource,
    /// Firmware rejected or failed a request
    Protocol,
    /// Init/finalize imbalance
    Lifecycle,
    /// Indicates a bug
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Contract => write!(f, "Contract"),
            ErrorCategory::Resource => write!(f, "Resource"),
            ErrorCategory::Protocol => write!(f, "Protocol"),
            ErrorCategory::Lifecycle => write!(f, "Lifecycle"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

// Note: From<std::io::Error> and From<MailboxError> come from #[from] above

impl<T> From<std::sync::PoisonError<T>> for QpuForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        QpuForgeError::LockPoisoned(err.to_string())
    }
}

/// Result alias used throughout the crate
pub type ForgeResult<T> = std::result::Result<T, QpuForgeError>;

// ========== Helper Functions ==========

/// Build an [`QpuForgeError::InvalidParameter`] for a routine argument
///
/// # Examples
/// ```ignore
/// return Err(param_error!("sgemm", "lda", lda, "must be >= k ({})", k));
/// ```
#[macro_export]
macro_rules! param_error {
    ($routine:expr, $param:expr, $value:expr, $reason:expr) => {
        $crate::error::QpuForgeError::InvalidParameter {
            routine: $routine,
            param: $param,
            value: format!("{}", $value),
            reason: $reason.to_string(),
        }
    };
    ($routine:expr, $param:expr, $value:expr, $fmt:expr, $($arg:tt)*) => {
        $crate::error::QpuForgeError::InvalidParameter {
            routine: $routine,
            param: $param,
            value: format!("{}", $value),
            reason: format!($fmt, $($arg)*),
        }
    };
}

/// Create an internal error with context
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::QpuForgeError::InternalError($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::QpuForgeError::InternalError(format!($fmt, $($arg)*))
    };
}

/// Wrap an IO error with context
///
/// # Examples
/// ```ignore
/// let file = File::open(path).map_err(|e| io_context(e, "opening /dev/vcio"))?;
/// ```
pub fn io_context(err: std::io::Error, msg: &str) -> QpuForgeError {
    QpuForgeError::IoError(std::io::Error::new(
        err.kind(),
        format!("{}: {}", msg, err),
    ))
}

/// Fail with a parameter error unless `cond` holds
pub(crate) fn ensure_param(
    cond: bool,
    routine: &'static str,
    param: &'static str,
    value: impl fmt::Display,
    reason: impl Into<String>,
) -> ForgeResult<()> {
    if cond {
        Ok(())
    } else {
        Err(QpuForgeError::InvalidParameter {
            routine,
            param,
            value: value.to_string(),
            reason: reason.into(),
        })
    }
}
