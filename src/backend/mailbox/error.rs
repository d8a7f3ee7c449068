//! Firmware channel error types

use thiserror::Error;

/// Mailbox (firmware property interface) error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MailboxError {
    #[error("Mailbox device {path} could not be opened: {reason}")]
    OpenFailed { path: String, reason: String },
    #[error("Mailbox device is not open")]
    NotOpen,
    #[error("Mailbox ioctl failed for tag {tag:#x}: {reason}")]
    IoctlFailed { tag: u32, reason: String },
    #[error("Firmware reported request failure for tag {tag:#x}")]
    RequestFailed { tag: u32 },
    #[error("Unrecognized firmware status {status:#010x} for tag {tag:#x}")]
    UnrecognizedStatus { tag: u32, status: u32 },
    #[error("Malformed property response for tag {tag:#x}: {reason}")]
    MalformedResponse { tag: u32, reason: String },
    #[error("Firmware {operation} returned {value:#x}")]
    Rejected { operation: &'static str, value: u32 },
}

/// Mailbox result type
pub type MailboxResult<T> = Result<T, MailboxError>;

impl MailboxError {
    /// Tag of the property request that failed, if the failure was tag specific
    pub fn tag(&self) -> Option<u32> {
        match self {
            MailboxError::IoctlFailed { tag, .. }
            | MailboxError::RequestFailed { tag }
            | MailboxError::UnrecognizedStatus { tag, .. }
            | MailboxError::MalformedResponse { tag, .. } => Some(*tag),
            _ => None,
        }
    }
}
