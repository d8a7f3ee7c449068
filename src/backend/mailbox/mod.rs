//! VideoCore firmware mailbox client
//!
//! Tag-based property requests for GPU memory management and QPU execution.

mod channel;
mod error;
pub mod ffi;
mod vcio;

pub use channel::{FirmwareChannel, FirmwareTransport};
pub use error::{MailboxError, MailboxResult};
pub use ffi::MemFlags;
pub use vcio::{VcioDevice, DEFAULT_MAILBOX_PATH};
