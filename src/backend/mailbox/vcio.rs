//! `/dev/vcio` transport for the firmware property interface

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use super::channel::FirmwareTransport;
use super::error::{MailboxError, MailboxResult};
use super::ffi::IOCTL_MBOX_PROPERTY;

/// Default path of the VideoCore mailbox character device
pub const DEFAULT_MAILBOX_PATH: &str = "/dev/vcio";

/// Mailbox character device driven through `ioctl`
#[derive(Debug)]
pub struct VcioDevice {
    path: PathBuf,
    file: Option<File>,
}

impl VcioDevice {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for VcioDevice {
    fn default() -> Self {
        Self::new(DEFAULT_MAILBOX_PATH)
    }
}

impl FirmwareTransport for VcioDevice {
    fn open(&mut self) -> MailboxResult<()> {
        if self.file.is_some() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)
            .map_err(|e| {
                tracing::error!("VcioDevice::open: {} failed: {}", self.path.display(), e);
                MailboxError::OpenFailed {
                    path: self.path.display().to_string(),
                    reason: e.to_string(),
                }
            })?;
        tracing::debug!("VcioDevice::open: {} fd={}", self.path.display(), file.as_raw_fd());
        self.file = Some(file);
        Ok(())
    }

    fn close(&mut self) -> MailboxResult<()> {
        // Dropping the File closes the descriptor
        if let Some(file) = self.file.take() {
            tracing::debug!("VcioDevice::close: fd={}", file.as_raw_fd());
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn exchange(&mut self, buffer: &mut [u32]) -> MailboxResult<()> {
        let tag = buffer.get(2).copied().unwrap_or(0);
        let file = self.file.as_ref().ok_or(MailboxError::NotOpen)?;

        // SAFETY: the driver reads buffer[0] bytes starting at the pointer and
        // writes the response back into the same range. The property buffer
        // builder sets buffer[0] to the slice length in bytes.
        let ret = unsafe {
            libc::ioctl(
                file.as_raw_fd(),
                IOCTL_MBOX_PROPERTY as _,
                buffer.as_mut_ptr() as *mut libc::c_void,
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            tracing::error!("VcioDevice::exchange: ioctl failed for tag {:#x}: {}", tag, err);
            return Err(MailboxError::IoctlFailed {
                tag,
                reason: err.to_string(),
            });
        }
        Ok(())
    }
}
