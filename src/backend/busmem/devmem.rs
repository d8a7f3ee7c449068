//! `/dev/mem` backed bus memory mapping

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{fence, Ordering};

use memmap2::{MmapMut, MmapOptions};

use super::{BusMemory, CacheOp, CachePolicy, MappedRegion};
use crate::backend::mailbox::ffi::bus_to_phys;
use crate::error::{io_context, ForgeResult, QpuForgeError};

pub const DEFAULT_DEVMEM_PATH: &str = "/dev/mem";

/// Maps bus addresses through the physical memory device
///
/// Two descriptors are kept: one opened with `O_SYNC` for uncached mappings
/// and one without for cached mappings.
#[derive(Debug)]
pub struct DevMemMapper {
    path: PathBuf,
    cached: Option<File>,
    uncached: Option<File>,
    page_size: usize,
}

impl DevMemMapper {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cached: None,
            uncached: None,
            page_size: page_size(),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn file(&self, policy: CachePolicy) -> ForgeResult<&File> {
        let file = match policy {
            CachePolicy::Cached => self.cached.as_ref(),
            CachePolicy::Uncached => self.uncached.as_ref(),
        };
        file.ok_or_else(|| {
            QpuForgeError::MappingFailed(format!("{} is not open", self.path.display()))
        })
    }
}

impl Default for DevMemMapper {
    fn default() -> Self {
        Self::new(DEFAULT_DEVMEM_PATH)
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

impl BusMemory for DevMemMapper {
    fn open(&mut self) -> ForgeResult<()> {
        if self.cached.is_some() {
            return Ok(());
        }
        let cached = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| io_context(e, &format!("opening {}", self.path.display())))?;
        let uncached = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(&self.path)
            .map_err(|e| io_context(e, &format!("opening {} with O_SYNC", self.path.display())))?;
        tracing::debug!("DevMemMapper::open: {}", self.path.display());
        self.cached = Some(cached);
        self.uncached = Some(uncached);
        Ok(())
    }

    fn close(&mut self) -> ForgeResult<()> {
        tracing::debug!("DevMemMapper::close: {}", self.path.display());
        self.cached = None;
        self.uncached = None;
        Ok(())
    }

    fn map(
        &mut self,
        bus_address: u32,
        len: usize,
        policy: CachePolicy,
    ) -> ForgeResult<MappedRegion> {
        let phys = bus_to_phys(bus_address) as u64;
        if phys % self.page_size as u64 != 0 {
            return Err(QpuForgeError::MappingFailed(format!(
                "physical address {:#x} is not aligned to the {} byte page size",
                phys, self.page_size
            )));
        }
        if len == 0 {
            return Err(QpuForgeError::MappingFailed("zero-length mapping".to_string()));
        }

        let file = self.file(policy)?;
        // SAFETY: the range belongs to a firmware allocation locked by the
        // caller; nothing else in this process maps it.
        let mut mmap: MmapMut = unsafe {
            MmapOptions::new()
                .offset(phys)
                .len(len)
                .map_mut(file)
                .map_err(|e| {
                    tracing::error!("DevMemMapper::map: mmap of {:#x}+{} failed: {}", phys, len, e);
                    QpuForgeError::MappingFailed(format!("mmap of {:#x}+{}: {}", phys, len, e))
                })?
        };
        let ptr = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| {
            QpuForgeError::MappingFailed(format!("mmap of {:#x} returned null", phys))
        })?;
        tracing::trace!(
            "DevMemMapper::map: bus={:#x} phys={:#x} len={} policy={:?} cpu={:p}",
            bus_address,
            phys,
            len,
            policy,
            ptr
        );
        // SAFETY: the MmapMut moves into the region and keeps the pages mapped
        Ok(unsafe { MappedRegion::new(ptr, len, bus_address, policy, Box::new(mmap)) })
    }

    fn sync(
        &mut self,
        region: &MappedRegion,
        offset: usize,
        len: usize,
        op: CacheOp,
    ) -> ForgeResult<()> {
        if region.policy() == CachePolicy::Uncached || len == 0 {
            fence(Ordering::SeqCst);
            return Ok(());
        }

        let start = region.as_ptr() as usize + offset;
        let page_start = start & !(self.page_size - 1);
        let span = len + (start - page_start);
        let flags = msync_flags(op);

        fence(Ordering::SeqCst);
        // SAFETY: [page_start, start + len) lies inside a live mapping because
        // region mappings start on a page boundary.
        let ret = unsafe { libc::msync(page_start as *mut libc::c_void, span, flags) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            tracing::error!("DevMemMapper::sync: msync({:?}) failed: {}", op, err);
            return Err(io_context(err, "msync"));
        }
        fence(Ordering::SeqCst);
        Ok(())
    }
}

/// Clean writes dirty lines back; invalidate drops them
fn msync_flags(op: CacheOp) -> libc::c_int {
    match op {
        CacheOp::Clean => libc::MS_SYNC,
        CacheOp::Invalidate => libc::MS_INVALIDATE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_power_of_two() {
        let mapper = DevMemMapper::default();
        assert!(mapper.page_size().is_power_of_two());
    }

    #[test]
    fn test_map_requires_open() {
        let mut mapper = DevMemMapper::new("/nonexistent/mem");
        let err = mapper.map(0xC000_0000, 4096, CachePolicy::Cached).unwrap_err();
        assert!(matches!(err, QpuForgeError::MappingFailed(_)));
    }

    #[test]
    fn test_map_rejects_unaligned_address() {
        let mut mapper = DevMemMapper::new("/nonexistent/mem");
        let err = mapper.map(0xC000_0010, 4096, CachePolicy::Uncached).unwrap_err();
        assert!(err.to_string().contains("not aligned"));
    }

    #[test]
    fn test_msync_flags() {
        assert_eq!(msync_flags(CacheOp::Clean), libc::MS_SYNC);
        assert_eq!(msync_flags(CacheOp::Invalidate), libc::MS_INVALIDATE);
    }

    #[test]
    fn test_open_missing_device_is_io_error() {
        let mut mapper = DevMemMapper::new("/nonexistent/mem");
        assert!(matches!(mapper.open(), Err(QpuForgeError::IoError(_))));
    }
}
