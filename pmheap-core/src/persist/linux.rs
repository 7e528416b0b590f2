//! Linux persistence primitives.

use super::{MappedExtent, PmemPlatform};
use crate::error::{PmemError, Result};
use memmap2::MmapOptions;
use std::fs::OpenOptions;
use std::path::Path;

/// Cache-line size used for write-back.
#[cfg(target_arch = "x86_64")]
const CACHE_LINE: usize = 64;

/// Persistence primitives backed by `mmap` on Linux.
///
/// With `dax` set the backing file is assumed to sit on a DAX mount and
/// flushing uses cache-line write-back instructions on x86_64. Otherwise each
/// flush is a synchronous `msync` of the affected pages.
#[derive(Debug, Clone)]
pub struct LinuxPlatform {
    dax: bool,
}

impl LinuxPlatform {
    /// Create the platform.
    pub fn new(dax: bool) -> Self {
        Self { dax }
    }

    #[cfg(target_arch = "x86_64")]
    fn writeback_lines(&self, extent: &MappedExtent, offset: usize, len: usize) -> Result<()> {
        extent.check_range(offset, len)?;
        let first = extent.line_ptr(offset)? as usize;
        let start = first & !(CACHE_LINE - 1);
        let end = first + len;
        let mut line = start;
        while line < end {
            // SAFETY: every line touched overlaps the checked range, which lies
            // inside the live mapping; clflush does not write data.
            unsafe { std::arch::x86_64::_mm_clflush(line as *const u8) };
            line += CACHE_LINE;
        }
        Ok(())
    }
}

impl PmemPlatform for LinuxPlatform {
    fn name(&self) -> &'static str {
        if self.dax { "linux-dax" } else { "linux-msync" }
    }

    fn map_file(&self, path: &Path, file_pos: u64, len: u64) -> Result<MappedExtent> {
        let map_err = |cause: String| PmemError::Map {
            path: path.to_path_buf(),
            file_pos,
            len,
            cause,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| map_err(e.to_string()))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| map_err(e.to_string()))?;

        let current = file.metadata().map_err(|e| map_err(e.to_string()))?.len();
        if current < file_pos + len {
            file.set_len(file_pos + len)
                .map_err(|e| map_err(format!("Failed to extend file: {}", e)))?;
        }

        let map = MmapOptions::new()
            .offset(file_pos)
            .len(len as usize)
            .map_raw(&file)
            .map_err(|e| map_err(e.to_string()))?;

        Ok(MappedExtent::new(map, file_pos, self.dax))
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(PmemError::Io {
                path: path.to_path_buf(),
                cause: e.to_string(),
            }),
        }
    }

    fn flush_range(&self, extent: &MappedExtent, offset: usize, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        #[cfg(target_arch = "x86_64")]
        if self.dax && extent.is_pmem() {
            return self.writeback_lines(extent, offset, len);
        }
        extent.msync_range(offset, len)
    }

    fn fence(&self) -> Result<()> {
        #[cfg(target_arch = "x86_64")]
        // SAFETY: sfence has no memory-safety preconditions.
        unsafe {
            std::arch::x86_64::_mm_sfence();
        }
        #[cfg(not(target_arch = "x86_64"))]
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}
