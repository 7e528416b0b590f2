//! Persistence primitives and mapped extents.
//!
//! Durability of a store to persistent memory is a two-step affair:
//! `flush_range` pushes the written cache lines toward the persistence
//! domain without ordering them against anything else, and `fence` orders
//! every earlier flush before any later store. `persist_range` does both and
//! is used for a single self-contained update. Operations that perform
//! several updates flush each one and issue one trailing fence at their
//! durability checkpoint.
//!
//! Platform support is explicit: on a target without real primitives every
//! call fails with [`PmemError::Unsupported`](crate::error::PmemError)
//! instead of silently pretending to be crash consistent.

mod extent;
#[cfg(target_os = "linux")]
mod linux;
mod unsupported;

pub use extent::MappedExtent;
#[cfg(target_os = "linux")]
pub use linux::LinuxPlatform;
pub use unsupported::UnsupportedPlatform;

use crate::config::PmemConfig;
use crate::error::Result;
use std::path::Path;
use std::sync::Arc;

/// Platform capability trait for persistent memory access.
pub trait PmemPlatform: Send + Sync {
    /// Short name used in log events.
    fn name(&self) -> &'static str;

    /// Map `len` bytes of the file at `path` starting at `file_pos`,
    /// creating the file or extending it as needed.
    fn map_file(&self, path: &Path, file_pos: u64, len: u64) -> Result<MappedExtent>;

    /// Current size of the file at `path`, or 0 if it does not exist.
    fn file_size(&self, path: &Path) -> Result<u64>;

    /// Write back `len` bytes at `offset` of `extent` without ordering.
    fn flush_range(&self, extent: &MappedExtent, offset: usize, len: usize) -> Result<()>;

    /// Order all earlier flushes before later stores.
    fn fence(&self) -> Result<()>;

    /// Flush a range and fence.
    fn persist_range(&self, extent: &MappedExtent, offset: usize, len: usize) -> Result<()> {
        self.flush_range(extent, offset, len)?;
        self.fence()
    }
}

/// Select the platform implementation for the current target.
#[cfg(target_os = "linux")]
pub fn default_platform(config: &PmemConfig) -> Arc<dyn PmemPlatform> {
    Arc::new(LinuxPlatform::new(config.dax))
}

/// Select the platform implementation for the current target.
#[cfg(not(target_os = "linux"))]
pub fn default_platform(_config: &PmemConfig) -> Arc<dyn PmemPlatform> {
    Arc::new(UnsupportedPlatform)
}
