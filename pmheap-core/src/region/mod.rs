//! The persistent region and the heap context that owns it.
//!
//! A region is one backing file:
//!
//! ```text
//! [0, reserved)         application area, never touched here
//! [reserved, +16)       region header: magic u64, total size u64
//! [reserved + 16, ...)  first arena, then any arenas added by growth
//! ```
//!
//! The region header doubles as the first-run marker. On a fresh file the
//! first arena is formatted, then the size is persisted, then the magic, so
//! a file without the magic was never completely initialized.

mod chain;
mod heap;
mod state;

pub use heap::{InitOutcome, PmemHeap};
pub use state::RegionState;

use crate::arena::{Arena, ArenaIndex};
use crate::error::{PmemError, Result};
use crate::persist::MappedExtent;
use crate::types::PmemAddr;
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Magic number marking a completely initialized region.
pub const REGION_MAGIC: u64 = 0x504D_4845_4150_0001;

/// Size of the region header.
pub const REGION_HEADER_SIZE: u64 = 16;

const REGION_SIZE_OFFSET: usize = 8;

/// A mapped persistent region.
pub struct Region {
    name: String,
    path: PathBuf,
    total_size: u64,
    reserved_offset: u64,
    first_time: bool,
    mapping: Arc<MappedExtent>,
    arenas: RwLock<ArenaIndex>,
    grow_lock: Mutex<()>,
    lock_file: Option<File>,
}

impl Region {
    /// Name the region was initialized with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size recorded in the region header.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Bytes at the start of the file left to the application.
    pub fn reserved_offset(&self) -> u64 {
        self.reserved_offset
    }

    /// Whether this process created the region.
    pub fn first_time(&self) -> bool {
        self.first_time
    }

    /// Virtual address of file position 0 in this process.
    pub fn base_addr(&self) -> usize {
        self.mapping.base_addr()
    }

    /// Mapping of `[0, total_size)`.
    pub fn mapping(&self) -> &MappedExtent {
        &self.mapping
    }

    /// First allocatable address.
    pub fn start(&self) -> PmemAddr {
        self.arenas
            .read()
            .first()
            .map_or(PmemAddr::ZERO, |a| a.data_start())
    }

    /// Last allocatable address (inclusive).
    pub fn end(&self) -> PmemAddr {
        self.arenas
            .read()
            .last()
            .map_or(PmemAddr::ZERO, |a| PmemAddr::new(a.data_end().as_u64() - 1))
    }

    /// The arena whose data pages contain `addr`.
    pub fn arena_for(&self, addr: PmemAddr) -> Result<Arc<Arena>> {
        let found = self.arenas.read().find(addr).cloned();
        found.ok_or_else(|| PmemError::AddressOutOfRange {
            addr,
            start: self.start(),
            end: self.end(),
        })
    }

    /// The arena at chain position `file_offset`.
    pub fn arena(&self, file_offset: u64) -> Option<Arc<Arena>> {
        self.arenas.read().get(file_offset).cloned()
    }

    /// All arenas in chain order.
    pub fn arenas(&self) -> Vec<Arc<Arena>> {
        self.arenas.read().iter().cloned().collect()
    }

    /// Number of arenas.
    pub fn arena_count(&self) -> usize {
        self.arenas.read().len()
    }

    /// Total bytes of the arena chain.
    pub fn chain_size(&self) -> u64 {
        self.arenas.read().chain_size()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Some(file) = &self.lock_file {
            let _ = FileExt::unlock(file);
        }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("total_size", &self.total_size)
            .field("reserved_offset", &self.reserved_offset)
            .field("first_time", &self.first_time)
            .field("arenas", &self.arena_count())
            .finish()
    }
}
