//! Persistent arenas.
//!
//! The persistent region grows in arenas: contiguous extents of the backing
//! file, each starting with self-describing metadata followed by the pages
//! the allocator hands out. Arenas follow each other in the file, forming a
//! chain that starts right after the application's reserved prefix.
//!
//! # Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ Region header (first arena only): magic u64, region size u64    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ Arena header (128 B): identity, chain bookkeeping, undo log     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ Heap pointer bitmap: 1 byte per 32 data bytes                   │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ Span allocation log: 1 u32 per data page                        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ (padding to a page boundary)                                    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ Data pages                                                      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod header;
mod index;
mod layout;
mod undo;

pub use header::{
    ARENA_HEADER_SIZE, ARENA_MAGIC, ArenaField, ArenaHeader, MAX_UNDO_ENTRIES, UNDO_ENTRY_SIZE,
    UndoEntry,
};
pub use index::ArenaIndex;
pub use layout::{ArenaLayout, HEAP_BITS_BYTES_PER_PAGE, SPAN_LOG_BYTES_PER_PAGE};
pub use undo::UndoLog;

use crate::error::{PmemError, Result};
use crate::persist::{MappedExtent, PmemPlatform};
use crate::stats::LogStats;
use crate::types::{GRANULE_SIZE, PAGE_SHIFT, PAGE_SIZE, PmemAddr};
use std::sync::Arc;

/// One arena of the persistent chain.
pub struct Arena {
    extent: Arc<MappedExtent>,
    /// Offset of the arena start within `extent`.
    base: usize,
    file_offset: u64,
    layout: ArenaLayout,
}

impl Arena {
    /// Format a new arena over `size` bytes at `base` of `extent`.
    ///
    /// Both logs are zeroed and flushed before the header is written, and the
    /// header is persisted last, so a valid header never describes stale log
    /// contents.
    pub(crate) fn format(
        extent: Arc<MappedExtent>,
        base: usize,
        file_offset: u64,
        size: u64,
        chain: Option<(u64, u64)>,
        platform: &dyn PmemPlatform,
    ) -> Result<Self> {
        let layout = ArenaLayout::compute(size, file_offset == 0)?;
        extent.check_range(base, size as usize)?;

        let arena = Self {
            extent,
            base,
            file_offset,
            layout,
        };

        let logs = arena.ext(layout.type_bitmap_offset);
        let logs_len = (layout.type_bitmap_len + layout.span_bitmap_len) as usize;
        arena.extent.fill(logs, logs_len, 0)?;
        platform.flush_range(&arena.extent, logs, logs_len)?;

        let mut header = ArenaHeader::new(file_offset, size, arena.map_addr());
        if let Some((chain_size, arena_count)) = chain {
            header = header.with_chain(chain_size, arena_count);
        }
        let header_off = arena.ext(layout.header_offset);
        let bytes = header.to_bytes().map_err(|e| PmemError::Persist {
            offset: header_off,
            len: ARENA_HEADER_SIZE as usize,
            cause: e.to_string(),
        })?;
        arena.extent.write_bytes(header_off, &bytes)?;
        platform.persist_range(&arena.extent, header_off, bytes.len())?;

        Ok(arena)
    }

    /// Attach to an arena already present at `base` of `extent`.
    pub(crate) fn attach(extent: Arc<MappedExtent>, base: usize, file_offset: u64) -> Result<Self> {
        let first = file_offset == 0;
        let header_offset = if first {
            crate::region::REGION_HEADER_SIZE
        } else {
            0
        };
        let header_pos = extent.file_pos() + base as u64 + header_offset;

        let mut raw = [0u8; ARENA_HEADER_SIZE as usize];
        extent.read_into(base + header_offset as usize, &mut raw)?;
        let header = ArenaHeader::from_bytes(&raw)
            .map_err(|e| PmemError::corruption(PmemAddr::new(header_pos), e.to_string()))?;
        header
            .validate()
            .map_err(|e| PmemError::corruption(PmemAddr::new(header_pos), e))?;

        if header.file_offset != file_offset {
            return Err(PmemError::corruption(
                PmemAddr::new(header_pos),
                format!(
                    "arena header records file offset {} but sits at {}",
                    header.file_offset, file_offset
                ),
            ));
        }
        if base as u64 + header.size > extent.len() as u64 {
            return Err(PmemError::corruption(
                PmemAddr::new(header_pos),
                format!("arena size {} exceeds its mapping", header.size),
            ));
        }

        let layout = ArenaLayout::compute(header.size, first)
            .map_err(|e| PmemError::corruption(PmemAddr::new(header_pos), e.to_string()))?;

        tracing::debug!(
            file_offset,
            size = header.size,
            usable_pages = layout.usable_pages,
            "Attached arena"
        );

        Ok(Self {
            extent,
            base,
            file_offset,
            layout,
        })
    }

    /// Read and decode the current header.
    pub fn header(&self) -> Result<ArenaHeader> {
        let mut raw = [0u8; ARENA_HEADER_SIZE as usize];
        self.extent
            .read_into(self.ext(self.layout.header_offset), &mut raw)?;
        ArenaHeader::from_bytes(&raw).map_err(|e| {
            PmemError::corruption(self.pos(self.layout.header_offset), e.to_string())
        })
    }

    /// Position of the arena in the chain; 0 for the first arena.
    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    /// Whether this is the first arena, which also carries the region header.
    pub fn is_first(&self) -> bool {
        self.file_offset == 0
    }

    /// Extent size in bytes.
    pub fn size(&self) -> u64 {
        self.layout.extent_size
    }

    /// Metadata layout.
    pub fn layout(&self) -> &ArenaLayout {
        &self.layout
    }

    /// Number of allocatable pages.
    pub fn usable_pages(&self) -> u64 {
        self.layout.usable_pages
    }

    /// File position of the arena start.
    pub fn base_pos(&self) -> PmemAddr {
        PmemAddr::new(self.extent.file_pos() + self.base as u64)
    }

    /// First allocatable address.
    pub fn data_start(&self) -> PmemAddr {
        self.pos(self.layout.data_offset)
    }

    /// First address past the data pages.
    pub fn data_end(&self) -> PmemAddr {
        self.pos(self.layout.extent_size)
    }

    /// Whether `addr` is an allocatable address of this arena.
    pub fn contains(&self, addr: PmemAddr) -> bool {
        addr >= self.data_start() && addr < self.data_end()
    }

    /// Virtual address of the arena start in this process.
    pub fn map_addr(&self) -> u64 {
        (self.extent.base_addr() + self.base) as u64
    }

    /// The mapping holding this arena.
    pub fn extent(&self) -> &MappedExtent {
        &self.extent
    }

    /// File position of a header field.
    pub fn field_addr(&self, field: ArenaField) -> PmemAddr {
        self.pos(self.layout.header_offset + field.header_offset())
    }

    /// Read a mutable header field.
    pub fn read_field(&self, field: ArenaField) -> Result<u64> {
        self.extent
            .read_u64(self.ext(self.layout.header_offset + field.header_offset()))
    }

    /// Store a header field without flushing.
    ///
    /// Callers open an undo-log entry for the field first and close the
    /// transaction afterwards.
    pub(crate) fn write_field(&self, field: ArenaField, value: u64) -> Result<()> {
        self.extent.write_u64(
            self.ext(self.layout.header_offset + field.header_offset()),
            value,
        )
    }

    /// Undo log of this arena.
    pub fn undo_log<'a>(&'a self, platform: &'a dyn PmemPlatform, stats: &'a LogStats) -> UndoLog<'a> {
        UndoLog::new(self, platform, stats)
    }

    /// Index of the page holding `addr` among the data pages.
    pub fn page_index(&self, addr: PmemAddr) -> Result<u64> {
        self.data_offset_of(addr).map(|off| off >> PAGE_SHIFT)
    }

    /// Extent offset of the span-log slot for data page `page`.
    pub(crate) fn span_slot(&self, page: u64) -> usize {
        self.ext(self.layout.span_bitmap_offset + page * SPAN_LOG_BYTES_PER_PAGE)
    }

    /// Extent offset of the heap-bitmap byte describing `addr`'s granule.
    pub(crate) fn heap_bits_slot(&self, addr: PmemAddr) -> Result<usize> {
        let off = self.data_offset_of(addr)?;
        Ok(self.ext(self.layout.type_bitmap_offset + off / GRANULE_SIZE))
    }

    /// Extent offset of the heap-bitmap byte for data page `page`.
    pub(crate) fn heap_bits_page(&self, page: u64) -> usize {
        self.ext(self.layout.type_bitmap_offset + page * HEAP_BITS_BYTES_PER_PAGE)
    }

    /// Extent offset of a position relative to the arena start.
    pub(crate) fn ext(&self, arena_rel: u64) -> usize {
        self.base + arena_rel as usize
    }

    /// File position of a position relative to the arena start.
    pub(crate) fn pos(&self, arena_rel: u64) -> PmemAddr {
        self.base_pos().add(arena_rel)
    }

    fn data_offset_of(&self, addr: PmemAddr) -> Result<u64> {
        if !self.contains(addr) {
            return Err(PmemError::AddressOutOfRange {
                addr,
                start: self.data_start(),
                end: PmemAddr::new(self.data_end().as_u64() - 1),
            });
        }
        Ok(addr.as_u64() - self.data_start().as_u64())
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("file_offset", &self.file_offset)
            .field("base_pos", &self.base_pos())
            .field("size", &self.size())
            .field("usable_pages", &self.usable_pages())
            .finish()
    }
}

/// Page-aligned check shared by span-level logging.
pub(crate) fn check_page_aligned(addr: PmemAddr) -> Result<()> {
    if !addr.is_aligned(PAGE_SIZE) {
        return Err(PmemError::InvalidSpan {
            base: addr,
            cause: "span base is not page aligned".to_string(),
        });
    }
    Ok(())
}
