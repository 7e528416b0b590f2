//! Arena metadata layout.

use super::header::ARENA_HEADER_SIZE;
use crate::error::{PmemError, Result};
use crate::region::REGION_HEADER_SIZE;
use crate::types::{GRANULE_SIZE, PAGE_SHIFT, PAGE_SIZE, round_up};

/// Span-log bytes per page.
pub const SPAN_LOG_BYTES_PER_PAGE: u64 = 4;

/// Heap-bitmap bytes per page.
pub const HEAP_BITS_BYTES_PER_PAGE: u64 = PAGE_SIZE / GRANULE_SIZE;

/// Where everything lives inside one arena extent.
///
/// All offsets are relative to the start of the extent. The first arena of
/// the chain starts with the region header, so its own header is shifted by
/// [`REGION_HEADER_SIZE`]. The layout is a pure function of the extent size
/// and whether the arena is first, which lets recovery recompute it from the
/// header alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaLayout {
    /// Extent size in bytes.
    pub extent_size: u64,
    /// Offset of the arena header.
    pub header_offset: u64,
    /// Offset of the heap pointer bitmap.
    pub type_bitmap_offset: u64,
    /// Heap pointer bitmap length (`usable_bytes / 32`).
    pub type_bitmap_len: u64,
    /// Offset of the span allocation log.
    pub span_bitmap_offset: u64,
    /// Span allocation log length (`usable_pages * 4`).
    pub span_bitmap_len: u64,
    /// Offset of the first allocatable page.
    pub data_offset: u64,
    /// Number of allocatable pages.
    pub usable_pages: u64,
}

impl ArenaLayout {
    /// Compute the layout of an extent of `extent_size` bytes.
    pub fn compute(extent_size: u64, first: bool) -> Result<Self> {
        if extent_size == 0 || extent_size % PAGE_SIZE != 0 {
            return Err(PmemError::config(format!(
                "arena size {} is not a non-zero multiple of the page size",
                extent_size
            )));
        }

        let header_offset = if first { REGION_HEADER_SIZE } else { 0 };
        let fixed = header_offset + ARENA_HEADER_SIZE;
        let meta_per_page = HEAP_BITS_BYTES_PER_PAGE + SPAN_LOG_BYTES_PER_PAGE;
        let total_pages = extent_size >> PAGE_SHIFT;

        // Metadata pages grow with the usable page count; start from the
        // continuous solution and step down until the rounded metadata fits.
        let mut usable_pages = extent_size.saturating_sub(fixed) / (PAGE_SIZE + meta_per_page);
        while usable_pages > 0
            && round_up(fixed + usable_pages * meta_per_page, PAGE_SIZE) / PAGE_SIZE + usable_pages
                > total_pages
        {
            usable_pages -= 1;
        }
        if usable_pages == 0 {
            return Err(PmemError::config(format!(
                "arena size {} leaves no allocatable pages",
                extent_size
            )));
        }

        let type_bitmap_offset = fixed;
        let type_bitmap_len = usable_pages * HEAP_BITS_BYTES_PER_PAGE;
        let span_bitmap_offset = type_bitmap_offset + type_bitmap_len;

        Ok(Self {
            extent_size,
            header_offset,
            type_bitmap_offset,
            type_bitmap_len,
            span_bitmap_offset,
            span_bitmap_len: usable_pages * SPAN_LOG_BYTES_PER_PAGE,
            data_offset: (total_pages - usable_pages) << PAGE_SHIFT,
            usable_pages,
        })
    }

    /// Metadata size (everything before the data pages) and usable bytes.
    pub fn layout(&self) -> (u64, u64) {
        (self.data_offset, self.usable_pages << PAGE_SHIFT)
    }

    /// Pages excluded from allocation.
    pub fn reserved_pages(&self) -> u64 {
        self.data_offset >> PAGE_SHIFT
    }

    /// Bytes of metadata actually written (header plus both logs).
    pub fn metadata_len(&self) -> u64 {
        self.span_bitmap_offset + self.span_bitmap_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MIN_REGION_SIZE;

    #[test]
    fn first_arena_of_minimum_region() {
        let layout = ArenaLayout::compute(MIN_REGION_SIZE, true).unwrap();
        assert_eq!(layout.header_offset, REGION_HEADER_SIZE);
        assert_eq!(layout.usable_pages, 7939);
        assert_eq!(layout.reserved_pages(), 8192 - 7939);
        assert!(layout.metadata_len() <= layout.data_offset);
        assert_eq!(layout.data_offset % PAGE_SIZE, 0);
    }

    #[test]
    fn bitmaps_are_contiguous_and_sized_by_usable_pages() {
        let layout = ArenaLayout::compute(2 * MIN_REGION_SIZE, false).unwrap();
        let (header, usable) = layout.layout();
        assert_eq!(layout.type_bitmap_offset, ARENA_HEADER_SIZE);
        assert_eq!(layout.type_bitmap_len, usable / GRANULE_SIZE);
        assert_eq!(
            layout.span_bitmap_offset,
            layout.type_bitmap_offset + layout.type_bitmap_len
        );
        assert_eq!(layout.span_bitmap_len, layout.usable_pages * 4);
        assert_eq!(header + usable, 2 * MIN_REGION_SIZE);
    }

    #[test]
    fn span_log_slots_are_word_aligned() {
        for first in [true, false] {
            let layout = ArenaLayout::compute(MIN_REGION_SIZE, first).unwrap();
            assert_eq!(layout.span_bitmap_offset % 4, 0);
        }
    }

    #[test]
    fn tiny_or_unaligned_extents_are_rejected() {
        assert!(ArenaLayout::compute(0, false).is_err());
        assert!(ArenaLayout::compute(PAGE_SIZE + 1, false).is_err());
        assert!(ArenaLayout::compute(PAGE_SIZE, true).is_err());
    }
}
