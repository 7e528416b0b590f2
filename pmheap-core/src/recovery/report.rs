//! What recovery rebuilt.

use crate::log::{HeapBitmap, HeapBitsIter, TypeDescriptor};
use crate::types::{PAGE_SHIFT, PAGE_SIZE, PmemAddr, SpanClass};

/// A span found allocated in the span log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredSpan {
    /// First page address.
    pub base: PmemAddr,
    /// Page index within the arena's data pages.
    pub page: u64,
    /// Number of pages.
    pub pages: u64,
    /// Span class.
    pub span_class: SpanClass,
    /// Object size (the whole span for a large span).
    pub elem_size: u64,
    /// Memory must be zeroed before reuse.
    pub needs_zero: bool,
    /// Heap bits were logged as a shared type descriptor.
    pub optimized: bool,
    /// The descriptor, when one was tagged before the crash.
    pub descriptor: Option<TypeDescriptor>,
}

impl RecoveredSpan {
    /// First address past the span.
    pub fn end(&self) -> PmemAddr {
        self.base.add(self.pages << PAGE_SHIFT)
    }

    /// Number of objects the span holds.
    pub fn object_count(&self) -> u64 {
        (self.pages << PAGE_SHIFT) / self.elem_size
    }

    /// Whether `addr` lies inside the span.
    pub fn contains(&self, addr: PmemAddr) -> bool {
        addr >= self.base && addr < self.end()
    }
}

/// Allocation state of one data page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Not part of any allocated span.
    Free,
    /// Part of the allocated span starting at `span_base`.
    Allocated {
        /// Base of the owning span.
        span_base: PmemAddr,
        /// Class of the owning span.
        span_class: SpanClass,
    },
}

/// Recovered state of one arena.
#[derive(Debug, Clone)]
pub struct RecoveredArena {
    /// Chain position of the arena.
    pub file_offset: u64,
    /// First data page address.
    pub data_start: PmemAddr,
    /// Number of data pages.
    pub usable_pages: u64,
    /// Allocated spans in address order.
    pub spans: Vec<RecoveredSpan>,
    /// Pointer bitmap for every live allocation.
    pub heap_bits: HeapBitmap,
    /// Undo entries rolled back before the arena was scanned.
    pub undo_reverted: usize,
}

impl RecoveredArena {
    /// Allocation state of every data page.
    pub fn page_states(&self) -> Vec<PageState> {
        let mut states = vec![PageState::Free; self.usable_pages as usize];
        for span in &self.spans {
            let first = span.page as usize;
            for state in &mut states[first..first + span.pages as usize] {
                *state = PageState::Allocated {
                    span_base: span.base,
                    span_class: span.span_class,
                };
            }
        }
        states
    }

    /// Maximal runs of free pages as `(base, pages)`, for seeding the
    /// allocator's free structures.
    pub fn free_ranges(&self) -> Vec<(PmemAddr, u64)> {
        let mut ranges = Vec::new();
        let mut next = 0;
        for span in &self.spans {
            if span.page > next {
                ranges.push((self.page_addr(next), span.page - next));
            }
            next = span.page + span.pages;
        }
        if next < self.usable_pages {
            ranges.push((self.page_addr(next), self.usable_pages - next));
        }
        ranges
    }

    /// The allocated span containing `addr`.
    pub fn span_at(&self, addr: PmemAddr) -> Option<&RecoveredSpan> {
        let idx = self.spans.partition_point(|s| s.base <= addr);
        idx.checked_sub(1)
            .map(|i| &self.spans[i])
            .filter(|s| s.contains(addr))
    }

    fn page_addr(&self, page: u64) -> PmemAddr {
        self.data_start.add(page * PAGE_SIZE)
    }
}

/// Everything recovery rebuilt, one entry per arena in chain order.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Recovered arenas.
    pub arenas: Vec<RecoveredArena>,
}

impl RecoveryReport {
    /// All allocated spans across the chain.
    pub fn spans(&self) -> impl Iterator<Item = &RecoveredSpan> {
        self.arenas.iter().flat_map(|a| a.spans.iter())
    }

    /// Total undo entries reverted.
    pub fn undo_reverted(&self) -> usize {
        self.arenas.iter().map(|a| a.undo_reverted).sum()
    }

    /// The arena whose data pages hold `addr`.
    pub fn arena_at(&self, addr: PmemAddr) -> Option<&RecoveredArena> {
        self.arenas.iter().find(|a| {
            addr >= a.data_start && addr < a.data_start.add(a.usable_pages * PAGE_SIZE)
        })
    }

    /// The allocated span containing `addr`.
    pub fn span_at(&self, addr: PmemAddr) -> Option<&RecoveredSpan> {
        self.arena_at(addr).and_then(|a| a.span_at(addr))
    }

    /// Pointer flags of the object of `size` bytes at `addr`.
    pub fn object_bits(&self, addr: PmemAddr, size: u64) -> HeapBitsIter<'_> {
        match self.arena_at(addr) {
            Some(arena) => arena.heap_bits.object_bits(addr, size),
            None => HeapBitsIter::new(&[], 0, 0),
        }
    }

    /// Addresses of the pointer words of the object at `addr`.
    pub fn pointer_slots(&self, addr: PmemAddr, size: u64) -> Vec<PmemAddr> {
        self.arena_at(addr)
            .map(|a| a.heap_bits.pointer_slots(addr, size))
            .unwrap_or_default()
    }
}
