//! Heap pointer bitmap log.

use super::descriptor::{DESCRIPTOR_HEADER_SIZE, TypeDescriptor};
use crate::arena::{Arena, HEAP_BITS_BYTES_PER_PAGE};
use crate::error::{PmemError, Result};
use crate::persist::PmemPlatform;
use crate::stats::LogStats;
use crate::types::{GRANULE_SIZE, PmemAddr, Span, WORD_SIZE};

/// Heap bitmap log of one arena.
pub struct HeapBitsLog<'a> {
    arena: &'a Arena,
    platform: &'a dyn PmemPlatform,
    stats: &'a LogStats,
}

impl<'a> HeapBitsLog<'a> {
    /// Create a view over `arena`'s heap bitmap.
    pub fn new(arena: &'a Arena, platform: &'a dyn PmemPlatform, stats: &'a LogStats) -> Self {
        Self {
            arena,
            platform,
            stats,
        }
    }

    /// Log the pointer bits of a freshly allocated object at `addr`.
    ///
    /// Spans with a shared type index take the descriptor path and `bits` is
    /// ignored; other spans copy `bits`, the bitmap bytes covering the object,
    /// into the log.
    pub fn log(
        &self,
        span: &Span,
        addr: PmemAddr,
        bits: &[u8],
        descriptor: Option<&TypeDescriptor>,
    ) -> Result<()> {
        match (span.type_index, descriptor) {
            (Some(_), Some(descriptor)) => self.log_descriptor(span, descriptor),
            (Some(ty), None) => Err(PmemError::InvalidSpan {
                base: span.base,
                cause: format!("span shares {} but no descriptor was supplied", ty),
            }),
            (None, _) => self.log_direct(span, addr, bits),
        }
    }

    /// Copy `bits` into the log at the granule holding `addr`.
    pub fn log_direct(&self, span: &Span, addr: PmemAddr, bits: &[u8]) -> Result<()> {
        self.check_span(span)?;
        if !span.contains(addr) || !addr.is_aligned(WORD_SIZE) {
            return Err(PmemError::invalid_argument(format!(
                "object {} is not a word inside span {}..{}",
                addr,
                span.base,
                span.end()
            )));
        }
        if bits.is_empty() {
            return Err(PmemError::invalid_argument("empty heap bitmap"));
        }
        let first_granule = (addr.as_u64() - span.base.as_u64()) / GRANULE_SIZE;
        if first_granule + bits.len() as u64 > span.size_bytes() / GRANULE_SIZE {
            return Err(PmemError::invalid_argument(format!(
                "{} bitmap bytes at {} overrun span {}..{}",
                bits.len(),
                addr,
                span.base,
                span.end()
            )));
        }

        let slot = self.arena.heap_bits_slot(addr)?;
        self.arena.extent().write_bytes(slot, bits)?;
        self.platform
            .flush_range(self.arena.extent(), slot, bits.len())?;
        self.stats.heap_bits(bits.len() as u64);
        Ok(())
    }

    /// Write `descriptor` once for the whole span.
    ///
    /// The record body is persisted before the type index that makes it
    /// valid, so a crash never leaves a tagged record with a stale body. A
    /// record already tagged with the same type index is left alone.
    pub fn log_descriptor(&self, span: &Span, descriptor: &TypeDescriptor) -> Result<()> {
        self.check_span(span)?;
        if span.type_index != Some(descriptor.type_index) {
            return Err(PmemError::InvalidSpan {
                base: span.base,
                cause: format!(
                    "descriptor for {} logged against span of {:?}",
                    descriptor.type_index, span.type_index
                ),
            });
        }
        if span.is_large() {
            return Err(PmemError::InvalidSpan {
                base: span.base,
                cause: "a large span holds one object and logs its bits directly".to_string(),
            });
        }
        if descriptor.size == 0 || descriptor.size > span.elem_size {
            return Err(PmemError::invalid_argument(format!(
                "descriptor for {} bytes does not describe the span's {}-byte objects",
                descriptor.size, span.elem_size
            )));
        }
        let window = span.pages * HEAP_BITS_BYTES_PER_PAGE;
        if descriptor.record_len() > window {
            return Err(PmemError::invalid_argument(format!(
                "{}-byte descriptor does not fit the span's {}-byte bitmap window",
                descriptor.record_len(),
                window
            )));
        }

        let slot = self.window(span)?;
        let extent = self.arena.extent();
        if extent.read_u64(slot)? == descriptor.type_index.get() {
            self.stats.descriptor_skip();
            return Ok(());
        }

        let record = descriptor
            .to_record()
            .map_err(|e| PmemError::invalid_argument(e.to_string()))?;
        let (tag, body) = record.split_at(WORD_SIZE as usize);
        let body_slot = slot + WORD_SIZE as usize;
        extent.write_bytes(body_slot, body)?;
        self.platform.persist_range(extent, body_slot, body.len())?;
        extent.write_bytes(slot, tag)?;
        self.platform.flush_range(extent, slot, tag.len())?;

        self.stats.descriptor_write();
        tracing::trace!(
            span = %span.base,
            type_index = %descriptor.type_index,
            len = record.len(),
            "Logged type descriptor"
        );
        Ok(())
    }

    /// Read the descriptor at the start of `span`'s bitmap window, if tagged.
    pub fn read_descriptor(&self, span_base: PmemAddr, pages: u64) -> Result<Option<TypeDescriptor>> {
        let page = self.arena.page_index(span_base)?;
        let slot = self.arena.heap_bits_page(page);
        if self.arena.extent().read_u64(slot)? == 0 {
            return Ok(None);
        }

        let mut raw = vec![0u8; (pages * HEAP_BITS_BYTES_PER_PAGE) as usize];
        self.arena.extent().read_into(slot, &mut raw)?;
        let descriptor = TypeDescriptor::from_record(&raw).map_err(|e| {
            PmemError::corruption(span_base, format!("bad type descriptor: {}", e))
        })?;
        Ok(Some(descriptor))
    }

    /// Zero the bits for `size` bytes starting at `addr`.
    pub fn clear(&self, addr: PmemAddr, size: u64) -> Result<()> {
        if size % GRANULE_SIZE != 0 || !addr.is_aligned(GRANULE_SIZE) {
            return Err(PmemError::invalid_argument(format!(
                "clear of {} bytes at {} is not granule aligned",
                size, addr
            )));
        }
        if size == 0 {
            return Ok(());
        }
        if addr.add(size) > self.arena.data_end() {
            return Err(PmemError::AddressOutOfRange {
                addr: addr.add(size - 1),
                start: self.arena.data_start(),
                end: PmemAddr::new(self.arena.data_end().as_u64() - 1),
            });
        }

        let slot = self.arena.heap_bits_slot(addr)?;
        let len = (size / GRANULE_SIZE) as usize;
        self.arena.extent().fill(slot, len, 0)?;
        self.platform.flush_range(self.arena.extent(), slot, len)?;
        self.stats.clear();
        Ok(())
    }

    fn window(&self, span: &Span) -> Result<usize> {
        let page = self.arena.page_index(span.base)?;
        if page + span.pages > self.arena.usable_pages() {
            return Err(PmemError::InvalidSpan {
                base: span.base,
                cause: "span overruns the arena".to_string(),
            });
        }
        Ok(self.arena.heap_bits_page(page))
    }

    fn check_span(&self, span: &Span) -> Result<()> {
        if !span.is_persistent() || span.arena != self.arena.file_offset() {
            return Err(PmemError::InvalidSpan {
                base: span.base,
                cause: "span is not a persistent span of this arena".to_string(),
            });
        }
        Ok(())
    }
}

const _: () = assert!(DESCRIPTOR_HEADER_SIZE < HEAP_BITS_BYTES_PER_PAGE);
