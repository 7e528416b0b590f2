//! Span allocation log.
//!
//! # Entry format
//!
//! ```text
//! small span:  span_class << 2 | optimized << 1 | needs_zero
//! large span:  (LARGE_SPAN_BIAS + pages) << 3 | span_class << 2 | needs_zero
//! ```
//!
//! Small span classes stay below `2 * NUM_SIZE_CLASSES`, and a large span
//! has at least [`MIN_LARGE_PAGES`] pages, so the two encodings never
//! overlap once the low two bits are dropped. A zero entry means the page
//! does not start an allocated span.

use crate::arena::{Arena, check_page_aligned};
use crate::error::{PmemError, Result};
use crate::persist::PmemPlatform;
use crate::stats::LogStats;
use crate::types::{Span, SpanClass, WORD_SIZE};
use std::sync::atomic::Ordering;

/// Number of size classes, including class 0 for large spans.
pub const NUM_SIZE_CLASSES: u8 = 67;

/// Offset added to a large span's page count before it is shifted into the
/// entry.
pub const LARGE_SPAN_BIAS: u32 = 62;

/// Smallest page count of a large span.
pub const MIN_LARGE_PAGES: u64 = 5;

const NEEDS_ZERO_BIT: u32 = 1;
const OPTIMIZED_BIT: u32 = 1 << 1;
const SMALL_LIMIT: u32 = 2 * NUM_SIZE_CLASSES as u32;

/// Encoded span-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanLogValue(u32);

/// A span-log entry decoded back into span attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedSpan {
    /// A size-classed span; its page count comes from the size-class table.
    Small {
        /// Span class.
        span_class: SpanClass,
        /// Heap bits are logged as one type descriptor.
        optimized: bool,
        /// Memory must be zeroed before reuse.
        needs_zero: bool,
    },
    /// A span holding one large object.
    Large {
        /// Page count.
        pages: u64,
        /// Span class (size class 0).
        span_class: SpanClass,
        /// Memory must be zeroed before reuse.
        needs_zero: bool,
    },
}

impl SpanLogValue {
    /// Wrap a raw entry.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Encode the entry for `span`.
    pub fn for_span(span: &Span) -> Result<Self> {
        let spc = span.span_class.raw() as u32;
        let needs_zero = span.needs_zero as u32;

        let raw = if span.is_large() {
            if span.span_class.size_class() != 0 {
                return Err(PmemError::InvalidSpan {
                    base: span.base,
                    cause: format!("large span with size class {}", span.span_class),
                });
            }
            if let Some(ty) = span.type_index {
                return Err(PmemError::InvalidSpan {
                    base: span.base,
                    cause: format!("large span cannot share {}", ty),
                });
            }
            if span.pages < MIN_LARGE_PAGES || span.pages > (u32::MAX >> 3) as u64 - LARGE_SPAN_BIAS as u64 {
                return Err(PmemError::InvalidSpan {
                    base: span.base,
                    cause: format!("large span page count {} cannot be logged", span.pages),
                });
            }
            (LARGE_SPAN_BIAS + span.pages as u32) << 3 | spc << 2 | needs_zero
        } else {
            if spc < 2 || spc >= SMALL_LIMIT {
                return Err(PmemError::InvalidSpan {
                    base: span.base,
                    cause: format!("small span class {} out of range", span.span_class),
                });
            }
            let optimized = span.type_index.is_some() as u32;
            spc << 2 | optimized << 1 | needs_zero
        };
        Ok(Self(raw))
    }

    /// Raw entry.
    pub const fn raw(&self) -> u32 {
        self.0
    }

    /// Bits that must survive reuse unchanged.
    pub const fn identity(&self) -> u32 {
        self.0 >> 2
    }

    /// Bits allowed to change on reuse (optimized flag, needs-zero).
    pub const fn flags(&self) -> u32 {
        self.0 & (OPTIMIZED_BIT | NEEDS_ZERO_BIT)
    }

    /// Decode a non-zero entry.
    pub fn decode(&self) -> std::result::Result<DecodedSpan, &'static str> {
        if self.0 == 0 {
            return Err("empty span log entry");
        }
        let needs_zero = self.0 & NEEDS_ZERO_BIT != 0;
        let identity = self.identity();
        if identity < SMALL_LIMIT {
            if identity < 2 {
                return Err("small span entry without a size class");
            }
            return Ok(DecodedSpan::Small {
                span_class: SpanClass::new(identity as u8),
                optimized: self.0 & OPTIMIZED_BIT != 0,
                needs_zero,
            });
        }

        if self.0 & OPTIMIZED_BIT != 0 {
            return Err("optimized flag set on a large span entry");
        }
        let pages = (self.0 >> 3) - LARGE_SPAN_BIAS;
        if (pages as u64) < MIN_LARGE_PAGES {
            return Err("large span entry with too few pages");
        }
        Ok(DecodedSpan::Large {
            pages: pages as u64,
            span_class: SpanClass::new((identity & 1) as u8),
            needs_zero,
        })
    }
}

/// Result of logging a span allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanLogOutcome {
    /// The entry was stored and flushed.
    Written,
    /// The slot already held exactly this entry.
    Skipped,
}

/// Span allocation log of one arena.
pub struct SpanLog<'a> {
    arena: &'a Arena,
    platform: &'a dyn PmemPlatform,
    stats: &'a LogStats,
}

impl<'a> SpanLog<'a> {
    /// Create a view over `arena`'s span log.
    pub fn new(arena: &'a Arena, platform: &'a dyn PmemPlatform, stats: &'a LogStats) -> Self {
        Self {
            arena,
            platform,
            stats,
        }
    }

    /// Record that `span` is allocated.
    ///
    /// A non-zero slot means the span is being reused: its identity bits must
    /// match or the log is corrupt, and an identical entry is left alone. The
    /// store is flushed but not fenced.
    ///
    /// An entry that switches the span to descriptor mode first clears and
    /// persists whatever tag earlier use left at the start of the span's
    /// bitmap window, so recovery never reads stale bitmap bytes as a
    /// descriptor.
    pub fn log_alloc(&self, span: &Span) -> Result<SpanLogOutcome> {
        let (page, slot) = self.locate(span)?;
        let value = SpanLogValue::for_span(span)?;

        let cell = self.arena.extent().atomic_u32(slot)?;
        let logged = SpanLogValue::from_raw(u32::from_le(cell.load(Ordering::Acquire)));
        if logged.raw() != 0 {
            if logged.identity() != value.identity() {
                return Err(PmemError::SpanLogMismatch {
                    page,
                    logged: logged.raw(),
                    requested: value.raw(),
                    span_class: span.span_class,
                });
            }
            if logged.flags() == value.flags() {
                tracing::debug!(page, value = logged.raw(), "Span already logged");
                self.stats.span_skip();
                return Ok(SpanLogOutcome::Skipped);
            }
        }

        if value.raw() & OPTIMIZED_BIT != 0 {
            self.clear_descriptor_tag(page)?;
        }
        cell.store(value.raw().to_le(), Ordering::Release);
        self.platform.flush_range(self.arena.extent(), slot, 4)?;
        self.stats.span_write();
        Ok(SpanLogOutcome::Written)
    }

    fn clear_descriptor_tag(&self, page: u64) -> Result<()> {
        let tag = self.arena.heap_bits_page(page);
        let extent = self.arena.extent();
        if extent.read_u64(tag)? != 0 {
            extent.write_u64(tag, 0)?;
            self.platform.persist_range(extent, tag, WORD_SIZE as usize)?;
        }
        Ok(())
    }

    /// Record that `span` was freed. The cleared slot is persisted.
    pub fn log_free(&self, span: &Span) -> Result<()> {
        let (_, slot) = self.locate(span)?;
        let cell = self.arena.extent().atomic_u32(slot)?;
        cell.store(0, Ordering::Release);
        self.platform.persist_range(self.arena.extent(), slot, 4)?;
        self.stats.span_free();
        Ok(())
    }

    /// Read the entry for data page `page`.
    pub fn read(&self, page: u64) -> Result<SpanLogValue> {
        if page >= self.arena.usable_pages() {
            return Err(PmemError::invalid_argument(format!(
                "page {} beyond {} usable pages",
                page,
                self.arena.usable_pages()
            )));
        }
        Ok(SpanLogValue::from_raw(
            self.arena.extent().read_u32(self.arena.span_slot(page))?,
        ))
    }

    fn locate(&self, span: &Span) -> Result<(u64, usize)> {
        if !span.is_persistent() {
            return Err(PmemError::InvalidSpan {
                base: span.base,
                cause: "span is not in persistent memory".to_string(),
            });
        }
        if span.arena != self.arena.file_offset() {
            return Err(PmemError::InvalidSpan {
                base: span.base,
                cause: format!(
                    "span belongs to arena {} but was logged against arena {}",
                    span.arena,
                    self.arena.file_offset()
                ),
            });
        }
        check_page_aligned(span.base)?;
        let page = self.arena.page_index(span.base)?;
        if span.pages == 0 || page + span.pages > self.arena.usable_pages() {
            return Err(PmemError::InvalidSpan {
                base: span.base,
                cause: format!("{} pages at page {} overrun the arena", span.pages, page),
            });
        }
        Ok((page, self.arena.span_slot(page)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::tests::test_arena;
    use crate::persist::LinuxPlatform;
    use crate::testing::{PersistOp, RecordingPlatform};
    use crate::types::{MemType, PAGE_SIZE, TypeIndex};
    use std::sync::Arc;

    fn small(arena: &Arena, page: u64, size_class: u8) -> Span {
        Span::persistent(
            arena.data_start().add(page * PAGE_SIZE),
            1,
            SpanClass::make(size_class, false),
            64,
            arena.file_offset(),
        )
    }

    #[test]
    fn small_and_large_encodings() {
        let base = crate::types::PmemAddr::new(0);
        let s = Span::persistent(base, 1, SpanClass::make(5, true), 64, 0).with_needs_zero(true);
        let v = SpanLogValue::for_span(&s).unwrap();
        assert_eq!(v.raw(), 11 << 2 | 1);
        assert_eq!(
            v.decode().unwrap(),
            DecodedSpan::Small {
                span_class: SpanClass::make(5, true),
                optimized: false,
                needs_zero: true
            }
        );

        let l = Span::persistent(base, 7, SpanClass::make(0, false), 7 * PAGE_SIZE, 0);
        let v = SpanLogValue::for_span(&l).unwrap();
        assert_eq!(v.raw(), (62 + 7) << 3);
        assert_eq!(
            v.decode().unwrap(),
            DecodedSpan::Large {
                pages: 7,
                span_class: SpanClass::make(0, false),
                needs_zero: false
            }
        );
    }

    #[test]
    fn optimized_flag_tracks_type_index() {
        let base = crate::types::PmemAddr::new(0);
        let s = Span::persistent(base, 1, SpanClass::make(3, false), 48, 0)
            .with_type_index(TypeIndex::new(9).unwrap());
        let v = SpanLogValue::for_span(&s).unwrap();
        assert_eq!(v.flags(), 0b10);
    }

    #[test]
    fn small_and_large_identities_are_disjoint() {
        let max_small = SpanLogValue::from_raw((SMALL_LIMIT - 1) << 2);
        let min_large = SpanLogValue::from_raw((LARGE_SPAN_BIAS + MIN_LARGE_PAGES as u32) << 3);
        assert!(max_small.identity() < min_large.identity());
        assert!(matches!(max_small.decode(), Ok(DecodedSpan::Small { .. })));
        assert!(matches!(min_large.decode(), Ok(DecodedSpan::Large { .. })));
    }

    #[test]
    fn unloggable_spans_are_rejected() {
        let base = crate::types::PmemAddr::new(0);
        let tiny_large = Span::persistent(base, 2, SpanClass::make(0, false), 40 * 1024, 0);
        assert!(SpanLogValue::for_span(&tiny_large).is_err());
        let classless = Span::persistent(base, 1, SpanClass::make(0, false), 64, 0);
        assert!(SpanLogValue::for_span(&classless).is_err());
        let huge_class = Span::persistent(base, 1, SpanClass::make(67, false), 64, 0);
        assert!(SpanLogValue::for_span(&huge_class).is_err());
    }

    #[test]
    fn alloc_free_alloc_reproduces_entry() {
        let (_dir, platform, arena) = test_arena(0);
        let stats = LogStats::new();
        let log = SpanLog::new(&arena, &platform, &stats);

        let span = small(&arena, 4, 10);
        assert_eq!(log.log_alloc(&span).unwrap(), SpanLogOutcome::Written);
        let first = log.read(4).unwrap();

        log.log_free(&span).unwrap();
        assert_eq!(log.read(4).unwrap().raw(), 0);

        let reused = span.clone().with_needs_zero(true);
        log.log_alloc(&reused).unwrap();
        let second = log.read(4).unwrap();
        assert_eq!(first.raw() | 1, second.raw());
    }

    #[test]
    fn identical_reuse_is_skipped() {
        let (_dir, platform, arena) = test_arena(0);
        let stats = LogStats::new();
        let log = SpanLog::new(&arena, &platform, &stats);

        let span = small(&arena, 0, 2);
        log.log_alloc(&span).unwrap();
        assert_eq!(log.log_alloc(&span).unwrap(), SpanLogOutcome::Skipped);

        let flipped = span.clone().with_needs_zero(true);
        assert_eq!(log.log_alloc(&flipped).unwrap(), SpanLogOutcome::Written);

        let snap = stats.snapshot();
        assert_eq!(snap.span_writes, 2);
        assert_eq!(snap.span_skips, 1);
    }

    #[test]
    fn differing_size_class_on_reuse_is_corruption() {
        let (_dir, platform, arena) = test_arena(0);
        let stats = LogStats::new();
        let log = SpanLog::new(&arena, &platform, &stats);

        log.log_alloc(&small(&arena, 8, 3)).unwrap();
        let err = log.log_alloc(&small(&arena, 8, 4)).unwrap_err();
        assert!(matches!(err, PmemError::SpanLogMismatch { page: 8, .. }));
        assert!(err.is_fatal());
        assert!(err.is_corruption());
    }

    #[test]
    fn volatile_and_foreign_spans_are_rejected() {
        let (_dir, platform, arena) = test_arena(0);
        let stats = LogStats::new();
        let log = SpanLog::new(&arena, &platform, &stats);

        let volatile = small(&arena, 1, 3).with_mem_type(MemType::Volatile);
        assert!(matches!(
            log.log_alloc(&volatile),
            Err(PmemError::InvalidSpan { .. })
        ));
        assert!(matches!(
            log.log_free(&volatile),
            Err(PmemError::InvalidSpan { .. })
        ));

        let mut foreign = small(&arena, 1, 3);
        foreign.arena = 1 << 30;
        assert!(log.log_alloc(&foreign).is_err());

        let mut overrun = small(&arena, arena.usable_pages() - 1, 3);
        overrun.pages = 2;
        assert!(log.log_alloc(&overrun).is_err());
    }

    #[test]
    fn large_span_cannot_carry_a_type_index() {
        let base = crate::types::PmemAddr::new(0);
        let l = Span::persistent(base, 5, SpanClass::make(0, false), 5 * PAGE_SIZE, 0)
            .with_type_index(TypeIndex::new(0xff).unwrap());
        assert!(matches!(
            SpanLogValue::for_span(&l),
            Err(PmemError::InvalidSpan { .. })
        ));
    }

    #[test]
    fn optimized_entry_clears_stale_tag_before_store() {
        let (_dir, _, arena) = test_arena(0);
        let platform = RecordingPlatform::new(Arc::new(LinuxPlatform::new(false)));
        let stats = LogStats::new();
        let log = SpanLog::new(&arena, &platform, &stats);

        // Leftover direct-mode bits at the start of page 2's bitmap window.
        let tag = arena.heap_bits_page(2);
        arena.extent().write_bytes(tag, &[0x11; 64]).unwrap();

        let span = small(&arena, 2, 2).with_type_index(TypeIndex::new(7).unwrap());
        assert_eq!(log.log_alloc(&span).unwrap(), SpanLogOutcome::Written);
        assert_eq!(arena.extent().read_u64(tag).unwrap(), 0);

        let file_pos = |off: usize| arena.extent().file_pos() + off as u64;
        assert_eq!(
            platform.ops(),
            vec![
                PersistOp::Flush {
                    file_pos: file_pos(tag),
                    len: 8
                },
                PersistOp::Fence,
                PersistOp::Flush {
                    file_pos: file_pos(arena.span_slot(2)),
                    len: 4
                },
            ]
        );

        // Direct entries leave the window alone.
        platform.clear();
        arena.extent().write_bytes(arena.heap_bits_page(3), &[0x11; 8]).unwrap();
        log.log_alloc(&small(&arena, 3, 2)).unwrap();
        assert_eq!(platform.len(), 1);
        assert_ne!(arena.extent().read_u64(arena.heap_bits_page(3)).unwrap(), 0);
    }
}
