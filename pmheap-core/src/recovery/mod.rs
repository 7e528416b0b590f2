//! Restart recovery.
//!
//! Runs once on a non-first-time initialization, after every arena of the
//! chain has been attached and before any allocation is allowed. Recovery is
//! two passes in chain order:
//!
//! 1. revert every arena's open undo-log transaction, so that no header
//!    field is left half-updated;
//! 2. scan each arena's span log to rebuild page state, then rebuild the
//!    heap pointer bitmap of each allocated span from its direct log bytes or
//!    from its type descriptor.
//!
//! Anything the logs cannot explain is reported as corruption. Nothing is
//! repaired on a best-effort basis.

mod report;

pub use report::{PageState, RecoveredArena, RecoveredSpan, RecoveryReport};

use crate::arena::{Arena, HEAP_BITS_BYTES_PER_PAGE};
use crate::classes::SizeClassTable;
use crate::error::{PmemError, Result};
use crate::log::{DecodedSpan, HeapBitmap, HeapBitsLog, SpanLog, TypeDescriptor};
use crate::persist::PmemPlatform;
use crate::stats::LogStats;
use crate::types::{PAGE_SIZE, PmemAddr, SpanClass};
use std::sync::Arc;

/// Rebuilds allocator and collector state from the logs.
pub struct RecoveryEngine<'a> {
    platform: &'a dyn PmemPlatform,
    classes: &'a dyn SizeClassTable,
    stats: &'a LogStats,
}

impl<'a> RecoveryEngine<'a> {
    /// Create an engine.
    pub fn new(
        platform: &'a dyn PmemPlatform,
        classes: &'a dyn SizeClassTable,
        stats: &'a LogStats,
    ) -> Self {
        Self {
            platform,
            classes,
            stats,
        }
    }

    /// Recover every arena of the chain, in chain order.
    pub fn recover(&self, arenas: &[Arc<Arena>]) -> Result<RecoveryReport> {
        let reverted = self.revert_all(arenas)?;
        self.scan(arenas, reverted)
    }

    /// First pass: revert the open undo-log transaction of every arena.
    ///
    /// Returns the number of entries reverted per arena.
    pub fn revert_all(&self, arenas: &[Arc<Arena>]) -> Result<Vec<usize>> {
        arenas.iter().map(|arena| self.revert_undo(arena)).collect()
    }

    /// Second pass: rebuild page state and heap bits of every arena.
    ///
    /// `reverted` carries the first pass's per-arena counts into the report.
    pub fn scan(&self, arenas: &[Arc<Arena>], reverted: Vec<usize>) -> Result<RecoveryReport> {
        if reverted.len() != arenas.len() {
            return Err(PmemError::invalid_argument(format!(
                "{} undo counts for {} arenas",
                reverted.len(),
                arenas.len()
            )));
        }
        let arenas = arenas
            .iter()
            .zip(reverted)
            .map(|(arena, undo_reverted)| self.recover_arena(arena, undo_reverted))
            .collect::<Result<Vec<_>>>()?;

        let report = RecoveryReport { arenas };
        tracing::info!(
            arenas = report.arenas.len(),
            spans = report.spans().count(),
            undo_reverted = report.undo_reverted(),
            "Recovered persistent heap"
        );
        Ok(report)
    }

    /// Roll back an open undo-log transaction of `arena`.
    pub fn revert_undo(&self, arena: &Arena) -> Result<usize> {
        let undo = arena.undo_log(self.platform, self.stats);
        let entries = undo.entries()?;
        if entries.is_empty() {
            return Ok(0);
        }
        tracing::warn!(
            arena = arena.file_offset(),
            entries = entries.len(),
            "Reverting incomplete arena header update"
        );
        undo.revert()
    }

    /// Rebuild the page state and heap bitmap of one arena.
    pub fn recover_arena(&self, arena: &Arena, undo_reverted: usize) -> Result<RecoveredArena> {
        let span_log = SpanLog::new(arena, self.platform, self.stats);
        let heap_log = HeapBitsLog::new(arena, self.platform, self.stats);

        let mut spans = Vec::new();
        let mut heap_bits = HeapBitmap::new(arena.data_start(), arena.usable_pages() * PAGE_SIZE);
        let mut page = 0;
        while page < arena.usable_pages() {
            let entry = span_log.read(page)?;
            if entry.raw() == 0 {
                page += 1;
                continue;
            }
            let base = arena.data_start().add(page * PAGE_SIZE);
            let span = self.decode_span(arena, &span_log, &heap_log, page, base, entry.decode())?;
            self.rebuild_bits(arena, &mut heap_bits, &span)?;
            page += span.pages;
            spans.push(span);
        }

        tracing::debug!(
            arena = arena.file_offset(),
            spans = spans.len(),
            "Recovered arena"
        );
        Ok(RecoveredArena {
            file_offset: arena.file_offset(),
            data_start: arena.data_start(),
            usable_pages: arena.usable_pages(),
            spans,
            heap_bits,
            undo_reverted,
        })
    }

    fn decode_span(
        &self,
        arena: &Arena,
        span_log: &SpanLog<'_>,
        heap_log: &HeapBitsLog<'_>,
        page: u64,
        base: PmemAddr,
        decoded: std::result::Result<DecodedSpan, &'static str>,
    ) -> Result<RecoveredSpan> {
        let decoded = decoded.map_err(|cause| PmemError::corruption(base, cause))?;
        let (span_class, pages, elem_size, needs_zero, optimized) = match decoded {
            DecodedSpan::Small {
                span_class,
                optimized,
                needs_zero,
            } => {
                let (elem_size, pages) = self.small_class(base, span_class)?;
                (span_class, pages, elem_size, needs_zero, optimized)
            }
            DecodedSpan::Large {
                pages,
                span_class,
                needs_zero,
            } => (span_class, pages, pages * PAGE_SIZE, needs_zero, false),
        };

        if page + pages > arena.usable_pages() {
            return Err(PmemError::corruption(
                base,
                format!("span of {} pages runs past the arena", pages),
            ));
        }
        for interior in page + 1..page + pages {
            if span_log.read(interior)?.raw() != 0 {
                return Err(PmemError::corruption(
                    arena.data_start().add(interior * PAGE_SIZE),
                    format!("span log entry inside the span at {}", base),
                ));
            }
        }

        let descriptor = if optimized && !span_class.noscan() {
            let descriptor = heap_log.read_descriptor(base, pages)?;
            if let Some(d) = &descriptor {
                check_descriptor(base, d, elem_size, pages)?;
            }
            descriptor
        } else {
            None
        };

        Ok(RecoveredSpan {
            base,
            page,
            pages,
            span_class,
            elem_size,
            needs_zero,
            optimized,
            descriptor,
        })
    }

    fn small_class(&self, base: PmemAddr, span_class: SpanClass) -> Result<(u64, u64)> {
        let class = span_class.size_class();
        match (self.classes.object_size(class), self.classes.span_pages(class)) {
            (Some(size), Some(pages)) => Ok((size, pages)),
            _ => Err(PmemError::corruption(
                base,
                format!(
                    "span class {} has no size class in a table of {}",
                    span_class,
                    self.classes.class_count()
                ),
            )),
        }
    }

    fn rebuild_bits(&self, arena: &Arena, bits: &mut HeapBitmap, span: &RecoveredSpan) -> Result<()> {
        if span.span_class.noscan() {
            return Ok(());
        }
        if span.optimized {
            if let Some(descriptor) = &span.descriptor {
                for i in 0..span.object_count() {
                    bits.set_object(span.base.add(i * span.elem_size), span.elem_size, descriptor)?;
                }
            }
            return Ok(());
        }

        let mut raw = vec![0u8; (span.pages * HEAP_BITS_BYTES_PER_PAGE) as usize];
        arena
            .extent()
            .read_into(arena.heap_bits_page(span.page), &mut raw)?;
        bits.copy_from(span.base, &raw)
    }
}

fn check_descriptor(base: PmemAddr, d: &TypeDescriptor, elem_size: u64, pages: u64) -> Result<()> {
    if d.size == 0 || d.size > elem_size {
        return Err(PmemError::corruption(
            base,
            format!("descriptor for {} bytes in a span of {}-byte objects", d.size, elem_size),
        ));
    }
    if d.record_len() > pages * HEAP_BITS_BYTES_PER_PAGE {
        return Err(PmemError::corruption(base, "descriptor overruns the span's bitmap"));
    }
    Ok(())
}
