//! Integration tests for the span log and heap bitmap log.

#![cfg(target_os = "linux")]

use pmheap_core::log::SpanLog;
use pmheap_core::persist::LinuxPlatform;
use pmheap_core::prelude::*;
use pmheap_core::testing::{PersistOp, RecordingPlatform};
use std::sync::Arc;
use tempfile::TempDir;

const SIZE: u64 = MIN_REGION_SIZE;

struct Fixture {
    dir: TempDir,
    heap: PmemHeap,
    start: PmemAddr,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let heap = PmemHeap::new(PmemConfig::default().with_directory(dir.path()));
    let start = heap.init("logs", SIZE, 0).unwrap().start;
    Fixture { dir, heap, start }
}

fn restart(fx: Fixture) -> (TempDir, PmemHeap) {
    let Fixture { dir, heap, .. } = fx;
    drop(heap);
    let heap = PmemHeap::new(PmemConfig::default().with_directory(dir.path()));
    heap.init("logs", SIZE, 0).unwrap();
    (dir, heap)
}

fn span_log_word(heap: &PmemHeap, span: &Span) -> u32 {
    let arena = heap.region().unwrap().arena_for(span.base).unwrap();
    let page = arena.page_index(span.base).unwrap();
    let slot = arena.layout().span_bitmap_offset + page * 4;
    arena
        .extent()
        .read_u32(arena.extent().offset_of(arena.base_pos().as_u64() + slot).unwrap())
        .unwrap()
}

/// `{ a *T; n u64; b *T; c *T }` packed into 48-byte objects.
struct Record;

impl PointerLayout for Record {
    fn size(&self) -> u64 {
        32
    }
    fn ptr_data(&self) -> u64 {
        32
    }
    fn is_pointer(&self, word: u64) -> bool {
        word != 1
    }
}

#[test]
fn test_alloc_free_alloc_reproduces_entry() {
    let fx = fixture();
    let span = Span::persistent(fx.start.add(3 * PAGE_SIZE), 1, SpanClass::make(6, false), 256, 0);

    fx.heap.log_span_alloc(&span).unwrap();
    let first = span_log_word(&fx.heap, &span);
    assert_ne!(first, 0);

    fx.heap.log_span_free(&span).unwrap();
    assert_eq!(span_log_word(&fx.heap, &span), 0);

    fx.heap.log_span_alloc(&span.clone().with_needs_zero(true)).unwrap();
    let second = span_log_word(&fx.heap, &span);
    assert_eq!(first & !1, second & !1);
    assert_eq!(second & 1, 1);
}

#[test]
fn test_class_change_on_reuse_is_corruption() {
    let fx = fixture();
    let base = fx.start.add(PAGE_SIZE);
    fx.heap
        .log_span_alloc(&Span::persistent(base, 1, SpanClass::make(5, false), 128, 0))
        .unwrap();

    let err = fx
        .heap
        .log_span_alloc(&Span::persistent(base, 1, SpanClass::make(7, false), 512, 0))
        .unwrap_err();
    assert!(matches!(err, PmemError::SpanLogMismatch { .. }));
    assert!(err.is_corruption());
    assert_eq!(err.code(), "E302");
}

#[test]
fn test_volatile_span_is_rejected() {
    let fx = fixture();
    let span = Span::persistent(fx.start, 1, SpanClass::make(2, false), 16, 0)
        .with_mem_type(MemType::Volatile);
    for err in [
        fx.heap.log_span_alloc(&span).map(|_| ()).unwrap_err(),
        fx.heap.log_span_free(&span).unwrap_err(),
        fx.heap.log_heap_bits(&span, span.base, &[1], None).unwrap_err(),
    ] {
        assert!(matches!(err, PmemError::InvalidSpan { .. }), "{}", err);
        assert!(err.is_fatal());
    }
}

#[test]
fn test_clear_requires_whole_granules() {
    let fx = fixture();
    let err = fx.heap.clear_heap_bits(fx.start, 40).unwrap_err();
    assert!(matches!(err, PmemError::InvalidArgument { .. }));
    fx.heap.clear_heap_bits(fx.start, 64).unwrap();
}

#[test]
fn test_one_descriptor_for_many_objects() {
    let fx = fixture();
    let ty = TypeIndex::new(77).unwrap();
    let desc = TypeDescriptor::from_layout(ty, 0, &Record);
    // class 6 = 256-byte objects in the power-of-two table
    let span = Span::persistent(fx.start, 1, SpanClass::make(6, false), 256, 0)
        .with_type_index(ty);

    fx.heap.log_span_alloc(&span).unwrap();
    let objects = PAGE_SIZE / 256;
    for i in 0..objects {
        fx.heap
            .log_heap_bits(&span, span.base.add(i * 256), &[], Some(&desc))
            .unwrap();
    }
    fx.heap.checkpoint().unwrap();

    let snap = fx.heap.stats_snapshot();
    assert_eq!(snap.descriptor_writes, 1);
    assert_eq!(snap.descriptor_skips, objects - 1);
    assert_eq!(snap.heap_bit_bytes, 0);
}

#[test]
fn test_descriptor_bits_match_direct_bits_after_restart() {
    let fx = fixture();
    let ty = TypeIndex::new(9).unwrap();
    let desc = TypeDescriptor::from_layout(ty, 0, &Record);

    // Optimized span on page 0, direct span holding one equivalent object on page 1.
    let optimized = Span::persistent(fx.start, 1, SpanClass::make(6, false), 256, 0)
        .with_type_index(ty);
    let direct = Span::persistent(fx.start.add(PAGE_SIZE), 1, SpanClass::make(6, false), 256, 0);

    fx.heap.log_span_alloc(&optimized).unwrap();
    fx.heap
        .log_heap_bits(&optimized, optimized.base, &[], Some(&desc))
        .unwrap();

    let mut bits = vec![0u8; (256 / GRANULE_SIZE) as usize];
    encode_object_bits(&mut bits, 0, 256 / WORD_SIZE, &Record).unwrap();
    let object = direct.base.add(512);
    fx.heap.log_span_alloc(&direct).unwrap();
    fx.heap.log_heap_bits(&direct, object, &bits, None).unwrap();
    fx.heap.checkpoint().unwrap();

    let (_dir, heap) = restart(fx);
    let report = heap.recovery_report().unwrap();
    assert_eq!(report.spans().count(), 2);

    let expected: Vec<bool> = report.object_bits(object, 256).collect();
    assert_eq!(expected, vec![true, false, true, true]);
    for i in [0, 5, PAGE_SIZE / 256 - 1] {
        let addr = optimized.base.add(i * 256);
        assert_eq!(report.object_bits(addr, 256).collect::<Vec<_>>(), expected);
        assert_eq!(
            report.pointer_slots(addr, 256),
            vec![addr, addr.add(16), addr.add(24)]
        );
    }

    let recovered = report.span_at(optimized.base).unwrap();
    assert!(recovered.optimized);
    assert_eq!(recovered.descriptor.as_ref(), Some(&desc));
}

#[test]
fn test_freed_span_is_free_after_restart() {
    let fx = fixture();
    let kept = Span::persistent(fx.start.add(2 * PAGE_SIZE), 1, SpanClass::make(2, true), 16, 0);
    let freed = Span::persistent(fx.start.add(4 * PAGE_SIZE), 5, SpanClass::make(0, false), 5 * PAGE_SIZE, 0);
    fx.heap.log_span_alloc(&kept).unwrap();
    fx.heap.log_span_alloc(&freed).unwrap();
    fx.heap.log_span_free(&freed).unwrap();

    let (_dir, heap) = restart(fx);
    let report = heap.recovery_report().unwrap();
    let arena = &report.arenas[0];
    assert_eq!(arena.spans.len(), 1);
    assert_eq!(arena.spans[0].span_class, SpanClass::make(2, true));
    assert_eq!(arena.free_ranges()[0], (arena.data_start, 2));
    assert_eq!(arena.free_ranges()[1].0, kept.end());

    let states = arena.page_states();
    assert_eq!(states[2], PageState::Allocated {
        span_base: kept.base,
        span_class: kept.span_class
    });
    assert!(states[4..9].iter().all(|s| *s == PageState::Free));
}

#[test]
fn test_flush_and_fence_discipline() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(RecordingPlatform::new(Arc::new(LinuxPlatform::new(false))));
    let heap = PmemHeap::with_platform(
        PmemConfig::default().with_directory(dir.path()),
        platform.clone(),
    );
    let start = heap.init("discipline", SIZE, 0).unwrap().start;
    let span = Span::persistent(start, 1, SpanClass::make(4, false), 64, 0);
    let arena = heap.region().unwrap().arena(0).unwrap();
    let slot = arena.base_pos().as_u64() + arena.layout().span_bitmap_offset;

    // Allocation: one 4-byte flush, fence left to the checkpoint.
    platform.clear();
    heap.log_span_alloc(&span).unwrap();
    assert_eq!(platform.ops(), vec![PersistOp::Flush { file_pos: slot, len: 4 }]);

    heap.log_heap_bits(&span, span.base.add(64), &[0x33, 0x00], None).unwrap();
    assert_eq!(platform.fence_count(), 0);
    heap.checkpoint().unwrap();
    assert_eq!(platform.fence_count(), 1);

    // Free: persisted on its own.
    platform.clear();
    heap.log_span_free(&span).unwrap();
    assert_eq!(
        platform.ops(),
        vec![PersistOp::Flush { file_pos: slot, len: 4 }, PersistOp::Fence]
    );

    // Descriptor: body persisted before the tag is flushed.
    let ty = TypeIndex::new(3).unwrap();
    let typed = Span::persistent(start.add(PAGE_SIZE), 1, SpanClass::make(6, false), 256, 0)
        .with_type_index(ty);
    heap.log_span_alloc(&typed).unwrap();
    platform.clear();
    let desc = TypeDescriptor::from_layout(ty, 0, &Record);
    heap.log_heap_bits(&typed, typed.base, &[], Some(&desc)).unwrap();

    let window = arena.base_pos().as_u64() + arena.layout().type_bitmap_offset + 256;
    let ops = platform.ops();
    assert_eq!(ops.len(), 3);
    assert!(ops[0].covers(window + 8, (desc.record_len() - 8) as usize));
    assert_eq!(ops[1], PersistOp::Fence);
    assert_eq!(ops[2], PersistOp::Flush { file_pos: window, len: 8 });
}

#[test]
fn test_crash_before_descriptor_after_direct_reuse_recovers() {
    let fx = fixture();
    let direct = Span::persistent(fx.start, 1, SpanClass::make(6, false), 256, 0);
    fx.heap.log_span_alloc(&direct).unwrap();
    fx.heap
        .log_heap_bits(&direct, direct.base, &[0x11; 64], None)
        .unwrap();
    fx.heap.log_span_free(&direct).unwrap();

    // The page comes back as an optimized span, and the process dies right
    // after the span-log store, before any descriptor is written.
    let ty = TypeIndex::new(21).unwrap();
    let typed = direct.clone().with_type_index(ty);
    {
        let arena = fx.heap.region().unwrap().arena(0).unwrap();
        SpanLog::new(&arena, fx.heap.platform(), fx.heap.stats())
            .log_alloc(&typed)
            .unwrap();
    }
    fx.heap.checkpoint().unwrap();

    let (_dir, heap) = restart(fx);
    let report = heap.recovery_report().unwrap();
    let span = report.span_at(typed.base).unwrap();
    assert!(span.optimized);
    assert_eq!(span.descriptor, None);
    assert!(report.pointer_slots(typed.base, 256).is_empty());
}

#[test]
fn test_large_span_with_type_index_is_rejected() {
    let fx = fixture();
    let ty = TypeIndex::new(0xff).unwrap();
    let large = Span::persistent(fx.start, 5, SpanClass::make(0, false), 5 * PAGE_SIZE, 0)
        .with_type_index(ty);
    let desc = TypeDescriptor::new(ty, 0, 5 * PAGE_SIZE, &[false; 4]);

    let err = fx.heap.log_span_alloc(&large).unwrap_err();
    assert!(matches!(err, PmemError::InvalidSpan { .. }));
    let err = fx
        .heap
        .log_heap_bits(&large, large.base, &[], Some(&desc))
        .unwrap_err();
    assert!(matches!(err, PmemError::InvalidSpan { .. }));

    // Logged directly, the same all-scalar object recovers with no pointers.
    let plain = Span::persistent(fx.start, 5, SpanClass::make(0, false), 5 * PAGE_SIZE, 0);
    fx.heap.log_span_alloc(&plain).unwrap();
    fx.heap.log_heap_bits(&plain, plain.base, &[0; 4], None).unwrap();
    fx.heap.checkpoint().unwrap();

    let (_dir, heap) = restart(fx);
    let report = heap.recovery_report().unwrap();
    assert!(report.pointer_slots(plain.base, 5 * PAGE_SIZE).is_empty());
}

#[test]
fn test_oversized_descriptor_is_rejected_before_it_reaches_media() {
    let fx = fixture();
    let ty = TypeIndex::new(4).unwrap();
    // class 4 = 64-byte objects
    let span = Span::persistent(fx.start, 1, SpanClass::make(4, false), 64, 0).with_type_index(ty);
    fx.heap.log_span_alloc(&span).unwrap();

    let oversized = TypeDescriptor::new(ty, 0, 128, &[true]);
    let err = fx
        .heap
        .log_heap_bits(&span, span.base, &[], Some(&oversized))
        .unwrap_err();
    assert!(matches!(err, PmemError::InvalidArgument { .. }));
    fx.heap.checkpoint().unwrap();

    let (_dir, heap) = restart(fx);
    let report = heap.recovery_report().unwrap();
    assert_eq!(report.span_at(span.base).unwrap().descriptor, None);
}

