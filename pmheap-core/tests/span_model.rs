//! Randomized allocation, free, and restart against an in-memory model.

#![cfg(target_os = "linux")]

use pmheap_core::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

const SIZE: u64 = MIN_REGION_SIZE;
const PAGES: u64 = 192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Live {
    pages: u64,
    span_class: SpanClass,
    needs_zero: bool,
}

struct Model {
    live: BTreeMap<u64, Live>,
}

impl Model {
    fn is_free(&self, page: u64, pages: u64) -> bool {
        page + pages <= PAGES
            && self
                .live
                .range(..page + pages)
                .next_back()
                .is_none_or(|(&head, span)| head + span.pages <= page)
    }
}

fn random_span(rng: &mut StdRng, classes: &StaticSizeClasses) -> Live {
    if rng.gen_bool(0.2) {
        Live {
            pages: rng.gen_range(5..=9),
            span_class: SpanClass::make(0, rng.gen_bool(0.5)),
            needs_zero: rng.gen_bool(0.5),
        }
    } else {
        let class = rng.gen_range(1..classes.class_count());
        Live {
            pages: classes.span_pages(class).unwrap(),
            span_class: SpanClass::make(class, rng.gen_bool(0.5)),
            needs_zero: rng.gen_bool(0.5),
        }
    }
}

fn to_span(start: PmemAddr, page: u64, live: &Live, classes: &StaticSizeClasses) -> Span {
    let elem = if live.span_class.size_class() == 0 {
        live.pages * PAGE_SIZE
    } else {
        classes.object_size(live.span_class.size_class()).unwrap()
    };
    Span::persistent(start.add(page * PAGE_SIZE), live.pages, live.span_class, elem, 0)
        .with_needs_zero(live.needs_zero)
}

fn open(dir: &std::path::Path) -> (PmemHeap, PmemAddr) {
    let heap = PmemHeap::new(PmemConfig::default().with_directory(dir));
    let start = heap.init("model", SIZE, 0).unwrap().start;
    (heap, start)
}

fn check(heap: &PmemHeap, start: PmemAddr, model: &Model) {
    let report = heap.recovery_report().unwrap();
    let recovered: BTreeMap<u64, Live> = report.arenas[0]
        .spans
        .iter()
        .map(|s| {
            (
                s.page,
                Live {
                    pages: s.pages,
                    span_class: s.span_class,
                    needs_zero: s.needs_zero,
                },
            )
        })
        .collect();
    assert_eq!(recovered, model.live);
    for (&page, live) in &model.live {
        let span = report.span_at(start.add(page * PAGE_SIZE)).unwrap();
        assert_eq!(span.pages, live.pages);
    }
}

#[test]
fn test_random_alloc_free_restart_matches_model() {
    for seed in [1u64, 7, 42] {
        let dir = tempfile::tempdir().unwrap();
        let classes = StaticSizeClasses::power_of_two();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut model = Model {
            live: BTreeMap::new(),
        };
        let (mut heap, mut start) = open(dir.path());

        for step in 0..400 {
            match rng.gen_range(0..10) {
                0..=5 => {
                    let live = random_span(&mut rng, &classes);
                    let page = rng.gen_range(0..PAGES);
                    if model.is_free(page, live.pages) {
                        let span = to_span(start, page, &live, &classes);
                        assert_eq!(
                            heap.log_span_alloc(&span).unwrap(),
                            SpanLogOutcome::Written,
                            "seed {} step {}",
                            seed,
                            step
                        );
                        model.live.insert(page, live);
                    }
                }
                6..=8 => {
                    let Some(&page) = model
                        .live
                        .keys()
                        .nth(rng.gen_range(0..model.live.len().max(1)))
                    else {
                        continue;
                    };
                    let live = model.live.remove(&page).unwrap();
                    heap.log_span_free(&to_span(start, page, &live, &classes))
                        .unwrap();
                }
                _ => {
                    drop(heap);
                    (heap, start) = open(dir.path());
                    check(&heap, start, &model);

                    // Re-logging a live span after restart is a no-op.
                    if let Some((&page, live)) = model.live.iter().next() {
                        let span = to_span(start, page, live, &classes);
                        assert_eq!(heap.log_span_alloc(&span).unwrap(), SpanLogOutcome::Skipped);
                    }
                }
            }
        }

        drop(heap);
        let (heap, start) = open(dir.path());
        check(&heap, start, &model);
    }
}
