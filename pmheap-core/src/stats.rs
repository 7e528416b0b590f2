//! Logging counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the persistent logs.
///
/// Updated with relaxed atomics on the allocation path; read through
/// [`LogStats::snapshot`].
#[derive(Debug, Default)]
pub struct LogStats {
    span_writes: AtomicU64,
    span_skips: AtomicU64,
    span_frees: AtomicU64,
    heap_bit_bytes: AtomicU64,
    descriptor_writes: AtomicU64,
    descriptor_skips: AtomicU64,
    clears: AtomicU64,
    undo_commits: AtomicU64,
    undo_reverts: AtomicU64,
    undo_resets: AtomicU64,
}

/// Point-in-time copy of [`LogStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LogStatsSnapshot {
    /// Span-log slots written.
    pub span_writes: u64,
    /// Span-log writes skipped because the slot already matched.
    pub span_skips: u64,
    /// Span-log slots cleared by frees.
    pub span_frees: u64,
    /// Heap-bitmap bytes copied in direct mode.
    pub heap_bit_bytes: u64,
    /// Type descriptor records written.
    pub descriptor_writes: u64,
    /// Descriptor writes skipped because the record was already present.
    pub descriptor_skips: u64,
    /// Heap-bitmap clear requests.
    pub clears: u64,
    /// Undo transactions committed.
    pub undo_commits: u64,
    /// Undo transactions reverted.
    pub undo_reverts: u64,
    /// Undo transactions discarded.
    pub undo_resets: u64,
}

impl LogStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn span_write(&self) {
        self.span_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn span_skip(&self) {
        self.span_skips.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn span_free(&self) {
        self.span_frees.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn heap_bits(&self, bytes: u64) {
        self.heap_bit_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn descriptor_write(&self) {
        self.descriptor_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn descriptor_skip(&self) {
        self.descriptor_skips.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn clear(&self) {
        self.clears.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn undo_commit(&self) {
        self.undo_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn undo_revert(&self) {
        self.undo_reverts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn undo_reset(&self) {
        self.undo_resets.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of all counters.
    pub fn snapshot(&self) -> LogStatsSnapshot {
        LogStatsSnapshot {
            span_writes: self.span_writes.load(Ordering::Relaxed),
            span_skips: self.span_skips.load(Ordering::Relaxed),
            span_frees: self.span_frees.load(Ordering::Relaxed),
            heap_bit_bytes: self.heap_bit_bytes.load(Ordering::Relaxed),
            descriptor_writes: self.descriptor_writes.load(Ordering::Relaxed),
            descriptor_skips: self.descriptor_skips.load(Ordering::Relaxed),
            clears: self.clears.load(Ordering::Relaxed),
            undo_commits: self.undo_commits.load(Ordering::Relaxed),
            undo_reverts: self.undo_reverts.load(Ordering::Relaxed),
            undo_resets: self.undo_resets.load(Ordering::Relaxed),
        }
    }
}
