//! Core types for the persistent heap.
//!
//! - `PmemAddr`: byte position in the backing file, the only address form
//!   the crate hands out
//! - `SpanClass`: size class plus no-scan flag of an allocator span
//! - `TypeIndex`: identifier of a type descriptor shared by a whole span
//! - `Span`: the allocator unit that is logged

mod address;
mod ids;
mod span;

pub use address::PmemAddr;
pub use ids::{SpanClass, TypeIndex};
pub use span::{MemType, Span};

/// Allocator page size in bytes.
pub const PAGE_SIZE: u64 = 8192;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 13;

/// Size of a pointer-sized heap word.
pub const WORD_SIZE: u64 = 8;

/// Number of data bytes described by one heap-bitmap byte.
pub const GRANULE_SIZE: u64 = 32;

/// Heap words described by one heap-bitmap byte.
pub const WORDS_PER_GRANULE: u64 = GRANULE_SIZE / WORD_SIZE;

/// Largest object size served from a small (size-classed) span.
pub const MAX_SMALL_SIZE: u64 = 32 * 1024;

/// Region sizes must be a multiple of this, and at least this large once the
/// reserved prefix is subtracted.
pub const MIN_REGION_SIZE: u64 = 64 * 1024 * 1024;

/// Round `value` up to a multiple of `align` (a power of two).
#[must_use]
pub const fn round_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}
