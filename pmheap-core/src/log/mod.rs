//! Crash-consistent allocation logs.
//!
//! Two logs live in every arena's metadata:
//!
//! - the **span allocation log**, one little-endian `u32` per data page,
//!   recording which page runs are allocated and with which span class;
//! - the **heap pointer bitmap**, one byte per 32 data bytes, recording
//!   which heap words hold pointers, or, for spans whose objects all share
//!   one type, a single type descriptor record.
//!
//! Both are written synchronously on the allocation and free paths. Each
//! write is flushed; the caller issues the fence at its allocation
//! checkpoint.

mod bits;
mod descriptor;
mod heap_bits;
mod span;

pub use bits::{HeapBitmap, HeapBitsIter, encode_object_bits};
pub use descriptor::{DESCRIPTOR_HEADER_SIZE, PointerLayout, TypeDescriptor};
pub use heap_bits::HeapBitsLog;
pub use span::{
    DecodedSpan, LARGE_SPAN_BIAS, MIN_LARGE_PAGES, NUM_SIZE_CLASSES, SpanLog, SpanLogOutcome,
    SpanLogValue,
};
