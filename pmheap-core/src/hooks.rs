//! Allocator-facing logging hooks.
//!
//! The host allocator calls these on every persistent allocation and free.
//! They return nothing: a failed log write means crash consistency is gone,
//! so the error is logged and the process is terminated on the spot.

use crate::error::PmemError;
use crate::log::TypeDescriptor;
use crate::region::PmemHeap;
use crate::types::{PmemAddr, Span};

/// Logging entry points for the host allocator.
pub trait AllocatorHooks {
    /// A span was allocated.
    fn log_span_alloc(&self, span: &Span);

    /// A span was freed.
    fn log_span_free(&self, span: &Span);

    /// An object at `addr` was allocated in `span`.
    fn log_heap_bits(
        &self,
        span: &Span,
        addr: PmemAddr,
        bits: &[u8],
        descriptor: Option<&TypeDescriptor>,
    );

    /// A reused allocation of `size` bytes at `addr` holds no pointers.
    fn clear_heap_bits(&self, addr: PmemAddr, size: u64);

    /// The allocation operation is complete.
    fn checkpoint(&self);
}

impl AllocatorHooks for PmemHeap {
    fn log_span_alloc(&self, span: &Span) {
        if let Err(e) = PmemHeap::log_span_alloc(self, span) {
            fatal("log_span_alloc", &e);
        }
    }

    fn log_span_free(&self, span: &Span) {
        if let Err(e) = PmemHeap::log_span_free(self, span) {
            fatal("log_span_free", &e);
        }
    }

    fn log_heap_bits(
        &self,
        span: &Span,
        addr: PmemAddr,
        bits: &[u8],
        descriptor: Option<&TypeDescriptor>,
    ) {
        if let Err(e) = PmemHeap::log_heap_bits(self, span, addr, bits, descriptor) {
            fatal("log_heap_bits", &e);
        }
    }

    fn clear_heap_bits(&self, addr: PmemAddr, size: u64) {
        if let Err(e) = PmemHeap::clear_heap_bits(self, addr, size) {
            fatal("clear_heap_bits", &e);
        }
    }

    fn checkpoint(&self) {
        if let Err(e) = PmemHeap::checkpoint(self) {
            fatal("checkpoint", &e);
        }
    }
}

fn fatal(operation: &'static str, err: &PmemError) -> ! {
    tracing::error!(
        operation,
        code = err.code(),
        error = %err,
        "Persistent memory logging failed, terminating"
    );
    std::process::abort()
}
