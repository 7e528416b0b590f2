//! pmheap core library
//!
//! Crash-consistent logging for a garbage-collected heap that lives partly
//! in byte-addressable persistent memory.
//!
//! # Overview
//!
//! The host allocator and collector stay in charge of allocation policy and
//! tracing. This crate records, on every persistent allocation and free,
//! just enough to rebuild their state after an unclean shutdown: which pages
//! are allocated and with which size class, and which heap words hold
//! pointers.
//!
//! # Key Components
//!
//! - **Region**: the backing file, its first-run header and the arena chain
//! - **Arena**: self-describing extent with its logs and a 2-entry undo log
//! - **Span log**: one word per page recording allocated spans
//! - **Heap bitmap log**: per-granule pointer bits, or one type descriptor
//!   per span
//! - **Recovery**: rebuilds page state and pointer bitmaps on restart
//!
//! # Example
//!
//! ```ignore
//! use pmheap_core::prelude::*;
//!
//! let heap = PmemHeap::new(PmemConfig::default().with_directory("/mnt/pmem"));
//! let outcome = heap.init("heap", 256 << 20, 0)?;
//!
//! let span = Span::persistent(outcome.start, 1, SpanClass::make(4, false), 64, 0);
//! heap.log_span_alloc(&span)?;
//! heap.log_heap_bits(&span, span.base, &bits, None)?;
//! heap.checkpoint()?;
//!
//! // After a restart:
//! if let Some(report) = heap.recovery_report() {
//!     for span in report.spans() { /* rebuild allocator state */ }
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arena;
pub mod classes;
pub mod config;
pub mod error;
pub mod hooks;
pub mod log;
pub mod persist;
pub mod prelude;
pub mod recovery;
pub mod region;
pub mod stats;
pub mod testing;
pub mod types;

// Re-export key types at crate root for convenience
pub use config::PmemConfig;
pub use error::{PmemError, Result};
pub use hooks::AllocatorHooks;
pub use region::{InitOutcome, PmemHeap, RegionState};
pub use types::{MemType, PmemAddr, Span, SpanClass, TypeIndex};
