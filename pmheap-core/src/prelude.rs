//! Prelude for convenient imports.
//!
//! This module re-exports the most commonly used types and traits.
//!
//! # Example
//!
//! ```ignore
//! use pmheap_core::prelude::*;
//! ```

// Core types
pub use crate::types::{
    GRANULE_SIZE, MIN_REGION_SIZE, MemType, PAGE_SIZE, PmemAddr, Span, SpanClass, TypeIndex,
    WORD_SIZE,
};

// Error handling
pub use crate::error::{PmemError, Result};

// Configuration and platform
pub use crate::config::PmemConfig;
pub use crate::persist::{MappedExtent, PmemPlatform, default_platform};

// Region
pub use crate::region::{InitOutcome, PmemHeap, Region, RegionState};

// Arenas
pub use crate::arena::{Arena, ArenaField, UndoLog};

// Logs
pub use crate::log::{
    HeapBitmap, HeapBitsIter, PointerLayout, SpanLogOutcome, TypeDescriptor, encode_object_bits,
};

// Recovery
pub use crate::classes::{SizeClassTable, StaticSizeClasses};
pub use crate::recovery::{PageState, RecoveredArena, RecoveredSpan, RecoveryReport};

// Hooks and statistics
pub use crate::hooks::AllocatorHooks;
pub use crate::stats::{LogStats, LogStatsSnapshot};
