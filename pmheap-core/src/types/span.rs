//! The allocator span as seen by the logging layer.

use super::{MAX_SMALL_SIZE, PAGE_SHIFT, PmemAddr, SpanClass, TypeIndex};

/// Memory a span was carved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemType {
    /// Byte-addressable persistent memory; allocation is logged.
    Persistent,
    /// Ordinary volatile heap; never logged.
    Volatile,
}

/// A contiguous run of pages handed out by the host allocator as one unit.
///
/// The allocator owns spans; this crate only reads them to log allocation
/// state. At most one allocation or free is in flight for a given span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    /// Address of the first page.
    pub base: PmemAddr,
    /// Number of pages.
    pub pages: u64,
    /// Size class and no-scan flag.
    pub span_class: SpanClass,
    /// Size of each object in the span in bytes.
    pub elem_size: u64,
    /// Whether the span's memory must be zeroed before reuse.
    pub needs_zero: bool,
    /// Memory the span lives in.
    pub mem_type: MemType,
    /// File offset of the arena that owns the span.
    pub arena: u64,
    /// Shared type descriptor index, set when every object in the span has
    /// the same type.
    pub type_index: Option<TypeIndex>,
}

impl Span {
    /// Create a persistent span.
    pub fn persistent(
        base: PmemAddr,
        pages: u64,
        span_class: SpanClass,
        elem_size: u64,
        arena: u64,
    ) -> Self {
        Self {
            base,
            pages,
            span_class,
            elem_size,
            needs_zero: false,
            mem_type: MemType::Persistent,
            arena,
            type_index: None,
        }
    }

    /// Set the needs-zero flag.
    pub fn with_needs_zero(mut self, needs_zero: bool) -> Self {
        self.needs_zero = needs_zero;
        self
    }

    /// Mark every object in the span as sharing one type descriptor.
    pub fn with_type_index(mut self, type_index: TypeIndex) -> Self {
        self.type_index = Some(type_index);
        self
    }

    /// Set the memory type.
    pub fn with_mem_type(mut self, mem_type: MemType) -> Self {
        self.mem_type = mem_type;
        self
    }

    /// Whether the span holds a single large object.
    #[must_use]
    pub fn is_large(&self) -> bool {
        self.elem_size > MAX_SMALL_SIZE
    }

    /// Whether the span is in persistent memory.
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.mem_type == MemType::Persistent
    }

    /// Span length in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.pages << PAGE_SHIFT
    }

    /// First address past the span.
    #[must_use]
    pub fn end(&self) -> PmemAddr {
        self.base.add(self.size_bytes())
    }

    /// Whether `addr` lies inside the span.
    #[must_use]
    pub fn contains(&self, addr: PmemAddr) -> bool {
        addr >= self.base && addr < self.end()
    }
}
