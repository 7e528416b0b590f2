//! Strongly-typed identifiers carried by spans.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU64;

/// Size class and no-scan flag of a span, packed as `size_class << 1 | noscan`.
///
/// Span class 0 and 1 belong to large spans (size class 0); small spans use
/// size classes starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SpanClass(u8);

impl SpanClass {
    /// Create a span class from its packed representation.
    #[must_use]
    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    /// Create a span class from a size class and no-scan flag.
    #[must_use]
    pub const fn make(size_class: u8, noscan: bool) -> Self {
        Self(size_class << 1 | noscan as u8)
    }

    /// Get the packed representation.
    #[must_use]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    /// Get the size class.
    #[must_use]
    pub const fn size_class(&self) -> u8 {
        self.0 >> 1
    }

    /// Whether objects in the span are known to hold no pointers.
    #[must_use]
    pub const fn noscan(&self) -> bool {
        self.0 & 1 != 0
    }
}

impl fmt::Display for SpanClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.size_class())?;
        if self.noscan() {
            write!(f, "/noscan")?;
        }
        Ok(())
    }
}

/// Identifier of a type descriptor shared by every object of a span.
///
/// Zero is reserved in the persistent log to mean "no descriptor written",
/// so the index is never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TypeIndex(NonZeroU64);

impl TypeIndex {
    /// Create a type index, or `None` for zero.
    #[must_use]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Get the raw value.
    #[must_use]
    pub const fn get(&self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for TypeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type_{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_class_packing() {
        let spc = SpanClass::make(5, true);
        assert_eq!(spc.raw(), 11);
        assert_eq!(spc.size_class(), 5);
        assert!(spc.noscan());
        assert_eq!(spc.to_string(), "5/noscan");
    }

    #[test]
    fn type_index_rejects_zero() {
        assert!(TypeIndex::new(0).is_none());
        assert_eq!(TypeIndex::new(7).map(|t| t.get()), Some(7));
    }
}
