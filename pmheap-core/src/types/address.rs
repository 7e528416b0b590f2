//! Addresses inside the persistent region.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A byte position in the persistent backing file.
///
/// The region is reconstructed at whatever virtual address the mapping lands
/// on after a restart, so everything that is logged or recovered is
/// expressed relative to the start of the file instead of as a raw pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct PmemAddr(u64);

impl PmemAddr {
    /// Position zero of the backing file.
    pub const ZERO: Self = Self(0);

    /// Create an address from a file position.
    #[must_use]
    pub const fn new(pos: u64) -> Self {
        Self(pos)
    }

    /// Get the raw file position.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Add a byte offset.
    #[must_use]
    pub const fn add(&self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    /// Number of bytes from `base` to this address, or `None` if `base` lies
    /// above it.
    #[must_use]
    pub const fn offset_from(&self, base: Self) -> Option<u64> {
        self.0.checked_sub(base.0)
    }

    /// Check whether the address is a multiple of `align` (a power of two).
    #[must_use]
    pub const fn is_aligned(&self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }
}

impl fmt::Display for PmemAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:010x}", self.0)
    }
}

impl From<u64> for PmemAddr {
    fn from(pos: u64) -> Self {
        Self(pos)
    }
}
