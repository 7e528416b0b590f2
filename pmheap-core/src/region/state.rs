//! Region lifecycle.

use std::fmt;

/// Lifecycle of the persistent region.
///
/// Moves `Uninitialized -> Initializing -> Ready` under compare-and-swap; a
/// failed initialization drops back to `Uninitialized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RegionState {
    /// No region mapped.
    Uninitialized = 0,
    /// One caller is mapping and recovering the region.
    Initializing = 1,
    /// Logging calls are accepted.
    Ready = 2,
}

impl RegionState {
    /// Decode a state stored in an atomic.
    pub const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Initializing,
            2 => Self::Ready,
            _ => Self::Uninitialized,
        }
    }

    /// State name for messages.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
        }
    }
}

impl fmt::Display for RegionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
