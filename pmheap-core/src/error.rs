//! Error types for the persistent heap.
//!
//! Every error carries the address, offset, or path it concerns so that a
//! failure report points at the exact place in the backing store. Errors are
//! grouped by numeric code the same way across the crate:
//!
//! - `E0xx` region setup and configuration
//! - `E1xx` logging requests from the allocator
//! - `E2xx` arena undo log
//! - `E3xx` corruption of the on-media image
//! - `E4xx` platform capability and I/O

use crate::types::{PmemAddr, SpanClass};
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for persistent heap operations.
#[derive(Error, Debug)]
pub enum PmemError {
    // =========================================================================
    // Region Errors (E001-E099)
    // =========================================================================
    /// Invalid size, offset, or other configuration value.
    #[error("E001: Invalid persistent memory configuration: {cause}")]
    Config {
        /// Description of the invalid value.
        cause: String,
    },

    /// Initialization already done or currently running.
    #[error("E002: Persistent memory is already initialized or initialization is ongoing ({state})")]
    AlreadyInitialized {
        /// Region state observed by the failed caller.
        state: &'static str,
    },

    /// The region recorded a different size than the caller requested.
    #[error("E003: Region size mismatch: recorded {recorded} bytes, requested {requested} bytes")]
    SizeMismatch {
        /// Size stored in the region header.
        recorded: u64,
        /// Size passed to initialization.
        requested: u64,
    },

    /// Operation requires a ready region.
    #[error("E004: Persistent memory region is not ready ({state})")]
    NotReady {
        /// Current region state.
        state: &'static str,
    },

    /// Failed to map the backing file.
    #[error("E005: Failed to map {path} at {file_pos}+{len}: {cause}")]
    Map {
        /// Backing file path.
        path: PathBuf,
        /// File position of the requested mapping.
        file_pos: u64,
        /// Length of the requested mapping.
        len: u64,
        /// Reason for the failure.
        cause: String,
    },

    // =========================================================================
    // Logging Errors (E100-E199)
    // =========================================================================
    /// Logging request against a span that cannot be logged.
    #[error("E101: Invalid span at {base}: {cause}")]
    InvalidSpan {
        /// Span base address.
        base: PmemAddr,
        /// Why the span was rejected.
        cause: String,
    },

    /// Invalid argument to a logging routine.
    #[error("E102: Invalid argument: {cause}")]
    InvalidArgument {
        /// Description of the invalid argument.
        cause: String,
    },

    /// Address outside the managed range.
    #[error("E103: Address {addr} outside persistent range [{start}, {end}]")]
    AddressOutOfRange {
        /// The offending address.
        addr: PmemAddr,
        /// First managed address.
        start: PmemAddr,
        /// Last managed address (inclusive).
        end: PmemAddr,
    },

    /// Access outside the bounds of a mapped extent.
    #[error("E104: Access at extent offset {offset} (+{len}) out of bounds or misaligned: {cause}")]
    ExtentAccess {
        /// Offset within the mapped extent.
        offset: usize,
        /// Length of the access.
        len: usize,
        /// Reason the access was rejected.
        cause: &'static str,
    },

    // =========================================================================
    // Undo Log Errors (E200-E299)
    // =========================================================================
    /// Undo log has no free slot.
    #[error("E201: No more space in arena {arena} undo log ({capacity} entries outstanding)")]
    UndoLogFull {
        /// File offset of the arena.
        arena: u64,
        /// Undo log capacity.
        capacity: usize,
    },

    /// Undo log target outside the arena or misaligned.
    #[error("E202: Invalid undo log target at arena offset {offset}: {cause}")]
    UndoLogTarget {
        /// Offset of the target within the arena.
        offset: u64,
        /// Reason the target was rejected.
        cause: String,
    },

    // =========================================================================
    // Corruption Errors (E300-E399)
    // =========================================================================
    /// The persistent image is inconsistent.
    #[error("E301: Persistent memory corruption at {addr}: {cause}")]
    Corruption {
        /// Address where corruption was detected.
        addr: PmemAddr,
        /// Description of the corruption.
        cause: String,
    },

    /// A reused span-log slot disagrees with the span being logged.
    #[error(
        "E302: Logged span information mismatch at page {page}: logged {logged:#010x}, requested {requested:#010x} (class {span_class})"
    )]
    SpanLogMismatch {
        /// Page index within the arena.
        page: u64,
        /// Value found in the log.
        logged: u32,
        /// Value the caller tried to log.
        requested: u32,
        /// Span class of the span being logged.
        span_class: SpanClass,
    },

    // =========================================================================
    // Platform Errors (E400-E499)
    // =========================================================================
    /// The platform lacks a persistence primitive.
    #[error("E401: Persistence primitive '{operation}' is not implemented on this platform")]
    Unsupported {
        /// The missing primitive.
        operation: &'static str,
    },

    /// Flushing to the persistence domain failed.
    #[error("E402: Failed to persist {len} bytes at extent offset {offset}: {cause}")]
    Persist {
        /// Offset within the mapped extent.
        offset: usize,
        /// Number of bytes.
        len: usize,
        /// Reason for the failure.
        cause: String,
    },

    /// I/O error on the backing file.
    #[error("E403: I/O error on {path}: {cause}")]
    Io {
        /// Backing file path.
        path: PathBuf,
        /// Reason for the failure.
        cause: String,
    },
}

impl PmemError {
    /// Get the error code (e.g., "E001").
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config { .. } => "E001",
            Self::AlreadyInitialized { .. } => "E002",
            Self::SizeMismatch { .. } => "E003",
            Self::NotReady { .. } => "E004",
            Self::Map { .. } => "E005",
            Self::InvalidSpan { .. } => "E101",
            Self::InvalidArgument { .. } => "E102",
            Self::AddressOutOfRange { .. } => "E103",
            Self::ExtentAccess { .. } => "E104",
            Self::UndoLogFull { .. } => "E201",
            Self::UndoLogTarget { .. } => "E202",
            Self::Corruption { .. } => "E301",
            Self::SpanLogMismatch { .. } => "E302",
            Self::Unsupported { .. } => "E401",
            Self::Persist { .. } => "E402",
            Self::Io { .. } => "E403",
        }
    }

    /// Check if this error means crash consistency can no longer be
    /// guaranteed.
    ///
    /// The allocator hooks terminate the process on any error, but callers of
    /// the fallible API use this to decide whether continuing without
    /// persistent memory is an option.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SizeMismatch { .. }
                | Self::InvalidSpan { .. }
                | Self::AddressOutOfRange { .. }
                | Self::UndoLogFull { .. }
                | Self::Corruption { .. }
                | Self::SpanLogMismatch { .. }
                | Self::Unsupported { .. }
                | Self::Persist { .. }
        )
    }

    /// Check if this error is a configuration/state error reported before any
    /// state was changed.
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::Config { .. } | Self::AlreadyInitialized { .. } | Self::NotReady { .. }
        )
    }

    /// Check if this error reports corruption of the persistent image.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corruption { .. } | Self::SpanLogMismatch { .. } | Self::SizeMismatch { .. }
        )
    }

    pub(crate) fn corruption(addr: PmemAddr, cause: impl Into<String>) -> Self {
        Self::Corruption {
            addr,
            cause: cause.into(),
        }
    }

    pub(crate) fn config(cause: impl Into<String>) -> Self {
        Self::Config {
            cause: cause.into(),
        }
    }

    pub(crate) fn invalid_argument(cause: impl Into<String>) -> Self {
        Self::InvalidArgument {
            cause: cause.into(),
        }
    }
}

/// Result type alias using `PmemError`.
pub type Result<T> = std::result::Result<T, PmemError>;
