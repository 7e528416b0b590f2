//! Recording of persistence primitives.
//!
//! Wraps a real platform and records every flush and fence in order, so
//! tests can assert the exact ranges written back and where the ordering
//! barriers fall.

use crate::error::Result;
use crate::persist::{MappedExtent, PmemPlatform};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// A persistence primitive observed by [`RecordingPlatform`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PersistOp {
    /// A range was written back.
    Flush {
        /// File position of the first byte.
        file_pos: u64,
        /// Number of bytes.
        len: usize,
    },
    /// An ordering barrier.
    Fence,
}

impl PersistOp {
    /// Whether this is a flush covering `[file_pos, file_pos + len)`.
    pub fn covers(&self, pos: u64, len: usize) -> bool {
        match *self {
            Self::Flush {
                file_pos,
                len: flushed,
            } => pos >= file_pos && pos + len as u64 <= file_pos + flushed as u64,
            Self::Fence => false,
        }
    }
}

/// Platform wrapper that records flushes and fences.
pub struct RecordingPlatform {
    inner: Arc<dyn PmemPlatform>,
    ops: RwLock<Vec<PersistOp>>,
}

impl RecordingPlatform {
    /// Record the primitives issued to `inner`.
    pub fn new(inner: Arc<dyn PmemPlatform>) -> Self {
        Self {
            inner,
            ops: RwLock::new(Vec::new()),
        }
    }

    /// All recorded operations, oldest first.
    pub fn ops(&self) -> Vec<PersistOp> {
        self.ops.read().clone()
    }

    /// Number of recorded operations.
    pub fn len(&self) -> usize {
        self.ops.read().len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.ops.read().is_empty()
    }

    /// Number of recorded fences.
    pub fn fence_count(&self) -> usize {
        self.ops
            .read()
            .iter()
            .filter(|op| matches!(op, PersistOp::Fence))
            .count()
    }

    /// Index of the first flush covering the range, if any.
    pub fn position_of_flush(&self, file_pos: u64, len: usize) -> Option<usize> {
        self.ops.read().iter().position(|op| op.covers(file_pos, len))
    }

    /// Whether a fence was recorded after operation `index`.
    pub fn fenced_after(&self, index: usize) -> bool {
        self.ops
            .read()
            .iter()
            .skip(index + 1)
            .any(|op| matches!(op, PersistOp::Fence))
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.ops.write().clear();
    }
}

impl PmemPlatform for RecordingPlatform {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn map_file(&self, path: &Path, file_pos: u64, len: u64) -> Result<MappedExtent> {
        self.inner.map_file(path, file_pos, len)
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        self.inner.file_size(path)
    }

    fn flush_range(&self, extent: &MappedExtent, offset: usize, len: usize) -> Result<()> {
        self.inner.flush_range(extent, offset, len)?;
        self.ops.write().push(PersistOp::Flush {
            file_pos: extent.file_pos() + offset as u64,
            len,
        });
        Ok(())
    }

    fn fence(&self) -> Result<()> {
        self.inner.fence()?;
        self.ops.write().push(PersistOp::Fence);
        Ok(())
    }
}
