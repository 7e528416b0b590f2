//! Platform without persistence primitives.

use super::{MappedExtent, PmemPlatform};
use crate::error::{PmemError, Result};
use std::path::Path;

/// Platform stand-in whose every primitive fails.
///
/// Used on targets without a real implementation so that persistent memory
/// initialization fails loudly instead of running without crash consistency.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedPlatform;

impl PmemPlatform for UnsupportedPlatform {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn map_file(&self, _path: &Path, _file_pos: u64, _len: u64) -> Result<MappedExtent> {
        Err(PmemError::Unsupported {
            operation: "map_file",
        })
    }

    fn file_size(&self, _path: &Path) -> Result<u64> {
        Err(PmemError::Unsupported {
            operation: "file_size",
        })
    }

    fn flush_range(&self, _extent: &MappedExtent, _offset: usize, _len: usize) -> Result<()> {
        Err(PmemError::Unsupported {
            operation: "flush_range",
        })
    }

    fn fence(&self) -> Result<()> {
        Err(PmemError::Unsupported { operation: "fence" })
    }
}
