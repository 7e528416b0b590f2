//! Configuration for the persistent heap.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for a persistent heap context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PmemConfig {
    /// Directory holding backing files. Region names resolve inside it.
    pub directory: PathBuf,
    /// The backing file lives on a DAX mount, so stores reach the
    /// persistence domain through cache-line write-back alone.
    pub dax: bool,
    /// Take an exclusive advisory lock on the backing file while mapped.
    pub lock_file: bool,
}

impl Default for PmemConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/mnt/pmem"),
            dax: false,
            lock_file: true,
        }
    }
}

impl PmemConfig {
    /// Create a configuration for testing.
    ///
    /// Uses a temporary directory with a unique name per invocation.
    pub fn in_memory() -> Self {
        Self {
            directory: std::env::temp_dir().join(format!("pmheap_{}", uuid::Uuid::new_v4())),
            dax: false,
            lock_file: true,
        }
    }

    /// Set the backing-file directory.
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    /// Declare the backing file to be on a DAX mount.
    pub fn with_dax(mut self, dax: bool) -> Self {
        self.dax = dax;
        self
    }

    /// Enable or disable the advisory file lock.
    pub fn with_lock_file(mut self, lock: bool) -> Self {
        self.lock_file = lock;
        self
    }

    /// Resolve a region name to its backing-file path.
    ///
    /// Absolute names are used as-is.
    pub fn resolve(&self, name: &str) -> PathBuf {
        let path = Path::new(name);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.directory.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_relative_and_absolute() {
        let config = PmemConfig::default().with_directory("/data/pm");
        assert_eq!(config.resolve("heap"), PathBuf::from("/data/pm/heap"));
        assert_eq!(config.resolve("/tmp/heap"), PathBuf::from("/tmp/heap"));
    }

    #[test]
    fn in_memory_dirs_are_unique() {
        assert_ne!(
            PmemConfig::in_memory().directory,
            PmemConfig::in_memory().directory
        );
    }
}
