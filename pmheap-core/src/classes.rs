//! Size-class capability.
//!
//! The host allocator owns its size-class policy. Recovery only needs to know,
//! for a small span class, how large its objects are and how many pages one
//! span takes, so that is all this trait asks for.

use crate::error::{PmemError, Result};
use crate::log::NUM_SIZE_CLASSES;
use crate::types::{MAX_SMALL_SIZE, PAGE_SIZE};
use serde::{Deserialize, Serialize};

/// Size-class table of the host allocator. Class 0 is reserved for large
/// spans and never looked up.
pub trait SizeClassTable: Send + Sync {
    /// Number of size classes, including class 0.
    fn class_count(&self) -> u8;

    /// Object size of `size_class`, or `None` for class 0 or an unknown class.
    fn object_size(&self, size_class: u8) -> Option<u64>;

    /// Pages in one span of `size_class`.
    fn span_pages(&self, size_class: u8) -> Option<u64>;
}

/// One row of a [`StaticSizeClasses`] table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeClass {
    /// Object size in bytes.
    pub object_size: u64,
    /// Pages per span.
    pub span_pages: u64,
}

/// Table-backed [`SizeClassTable`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticSizeClasses {
    classes: Vec<SizeClass>,
}

impl StaticSizeClasses {
    /// Build a table from the rows for classes 1, 2, ...
    pub fn new(classes: Vec<SizeClass>) -> Result<Self> {
        if classes.len() + 1 > NUM_SIZE_CLASSES as usize {
            return Err(PmemError::config(format!(
                "{} size classes exceed the loggable maximum of {}",
                classes.len(),
                NUM_SIZE_CLASSES - 1
            )));
        }
        for (i, class) in classes.iter().enumerate() {
            let fits = class.object_size > 0
                && class.object_size <= MAX_SMALL_SIZE
                && class.span_pages > 0
                && class.object_size <= class.span_pages * PAGE_SIZE;
            if !fits {
                return Err(PmemError::config(format!(
                    "size class {} ({} bytes, {} pages) is not a small span class",
                    i + 1,
                    class.object_size,
                    class.span_pages
                )));
            }
        }
        Ok(Self { classes })
    }

    /// Power-of-two classes from 8 bytes to the largest small object size.
    pub fn power_of_two() -> Self {
        let classes = std::iter::successors(Some(8u64), |s| Some(s * 2))
            .take_while(|s| *s <= MAX_SMALL_SIZE)
            .map(|object_size| SizeClass {
                object_size,
                span_pages: (object_size / PAGE_SIZE).max(1),
            })
            .collect();
        Self { classes }
    }

    fn row(&self, size_class: u8) -> Option<&SizeClass> {
        (size_class as usize)
            .checked_sub(1)
            .and_then(|i| self.classes.get(i))
    }
}

impl Default for StaticSizeClasses {
    fn default() -> Self {
        Self::power_of_two()
    }
}

impl SizeClassTable for StaticSizeClasses {
    fn class_count(&self) -> u8 {
        self.classes.len() as u8 + 1
    }

    fn object_size(&self, size_class: u8) -> Option<u64> {
        self.row(size_class).map(|c| c.object_size)
    }

    fn span_pages(&self, size_class: u8) -> Option<u64> {
        self.row(size_class).map(|c| c.span_pages)
    }
}
