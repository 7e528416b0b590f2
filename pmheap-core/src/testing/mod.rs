//! Test tooling for crash-consistency checks.
//!
//! - [`RecordingPlatform`] records every flush and fence so ordering and
//!   flush ranges can be asserted directly.
//! - [`FaultyPlatform`] fails primitives on demand to cut a logging
//!   operation short, the way a crash would.
//!
//! # Example
//!
//! ```ignore
//! use pmheap_core::prelude::*;
//! use pmheap_core::testing::{FaultConfig, FaultyPlatform};
//!
//! let platform = Arc::new(FaultyPlatform::new(default_platform(&config), FaultConfig::new()));
//! let heap = PmemHeap::with_platform(config, platform.clone());
//! heap.init("heap", 128 << 20, 0)?;
//!
//! platform.reconfigure(FaultConfig::new().fail_after(3));
//! assert!(heap.grow(64 << 20).is_err());
//! ```

mod faults;
mod recording;

pub use faults::{FaultConfig, FaultyPlatform};
pub use recording::{PersistOp, RecordingPlatform};
