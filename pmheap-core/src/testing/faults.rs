//! Fault injection for persistence primitives.
//!
//! A failing flush or fence aborts the logging operation that issued it,
//! leaving the image exactly as far along as the operation got. Reopening
//! the region afterwards exercises the same recovery paths a crash at that
//! point would.

use crate::error::{PmemError, Result};
use crate::persist::{MappedExtent, PmemPlatform};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// When [`FaultyPlatform`] fails a primitive.
///
/// # Example
///
/// ```
/// use pmheap_core::testing::FaultConfig;
///
/// // Fail the 4th flush-or-fence and everything after it.
/// let config = FaultConfig::new().fail_after(3);
///
/// // Fail 5% of primitives, reproducibly.
/// let config = FaultConfig::new().with_seed(7).with_fault_rate(0.05);
/// ```
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability that any one primitive fails (0.0 - 1.0).
    pub fault_rate: f64,
    /// Fail every primitive once this many have succeeded.
    pub fail_after: Option<u64>,
    /// Random seed for reproducibility.
    pub seed: u64,
}

impl FaultConfig {
    /// A configuration that injects nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the random seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the per-primitive fault probability.
    pub fn with_fault_rate(mut self, rate: f64) -> Self {
        self.fault_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Let `count` primitives succeed, then fail all later ones.
    pub fn fail_after(mut self, count: u64) -> Self {
        self.fail_after = Some(count);
        self
    }
}

/// Platform wrapper that fails flushes and fences on demand.
///
/// Mapping and size discovery are passed through untouched.
pub struct FaultyPlatform {
    inner: Arc<dyn PmemPlatform>,
    config: Mutex<FaultConfig>,
    rng: Mutex<StdRng>,
    calls: AtomicU64,
    injected: AtomicU64,
}

impl FaultyPlatform {
    /// Wrap `inner`.
    pub fn new(inner: Arc<dyn PmemPlatform>, config: FaultConfig) -> Self {
        Self {
            inner,
            rng: Mutex::new(StdRng::seed_from_u64(config.seed)),
            config: Mutex::new(config),
            calls: AtomicU64::new(0),
            injected: AtomicU64::new(0),
        }
    }

    /// Replace the configuration and restart the call count.
    pub fn reconfigure(&self, config: FaultConfig) {
        *self.rng.lock() = StdRng::seed_from_u64(config.seed);
        *self.config.lock() = config;
        self.calls.store(0, Ordering::SeqCst);
    }

    /// Stop injecting faults.
    pub fn disarm(&self) {
        self.reconfigure(FaultConfig::new());
    }

    /// Number of faults injected so far.
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::SeqCst)
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let config = self.config.lock().clone();
        let exhausted = config.fail_after.is_some_and(|after| call >= after);
        let random = config.fault_rate > 0.0 && self.rng.lock().gen_bool(config.fault_rate);
        if exhausted || random {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(PmemError::Persist {
                offset,
                len,
                cause: format!("injected fault on primitive #{}", call),
            });
        }
        Ok(())
    }
}

impl PmemPlatform for FaultyPlatform {
    fn name(&self) -> &'static str {
        "faulty"
    }

    fn map_file(&self, path: &Path, file_pos: u64, len: u64) -> Result<MappedExtent> {
        self.inner.map_file(path, file_pos, len)
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        self.inner.file_size(path)
    }

    fn flush_range(&self, extent: &MappedExtent, offset: usize, len: usize) -> Result<()> {
        self.check(offset, len)?;
        self.inner.flush_range(extent, offset, len)
    }

    fn fence(&self) -> Result<()> {
        self.check(0, 0)?;
        self.inner.fence()
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::persist::LinuxPlatform;

    #[test]
    fn fail_after_count() {
        let platform = FaultyPlatform::new(
            Arc::new(LinuxPlatform::new(false)),
            FaultConfig::new().fail_after(2),
        );
        assert!(platform.fence().is_ok());
        assert!(platform.fence().is_ok());
        assert!(matches!(platform.fence(), Err(PmemError::Persist { .. })));
        assert_eq!(platform.injected(), 1);

        platform.disarm();
        assert!(platform.fence().is_ok());
    }

    #[test]
    fn seeded_faults_are_reproducible() {
        let run = || {
            let platform = FaultyPlatform::new(
                Arc::new(LinuxPlatform::new(false)),
                FaultConfig::new().with_seed(42).with_fault_rate(0.3),
            );
            (0..64).map(|_| platform.fence().is_err()).collect::<Vec<_>>()
        };
        let first = run();
        assert_eq!(first, run());
        assert!(first.iter().any(|f| *f));
        assert!(first.iter().any(|f| !*f));
    }
}
