//! The persistent heap context.

use super::chain::{ChainOps, OpenParams};
use super::{Region, RegionState};
use crate::arena::Arena;
use crate::classes::{SizeClassTable, StaticSizeClasses};
use crate::config::PmemConfig;
use crate::error::{PmemError, Result};
use crate::log::{HeapBitsLog, SpanLog, SpanLogOutcome, TypeDescriptor};
use crate::persist::{PmemPlatform, default_platform};
use crate::recovery::RecoveryReport;
use crate::stats::{LogStats, LogStatsSnapshot};
use crate::types::{MIN_REGION_SIZE, PAGE_SIZE, PmemAddr, Span};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Result of a successful [`PmemHeap::init`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitOutcome {
    /// Virtual address of the start of the backing file in this process.
    pub base_addr: usize,
    /// Whether the region was created by this call.
    pub first_time: bool,
    /// First allocatable address.
    pub start: PmemAddr,
    /// Last allocatable address (inclusive).
    pub end: PmemAddr,
    /// On a first-time run, the free span covering every allocatable page.
    /// After a restart the recovery report describes the free pages instead.
    pub seed: Option<Span>,
}

/// Owner of one persistent region and every log call made against it.
///
/// There is one context per region. Initialization is admitted to exactly one
/// caller through a compare-and-swap on the region state; logging calls are
/// accepted once the state is [`RegionState::Ready`] and take no lock beyond
/// a shared read of the arena index.
pub struct PmemHeap {
    config: PmemConfig,
    platform: Arc<dyn PmemPlatform>,
    classes: Arc<dyn SizeClassTable>,
    state: AtomicU8,
    region: RwLock<Option<Arc<Region>>>,
    report: RwLock<Option<Arc<RecoveryReport>>>,
    stats: LogStats,
}

impl PmemHeap {
    /// Create a context using the platform for the current target.
    pub fn new(config: PmemConfig) -> Self {
        let platform = default_platform(&config);
        Self::with_platform(config, platform)
    }

    /// Create a context over an explicit platform.
    pub fn with_platform(config: PmemConfig, platform: Arc<dyn PmemPlatform>) -> Self {
        Self {
            config,
            platform,
            classes: Arc::new(StaticSizeClasses::default()),
            state: AtomicU8::new(RegionState::Uninitialized as u8),
            region: RwLock::new(None),
            report: RwLock::new(None),
            stats: LogStats::new(),
        }
    }

    /// Use the host allocator's size-class table for recovery.
    pub fn with_size_classes(mut self, classes: Arc<dyn SizeClassTable>) -> Self {
        self.classes = classes;
        self
    }

    /// Map the region `name` of `total_size` bytes, leaving the first
    /// `reserved_offset` bytes of the file to the application.
    ///
    /// On a restart every arena is re-attached and recovered before this
    /// returns; the result is available from [`PmemHeap::recovery_report`].
    /// Any failure leaves the context uninitialized.
    pub fn init(&self, name: &str, total_size: u64, reserved_offset: u64) -> Result<InitOutcome> {
        validate_geometry(total_size, reserved_offset)?;

        self.state
            .compare_exchange(
                RegionState::Uninitialized as u8,
                RegionState::Initializing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|observed| PmemError::AlreadyInitialized {
                state: RegionState::from_u8(observed).as_str(),
            })?;

        let params = OpenParams {
            name: name.to_string(),
            path: self.config.resolve(name),
            total_size,
            reserved_offset,
            lock: self.config.lock_file,
        };
        let (region, report) = match Region::open(params, &self.ops()) {
            Ok(opened) => opened,
            Err(e) => {
                self.state
                    .store(RegionState::Uninitialized as u8, Ordering::Release);
                return Err(e);
            }
        };

        let outcome = InitOutcome {
            base_addr: region.base_addr(),
            first_time: region.first_time(),
            start: region.start(),
            end: region.end(),
            seed: region.first_time().then(|| region.first_seed()).flatten(),
        };

        *self.report.write() = report.map(Arc::new);
        *self.region.write() = Some(Arc::new(region));
        self.state.store(RegionState::Ready as u8, Ordering::Release);
        Ok(outcome)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RegionState {
        RegionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The mapped region.
    pub fn region(&self) -> Result<Arc<Region>> {
        let state = self.state();
        if state != RegionState::Ready {
            return Err(PmemError::NotReady {
                state: state.as_str(),
            });
        }
        self.region.read().clone().ok_or(PmemError::NotReady {
            state: state.as_str(),
        })
    }

    /// What recovery rebuilt, after a restart initialization.
    pub fn recovery_report(&self) -> Option<Arc<RecoveryReport>> {
        self.report.read().clone()
    }

    /// The platform in use.
    pub fn platform(&self) -> &dyn PmemPlatform {
        self.platform.as_ref()
    }

    /// Size-class table used by recovery.
    pub fn size_classes(&self) -> &dyn SizeClassTable {
        self.classes.as_ref()
    }

    /// Configuration.
    pub fn config(&self) -> &PmemConfig {
        &self.config
    }

    /// Log counters.
    pub fn stats(&self) -> &LogStats {
        &self.stats
    }

    /// Snapshot of the log counters.
    pub fn stats_snapshot(&self) -> LogStatsSnapshot {
        self.stats.snapshot()
    }

    /// Add an arena of `bytes` (a multiple of 64 MiB) to the region.
    ///
    /// Returns the new data pages as one free span. The span is not logged;
    /// the allocator carves it up and logs the spans it hands out.
    pub fn grow(&self, bytes: u64) -> Result<Span> {
        self.region()?.grow(bytes, &self.ops())
    }

    /// Record that `span` was allocated. The store is flushed; the caller
    /// fences at its allocation checkpoint.
    pub fn log_span_alloc(&self, span: &Span) -> Result<SpanLogOutcome> {
        let arena = self.arena_for_span(span)?;
        SpanLog::new(&arena, self.platform(), &self.stats).log_alloc(span)
    }

    /// Record that `span` was freed. The cleared slot is persisted.
    pub fn log_span_free(&self, span: &Span) -> Result<()> {
        let arena = self.arena_for_span(span)?;
        SpanLog::new(&arena, self.platform(), &self.stats).log_free(span)
    }

    /// Record the pointer bits of the object at `addr` in `span`.
    ///
    /// `bits` are the bitmap bytes covering the object, one per granule from
    /// the granule holding `addr`. Spans with a shared type index log
    /// `descriptor` instead, once per span.
    pub fn log_heap_bits(
        &self,
        span: &Span,
        addr: PmemAddr,
        bits: &[u8],
        descriptor: Option<&TypeDescriptor>,
    ) -> Result<()> {
        let arena = self.arena_for_span(span)?;
        HeapBitsLog::new(&arena, self.platform(), &self.stats).log(span, addr, bits, descriptor)
    }

    /// Zero the heap bits for `size` bytes at `addr`.
    pub fn clear_heap_bits(&self, addr: PmemAddr, size: u64) -> Result<()> {
        let arena = self.region()?.arena_for(addr)?;
        HeapBitsLog::new(&arena, self.platform(), &self.stats).clear(addr, size)
    }

    /// Durability checkpoint: order every earlier flush.
    pub fn checkpoint(&self) -> Result<()> {
        self.platform.fence()
    }

    fn arena_for_span(&self, span: &Span) -> Result<Arc<Arena>> {
        if !span.is_persistent() {
            return Err(PmemError::InvalidSpan {
                base: span.base,
                cause: "span is not in persistent memory".to_string(),
            });
        }
        self.region()?.arena_for(span.base)
    }

    fn ops(&self) -> ChainOps<'_> {
        ChainOps {
            platform: self.platform.as_ref(),
            classes: self.classes.as_ref(),
            stats: &self.stats,
        }
    }
}

impl std::fmt::Debug for PmemHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PmemHeap")
            .field("state", &self.state())
            .field("platform", &self.platform.name())
            .field("region", &*self.region.read())
            .finish()
    }
}

fn validate_geometry(total_size: u64, reserved_offset: u64) -> Result<()> {
    if reserved_offset % PAGE_SIZE != 0 {
        return Err(PmemError::config(format!(
            "reserved offset {} is not a multiple of the {}-byte page",
            reserved_offset, PAGE_SIZE
        )));
    }
    if total_size % MIN_REGION_SIZE != 0 {
        return Err(PmemError::config(format!(
            "region size {} is not a multiple of {}",
            total_size, MIN_REGION_SIZE
        )));
    }
    if total_size < reserved_offset || total_size - reserved_offset < MIN_REGION_SIZE {
        return Err(PmemError::config(format!(
            "region size {} leaves less than {} bytes after the {}-byte reserved area",
            total_size, MIN_REGION_SIZE, reserved_offset
        )));
    }
    Ok(())
}
