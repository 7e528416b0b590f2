//! Opening, formatting, re-attaching and growing the arena chain.

use super::{REGION_MAGIC, REGION_SIZE_OFFSET, Region};
use crate::arena::{Arena, ArenaField, ArenaIndex};
use crate::classes::SizeClassTable;
use crate::error::{PmemError, Result};
use crate::persist::{MappedExtent, PmemPlatform};
use crate::recovery::{RecoveryEngine, RecoveryReport};
use crate::stats::LogStats;
use crate::types::{MIN_REGION_SIZE, PAGE_SIZE, PmemAddr, Span, SpanClass, WORD_SIZE};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What to open.
pub(super) struct OpenParams {
    pub name: String,
    pub path: PathBuf,
    pub total_size: u64,
    pub reserved_offset: u64,
    pub lock: bool,
}

/// Shared collaborators of chain operations.
pub(super) struct ChainOps<'a> {
    pub platform: &'a dyn PmemPlatform,
    pub classes: &'a dyn SizeClassTable,
    pub stats: &'a LogStats,
}

impl Region {
    /// Map the backing file and either format a fresh region or re-attach
    /// and recover an existing one.
    ///
    /// Dropping the returned region (or the error path) unmaps everything.
    pub(super) fn open(
        params: OpenParams,
        ops: &ChainOps<'_>,
    ) -> Result<(Self, Option<RecoveryReport>)> {
        let lock_file = if params.lock {
            Some(lock_backing_file(&params.path)?)
        } else {
            None
        };

        let mapping = Arc::new(ops.platform.map_file(&params.path, 0, params.total_size)?);
        let header = params.reserved_offset as usize;
        let magic = mapping.read_u64(header)?;

        let (first_time, arenas, report) = if magic != REGION_MAGIC {
            let first = format_region(&mapping, &params, ops)?;
            tracing::info!(
                path = %params.path.display(),
                size = params.total_size,
                reserved = params.reserved_offset,
                platform = ops.platform.name(),
                "First time initialization"
            );
            (true, vec![Arc::new(first)], None)
        } else {
            let recorded = mapping.read_u64(header + REGION_SIZE_OFFSET)?;
            if recorded != params.total_size {
                return Err(PmemError::SizeMismatch {
                    recorded,
                    requested: params.total_size,
                });
            }
            tracing::info!(
                path = %params.path.display(),
                size = params.total_size,
                platform = ops.platform.name(),
                "Not a first time initialization"
            );
            let (arenas, report) = attach_chain(&mapping, &params, ops)?;
            (false, arenas, Some(report))
        };

        let mut index = ArenaIndex::new(PmemAddr::new(params.reserved_offset));
        for arena in arenas {
            index.insert(arena)?;
        }

        let region = Self {
            name: params.name,
            path: params.path,
            total_size: params.total_size,
            reserved_offset: params.reserved_offset,
            first_time,
            mapping,
            arenas: RwLock::new(index),
            grow_lock: Mutex::new(()),
            lock_file,
        };
        Ok((region, report))
    }

    /// Append a new arena of `bytes` to the chain.
    ///
    /// The arena is formatted and persisted before the first arena's chain
    /// bookkeeping is updated under its undo log, so a crash at any point
    /// either leaves the chain as it was or includes a fully formatted arena.
    /// Returns the new arena's data pages as one unlogged free span.
    pub(super) fn grow(&self, bytes: u64, ops: &ChainOps<'_>) -> Result<Span> {
        if bytes == 0 || bytes % MIN_REGION_SIZE != 0 {
            return Err(PmemError::config(format!(
                "growth of {} bytes is not a multiple of {}",
                bytes, MIN_REGION_SIZE
            )));
        }

        let _guard = self.grow_lock.lock();
        let first = self.arena(0).ok_or_else(|| PmemError::NotReady {
            state: "no arenas",
        })?;
        let chain_size = first.read_field(ArenaField::ChainSize)?;
        let arena_count = first.read_field(ArenaField::ArenaCount)?;

        let extent = Arc::new(ops.platform.map_file(
            &self.path,
            self.reserved_offset + chain_size,
            bytes,
        )?);
        let arena = Arena::format(extent, 0, chain_size, bytes, None, ops.platform)?;

        let undo = first.undo_log(ops.platform, ops.stats);
        undo.log_entry(first.field_addr(ArenaField::ChainSize))?;
        undo.log_entry(first.field_addr(ArenaField::ArenaCount))?;
        first.write_field(ArenaField::ChainSize, chain_size + bytes)?;
        first.write_field(ArenaField::ArenaCount, arena_count + 1)?;
        undo.commit()?;

        let arena = Arc::new(arena);
        self.arenas.write().insert(Arc::clone(&arena))?;

        tracing::info!(
            file_offset = chain_size,
            size = bytes,
            usable_pages = arena.usable_pages(),
            arenas = arena_count + 1,
            "Grew persistent region"
        );

        Ok(seed_span(&arena))
    }

    /// The first arena's data pages as one unlogged free span.
    pub(super) fn first_seed(&self) -> Option<Span> {
        self.arena(0).map(|a| seed_span(&a))
    }
}

fn seed_span(arena: &Arena) -> Span {
    let pages = arena.usable_pages();
    Span::persistent(
        arena.data_start(),
        pages,
        SpanClass::make(0, false),
        pages * PAGE_SIZE,
        arena.file_offset(),
    )
}

/// First-time initialization: format the first arena, then persist the
/// region size, then the magic.
fn format_region(mapping: &Arc<MappedExtent>, params: &OpenParams, ops: &ChainOps<'_>) -> Result<Arena> {
    let arena_size = params.total_size - params.reserved_offset;
    let header = params.reserved_offset as usize;

    let first = Arena::format(
        Arc::clone(mapping),
        header,
        0,
        arena_size,
        Some((arena_size, 1)),
        ops.platform,
    )?;

    mapping.write_u64(header + REGION_SIZE_OFFSET, params.total_size)?;
    ops.platform
        .persist_range(mapping, header + REGION_SIZE_OFFSET, WORD_SIZE as usize)?;
    mapping.write_u64(header, REGION_MAGIC)?;
    ops.platform
        .persist_range(mapping, header, WORD_SIZE as usize)?;

    Ok(first)
}

/// Restart: re-attach every arena of the chain, record this process's
/// mapping addresses, and run recovery.
fn attach_chain(
    mapping: &Arc<MappedExtent>,
    params: &OpenParams,
    ops: &ChainOps<'_>,
) -> Result<(Vec<Arc<Arena>>, RecoveryReport)> {
    let engine = RecoveryEngine::new(ops.platform, ops.classes, ops.stats);
    let first = Arena::attach(Arc::clone(mapping), params.reserved_offset as usize, 0)?;
    let first_size = params.total_size - params.reserved_offset;
    if first.size() != first_size {
        return Err(PmemError::corruption(
            first.base_pos(),
            format!(
                "first arena records {} bytes but the region leaves {}",
                first.size(),
                first_size
            ),
        ));
    }

    // The chain bookkeeping may be mid-update; settle it before trusting it.
    let first_reverted = engine.revert_undo(&first)?;
    let chain_size = first.read_field(ArenaField::ChainSize)?;
    let arena_count = first.read_field(ArenaField::ArenaCount)?;
    if chain_size < first_size || (chain_size - first_size) % MIN_REGION_SIZE != 0 {
        return Err(PmemError::corruption(
            first.field_addr(ArenaField::ChainSize),
            format!("chain size {} is inconsistent with the first arena", chain_size),
        ));
    }

    let mut arenas = vec![Arc::new(first)];
    if chain_size > first_size {
        let chain_end = params.reserved_offset + chain_size;
        let file_size = ops.platform.file_size(&params.path)?;
        if file_size < chain_end {
            return Err(PmemError::corruption(
                PmemAddr::new(file_size),
                format!("backing file ends before the arena chain at {}", chain_end),
            ));
        }

        let growth = Arc::new(ops.platform.map_file(
            &params.path,
            params.reserved_offset + first_size,
            chain_size - first_size,
        )?);
        let mut offset = first_size;
        while offset < chain_size {
            let arena = Arena::attach(Arc::clone(&growth), (offset - first_size) as usize, offset)?;
            offset += arena.size();
            arenas.push(Arc::new(arena));
        }
    }
    if arenas.len() as u64 != arena_count {
        return Err(PmemError::corruption(
            PmemAddr::new(params.reserved_offset),
            format!(
                "chain holds {} arenas but the header records {}",
                arenas.len(),
                arena_count
            ),
        ));
    }

    let mut reverted = vec![first_reverted];
    reverted.extend(engine.revert_all(&arenas[1..])?);
    for arena in &arenas {
        record_map_addr(arena, ops)?;
    }

    let report = engine.scan(&arenas, reverted)?;
    Ok((arenas, report))
}

fn record_map_addr(arena: &Arena, ops: &ChainOps<'_>) -> Result<()> {
    let undo = arena.undo_log(ops.platform, ops.stats);
    undo.log_entry(arena.field_addr(ArenaField::MapAddr))?;
    arena.write_field(ArenaField::MapAddr, arena.map_addr())?;
    undo.commit()
}

fn lock_backing_file(path: &Path) -> Result<File> {
    let io_err = |cause: String| PmemError::Io {
        path: path.to_path_buf(),
        cause,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| io_err(format!("Failed to create directory: {}", e)))?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| io_err(format!("Failed to open backing file: {}", e)))?;
    file.try_lock_exclusive()
        .map_err(|e| io_err(format!("Failed to lock backing file: {}", e)))?;
    Ok(file)
}
