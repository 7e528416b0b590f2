//! Bounded undo log for in-place arena header updates.
//!
//! A transaction records the previous value of each header field before the
//! caller overwrites it, then ends in exactly one of [`UndoLog::commit`],
//! [`UndoLog::revert`], or [`UndoLog::reset`]. Entries and the entry count
//! are persisted individually, entry first, so a crash never leaves a count
//! that covers an unwritten entry. A non-zero count found at startup means
//! the protected update may be incomplete and is reverted.

use super::header::{MAX_UNDO_ENTRIES, UNDO_ENTRY_SIZE, UndoEntry, field};
use super::Arena;
use crate::error::{PmemError, Result};
use crate::persist::PmemPlatform;
use crate::stats::LogStats;
use crate::types::{PmemAddr, WORD_SIZE};

/// Undo log view over one arena.
pub struct UndoLog<'a> {
    arena: &'a Arena,
    platform: &'a dyn PmemPlatform,
    stats: &'a LogStats,
}

impl<'a> UndoLog<'a> {
    pub(super) fn new(arena: &'a Arena, platform: &'a dyn PmemPlatform, stats: &'a LogStats) -> Self {
        Self {
            arena,
            platform,
            stats,
        }
    }

    /// Number of outstanding entries.
    pub fn pending(&self) -> Result<u64> {
        let count = self.arena.extent().read_u64(self.header_ext(field::UNDO_COUNT))?;
        if count > MAX_UNDO_ENTRIES as u64 {
            return Err(PmemError::corruption(
                self.arena.pos(self.arena.layout().header_offset + field::UNDO_COUNT),
                format!("undo log count {} exceeds capacity", count),
            ));
        }
        Ok(count)
    }

    /// Outstanding entries in log order.
    pub fn entries(&self) -> Result<Vec<UndoEntry>> {
        let count = self.pending()?;
        (0..count)
            .map(|i| {
                let slot = self.entry_ext(i);
                Ok(UndoEntry {
                    offset: self.arena.extent().read_u64(slot)?,
                    previous: self.arena.extent().read_u64(slot + WORD_SIZE as usize)?,
                })
            })
            .collect()
    }

    /// Record the current value at `target` before the caller changes it.
    pub fn log_entry(&self, target: PmemAddr) -> Result<()> {
        let offset = self.check_target(target)?;

        let index = self.pending()?;
        if index == MAX_UNDO_ENTRIES as u64 {
            return Err(PmemError::UndoLogFull {
                arena: self.arena.file_offset(),
                capacity: MAX_UNDO_ENTRIES,
            });
        }

        let extent = self.arena.extent();
        let previous = extent.read_u64(self.arena.ext(offset))?;
        let slot = self.entry_ext(index);
        extent.write_u64(slot, offset)?;
        extent.write_u64(slot + WORD_SIZE as usize, previous)?;
        self.platform
            .persist_range(extent, slot, UNDO_ENTRY_SIZE as usize)?;

        self.store_count(index + 1)
    }

    /// Persist the already-updated targets and close the transaction.
    pub fn commit(&self) -> Result<()> {
        for entry in self.entries()? {
            self.check_offset(entry.offset)?;
            self.platform.persist_range(
                self.arena.extent(),
                self.arena.ext(entry.offset),
                WORD_SIZE as usize,
            )?;
        }
        self.store_count(0)?;
        self.stats.undo_commit();
        Ok(())
    }

    /// Copy every previous value back and close the transaction.
    ///
    /// Returns the number of entries restored.
    pub fn revert(&self) -> Result<usize> {
        let entries = self.entries()?;
        for entry in &entries {
            self.check_offset(entry.offset)?;
            let target = self.arena.ext(entry.offset);
            self.arena.extent().write_u64(target, entry.previous)?;
            self.platform
                .persist_range(self.arena.extent(), target, WORD_SIZE as usize)?;
        }
        self.store_count(0)?;
        if !entries.is_empty() {
            self.stats.undo_revert();
        }
        Ok(entries.len())
    }

    /// Discard the entries without touching their targets.
    pub fn reset(&self) -> Result<()> {
        self.store_count(0)?;
        self.stats.undo_reset();
        Ok(())
    }

    fn store_count(&self, count: u64) -> Result<()> {
        let off = self.header_ext(field::UNDO_COUNT);
        self.arena.extent().write_u64(off, count)?;
        self.platform
            .persist_range(self.arena.extent(), off, WORD_SIZE as usize)
    }

    fn header_ext(&self, header_rel: u64) -> usize {
        self.arena.ext(self.arena.layout().header_offset + header_rel)
    }

    fn entry_ext(&self, index: u64) -> usize {
        self.header_ext(field::UNDO_ENTRIES + index * UNDO_ENTRY_SIZE)
    }

    fn check_target(&self, target: PmemAddr) -> Result<u64> {
        let offset = target
            .offset_from(self.arena.base_pos())
            .ok_or_else(|| PmemError::UndoLogTarget {
                offset: 0,
                cause: format!("{} lies below arena start {}", target, self.arena.base_pos()),
            })?;
        self.check_offset(offset).map_err(|_| PmemError::UndoLogTarget {
            offset,
            cause: "target outside arena, misaligned, or inside the undo log".to_string(),
        })?;
        Ok(offset)
    }

    /// Entries may only point at whole words inside the arena that are not
    /// part of the undo log itself.
    fn check_offset(&self, offset: u64) -> Result<()> {
        let undo_start = self.arena.layout().header_offset + field::UNDO_COUNT;
        let undo_end = self.arena.layout().header_offset
            + field::UNDO_ENTRIES
            + MAX_UNDO_ENTRIES as u64 * UNDO_ENTRY_SIZE;
        let valid = offset % WORD_SIZE == 0
            && offset + WORD_SIZE <= self.arena.size()
            && !(offset >= undo_start && offset < undo_end);
        if !valid {
            return Err(PmemError::corruption(
                self.arena.pos(offset.min(self.arena.size())),
                format!("undo log entry targets invalid arena offset {}", offset),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::test_arena;
    use super::*;
    use crate::arena::ArenaField;

    #[test]
    fn revert_restores_previous_value() {
        let (_dir, platform, arena) = test_arena(0);
        let stats = LogStats::new();
        let log = arena.undo_log(&platform, &stats);

        arena.write_field(ArenaField::ChainSize, 100).unwrap();
        log.log_entry(arena.field_addr(ArenaField::ChainSize)).unwrap();
        assert_eq!(log.pending().unwrap(), 1);

        arena.write_field(ArenaField::ChainSize, 200).unwrap();
        assert_eq!(log.revert().unwrap(), 1);

        assert_eq!(arena.read_field(ArenaField::ChainSize).unwrap(), 100);
        assert_eq!(log.pending().unwrap(), 0);
        assert_eq!(stats.snapshot().undo_reverts, 1);
    }

    #[test]
    fn commit_keeps_new_value() {
        let (_dir, platform, arena) = test_arena(0);
        let stats = LogStats::new();
        let log = arena.undo_log(&platform, &stats);

        log.log_entry(arena.field_addr(ArenaField::ChainSize)).unwrap();
        log.log_entry(arena.field_addr(ArenaField::ArenaCount)).unwrap();
        arena.write_field(ArenaField::ChainSize, 7).unwrap();
        arena.write_field(ArenaField::ArenaCount, 2).unwrap();
        log.commit().unwrap();

        assert_eq!(arena.read_field(ArenaField::ChainSize).unwrap(), 7);
        assert_eq!(arena.read_field(ArenaField::ArenaCount).unwrap(), 2);
        assert_eq!(log.pending().unwrap(), 0);
    }

    #[test]
    fn reset_leaves_field_untouched() {
        let (_dir, platform, arena) = test_arena(0);
        let stats = LogStats::new();
        let log = arena.undo_log(&platform, &stats);

        arena.write_field(ArenaField::MapAddr, 0x1234).unwrap();
        log.log_entry(arena.field_addr(ArenaField::MapAddr)).unwrap();
        log.reset().unwrap();

        assert_eq!(arena.read_field(ArenaField::MapAddr).unwrap(), 0x1234);
        assert_eq!(log.pending().unwrap(), 0);
        assert!(log.entries().unwrap().is_empty());
    }

    #[test]
    fn third_entry_is_rejected() {
        let (_dir, platform, arena) = test_arena(0);
        let stats = LogStats::new();
        let log = arena.undo_log(&platform, &stats);

        log.log_entry(arena.field_addr(ArenaField::MapAddr)).unwrap();
        log.log_entry(arena.field_addr(ArenaField::ChainSize)).unwrap();
        let err = log
            .log_entry(arena.field_addr(ArenaField::ArenaCount))
            .unwrap_err();
        assert!(matches!(err, PmemError::UndoLogFull { capacity: 2, .. }));
        assert!(err.is_fatal());
        assert_eq!(log.pending().unwrap(), 2);
    }

    #[test]
    fn entries_record_offset_and_previous_value() {
        let (_dir, platform, arena) = test_arena(0);
        let stats = LogStats::new();
        let log = arena.undo_log(&platform, &stats);

        arena.write_field(ArenaField::ArenaCount, 5).unwrap();
        log.log_entry(arena.field_addr(ArenaField::ArenaCount)).unwrap();

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            arena.base_pos().add(entries[0].offset),
            arena.field_addr(ArenaField::ArenaCount)
        );
        assert_eq!(entries[0].previous, 5);
    }

    #[test]
    fn targets_outside_arena_or_in_log_are_rejected() {
        let (_dir, platform, arena) = test_arena(0);
        let stats = LogStats::new();
        let log = arena.undo_log(&platform, &stats);

        let count_addr = arena.pos(arena.layout().header_offset + field::UNDO_COUNT);
        assert!(matches!(
            log.log_entry(count_addr),
            Err(PmemError::UndoLogTarget { .. })
        ));
        assert!(log.log_entry(arena.data_end()).is_err());
        assert!(log.log_entry(arena.field_addr(ArenaField::MapAddr).add(3)).is_err());
        assert_eq!(log.pending().unwrap(), 0);
    }
}
