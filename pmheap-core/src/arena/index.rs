//! Ordered index of the arenas in the chain.

use super::Arena;
use crate::error::{PmemError, Result};
use crate::types::PmemAddr;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Arenas keyed by their position in the chain.
///
/// Arenas are laid out back to back from `chain_start`, so chain order is
/// also address order and an address lookup is a single range query.
#[derive(Debug)]
pub struct ArenaIndex {
    chain_start: PmemAddr,
    arenas: BTreeMap<u64, Arc<Arena>>,
}

impl ArenaIndex {
    /// Create an empty index for a chain starting at `chain_start`.
    pub fn new(chain_start: PmemAddr) -> Self {
        Self {
            chain_start,
            arenas: BTreeMap::new(),
        }
    }

    /// File position where the chain starts.
    pub fn chain_start(&self) -> PmemAddr {
        self.chain_start
    }

    /// Add an arena. It must start exactly where the chain currently ends.
    pub fn insert(&mut self, arena: Arc<Arena>) -> Result<()> {
        if arena.file_offset() != self.chain_size() {
            return Err(PmemError::corruption(
                arena.base_pos(),
                format!(
                    "arena at chain offset {} does not extend chain of {} bytes",
                    arena.file_offset(),
                    self.chain_size()
                ),
            ));
        }
        self.arenas.insert(arena.file_offset(), arena);
        Ok(())
    }

    /// Look up an arena by chain position.
    pub fn get(&self, file_offset: u64) -> Option<&Arc<Arena>> {
        self.arenas.get(&file_offset)
    }

    /// Find the arena whose data pages contain `addr`.
    pub fn find(&self, addr: PmemAddr) -> Option<&Arc<Arena>> {
        let rel = addr.offset_from(self.chain_start)?;
        self.arenas
            .range(..=rel)
            .next_back()
            .map(|(_, arena)| arena)
            .filter(|arena| arena.contains(addr))
    }

    /// The first arena.
    pub fn first(&self) -> Option<&Arc<Arena>> {
        self.arenas.get(&0)
    }

    /// The arena at the end of the chain.
    pub fn last(&self) -> Option<&Arc<Arena>> {
        self.arenas.values().next_back()
    }

    /// Total bytes covered by the chain.
    pub fn chain_size(&self) -> u64 {
        self.last()
            .map(|a| a.file_offset() + a.size())
            .unwrap_or(0)
    }

    /// Number of arenas.
    pub fn len(&self) -> usize {
        self.arenas.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.arenas.is_empty()
    }

    /// Arenas in chain order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Arena>> {
        self.arenas.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{LinuxPlatform, PmemPlatform};
    use crate::types::{MIN_REGION_SIZE, PAGE_SIZE};

    #[test]
    fn find_and_chain_growth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain");
        let platform = LinuxPlatform::new(false);

        let first_ext = Arc::new(platform.map_file(&path, 0, MIN_REGION_SIZE).unwrap());
        let first = Arena::format(first_ext, 0, 0, MIN_REGION_SIZE, None, &platform).unwrap();
        let second_ext = Arc::new(
            platform
                .map_file(&path, MIN_REGION_SIZE, MIN_REGION_SIZE)
                .unwrap(),
        );
        let second =
            Arena::format(second_ext, 0, MIN_REGION_SIZE, MIN_REGION_SIZE, None, &platform)
                .unwrap();

        let mut index = ArenaIndex::new(PmemAddr::ZERO);
        let first = Arc::new(first);
        let second = Arc::new(second);

        // Out-of-order insert leaves a gap.
        assert!(index.insert(Arc::clone(&second)).is_err());
        index.insert(Arc::clone(&first)).unwrap();
        index.insert(Arc::clone(&second)).unwrap();
        assert_eq!(index.chain_size(), 2 * MIN_REGION_SIZE);
        assert_eq!(index.len(), 2);

        let in_first = first.data_start().add(PAGE_SIZE);
        let in_second = second.data_start().add(5 * PAGE_SIZE);
        assert_eq!(index.find(in_first).unwrap().file_offset(), 0);
        assert_eq!(index.find(in_second).unwrap().file_offset(), MIN_REGION_SIZE);

        // Metadata pages are not allocatable.
        assert!(index.find(second.base_pos()).is_none());
        assert!(index.find(PmemAddr::new(4 * MIN_REGION_SIZE)).is_none());
    }
}
