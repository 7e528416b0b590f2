//! Arena header structure.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io;

/// Magic number identifying an initialized arena header.
pub const ARENA_MAGIC: u64 = 0x5048_4541_5241_4E41; // "PHEARANA"

/// Fixed size of the arena header in bytes.
pub const ARENA_HEADER_SIZE: u64 = 128;

/// Maximum number of outstanding undo-log entries per arena.
pub const MAX_UNDO_ENTRIES: usize = 2;

/// Size of one encoded undo-log entry.
pub const UNDO_ENTRY_SIZE: u64 = 16;

/// Offsets of the header fields accessed in place, relative to the start of
/// the header. Magic, file offset and size sit at 0, 8 and 16.
pub(crate) mod field {
    pub const MAP_ADDR: u64 = 24;
    pub const CHAIN_SIZE: u64 = 32;
    pub const ARENA_COUNT: u64 = 40;
    pub const UNDO_COUNT: u64 = 48;
    pub const UNDO_ENTRIES: u64 = 56;
}

/// Header fields that may be updated in place after the arena is created.
///
/// Each update goes through the arena's undo log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaField {
    /// Virtual address the arena was mapped at by the last process.
    MapAddr,
    /// Total bytes of the arena chain (first arena only).
    ChainSize,
    /// Number of arenas in the chain (first arena only).
    ArenaCount,
}

impl ArenaField {
    /// Offset of the field within the header.
    pub fn header_offset(self) -> u64 {
        match self {
            Self::MapAddr => field::MAP_ADDR,
            Self::ChainSize => field::CHAIN_SIZE,
            Self::ArenaCount => field::ARENA_COUNT,
        }
    }
}

/// One undo-log slot: a previous value and where it belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UndoEntry {
    /// Offset of the protected field from the arena start.
    pub offset: u64,
    /// Value of the field before the logged update.
    pub previous: u64,
}

/// Arena header.
///
/// Stored at the start of every arena (after the region header in the first
/// one). Fields that change after creation are listed in [`ArenaField`] and
/// are only ever updated under the undo log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaHeader {
    /// Magic number for arena identification.
    pub magic: u64,
    /// Position of the arena in the chain, relative to the chain start.
    pub file_offset: u64,
    /// Extent size in bytes.
    pub size: u64,
    /// Virtual address of the last mapping.
    pub map_addr: u64,
    /// Total chain size in bytes. Only meaningful in the first arena.
    pub chain_size: u64,
    /// Number of arenas in the chain. Only meaningful in the first arena.
    pub arena_count: u64,
    /// Outstanding undo-log entries.
    pub undo_count: u64,
    /// Undo-log slots.
    pub undo: [UndoEntry; MAX_UNDO_ENTRIES],
}

impl ArenaHeader {
    /// Create a header for a freshly formatted arena.
    pub fn new(file_offset: u64, size: u64, map_addr: u64) -> Self {
        Self {
            magic: ARENA_MAGIC,
            file_offset,
            size,
            map_addr,
            chain_size: 0,
            arena_count: 0,
            undo_count: 0,
            undo: [UndoEntry::default(); MAX_UNDO_ENTRIES],
        }
    }

    /// Set the chain bookkeeping carried by the first arena.
    pub fn with_chain(mut self, chain_size: u64, arena_count: u64) -> Self {
        self.chain_size = chain_size;
        self.arena_count = arena_count;
        self
    }

    /// Validate the header.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.magic != ARENA_MAGIC {
            return Err("Invalid arena magic number");
        }
        if self.undo_count > MAX_UNDO_ENTRIES as u64 {
            return Err("Undo log count exceeds capacity");
        }
        if self.size == 0 {
            return Err("Arena size is zero");
        }
        Ok(())
    }

    /// Read header from a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        if bytes.len() < ARENA_HEADER_SIZE as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Buffer too small for arena header",
            ));
        }

        let mut cursor = io::Cursor::new(bytes);
        let magic = cursor.read_u64::<LittleEndian>()?;
        let file_offset = cursor.read_u64::<LittleEndian>()?;
        let size = cursor.read_u64::<LittleEndian>()?;
        let map_addr = cursor.read_u64::<LittleEndian>()?;
        let chain_size = cursor.read_u64::<LittleEndian>()?;
        let arena_count = cursor.read_u64::<LittleEndian>()?;
        let undo_count = cursor.read_u64::<LittleEndian>()?;

        let mut undo = [UndoEntry::default(); MAX_UNDO_ENTRIES];
        for entry in &mut undo {
            entry.offset = cursor.read_u64::<LittleEndian>()?;
            entry.previous = cursor.read_u64::<LittleEndian>()?;
        }

        Ok(Self {
            magic,
            file_offset,
            size,
            map_addr,
            chain_size,
            arena_count,
            undo_count,
            undo,
        })
    }

    /// Write header to a byte buffer.
    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(ARENA_HEADER_SIZE as usize);

        buf.write_u64::<LittleEndian>(self.magic)?;
        buf.write_u64::<LittleEndian>(self.file_offset)?;
        buf.write_u64::<LittleEndian>(self.size)?;
        buf.write_u64::<LittleEndian>(self.map_addr)?;
        buf.write_u64::<LittleEndian>(self.chain_size)?;
        buf.write_u64::<LittleEndian>(self.arena_count)?;
        buf.write_u64::<LittleEndian>(self.undo_count)?;
        for entry in &self.undo {
            buf.write_u64::<LittleEndian>(entry.offset)?;
            buf.write_u64::<LittleEndian>(entry.previous)?;
        }

        // Reserved tail.
        buf.resize(ARENA_HEADER_SIZE as usize, 0);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_offsets_match_encoding() {
        let mut header = ArenaHeader::new(0x4000_0000, 64 << 20, 0x7f00_0000_0000).with_chain(3, 1);
        header.undo_count = 1;
        header.undo[0] = UndoEntry {
            offset: 48,
            previous: 9,
        };
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len(), ARENA_HEADER_SIZE as usize);

        let word = |off: u64| u64::from_le_bytes(bytes[off as usize..off as usize + 8].try_into().unwrap());
        assert_eq!(word(0), ARENA_MAGIC);
        assert_eq!(word(8), 0x4000_0000);
        assert_eq!(word(16), 64 << 20);
        assert_eq!(word(field::MAP_ADDR), 0x7f00_0000_0000);
        assert_eq!(word(field::CHAIN_SIZE), 3);
        assert_eq!(word(field::UNDO_COUNT), 1);
        assert_eq!(word(field::UNDO_ENTRIES + 8), 9);

        assert_eq!(ArenaHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn undo_region_fits_in_header() {
        assert!(field::UNDO_ENTRIES + MAX_UNDO_ENTRIES as u64 * UNDO_ENTRY_SIZE <= ARENA_HEADER_SIZE);
    }

    #[test]
    fn header_validation() {
        let header = ArenaHeader::new(0, 64 << 20, 0);
        assert!(header.validate().is_ok());

        let mut bad_magic = header;
        bad_magic.magic = 0xDEADBEEF;
        assert!(bad_magic.validate().is_err());

        let mut bad_count = header;
        bad_count.undo_count = 3;
        assert!(bad_count.validate().is_err());
    }
}
