//! Per-type pointer layouts and their on-media record.
//!
//! When every object in a span has the same type, the heap bitmap does not
//! hold one entry per object. Instead the span's bitmap window starts with a
//! single descriptor record:
//!
//! ```text
//! offset  size  field
//!      0     8  type index (non-zero; written last)
//!      8     8  kind
//!     16     8  object size in bytes
//!     24     8  pointer-data length in bytes
//!     32     n  pointer mask, 1 bit per word of the pointer-data prefix
//! ```

use crate::types::{TypeIndex, WORD_SIZE};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read};

/// Size of the fixed part of a descriptor record.
pub const DESCRIPTOR_HEADER_SIZE: u64 = 32;

/// Pointer layout of a type, as the host's type system reports it.
///
/// Only the prefix of `ptr_data` bytes may hold pointers; words past it are
/// scalars.
pub trait PointerLayout {
    /// Object size in bytes.
    fn size(&self) -> u64;

    /// Length in bytes of the prefix that may contain pointers.
    fn ptr_data(&self) -> u64;

    /// Whether word `word` of the object is a pointer.
    fn is_pointer(&self, word: u64) -> bool;

    /// Number of words in the pointer-data prefix.
    fn ptr_words(&self) -> u64 {
        self.ptr_data() / WORD_SIZE
    }

    /// Per-word pointer flags over the pointer-data prefix.
    fn pointer_flags(&self) -> impl Iterator<Item = bool> + '_
    where
        Self: Sized,
    {
        (0..self.ptr_words()).map(move |w| self.is_pointer(w))
    }
}

/// Pointer layout shared by all objects of a span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    /// Index identifying the type.
    pub type_index: TypeIndex,
    /// Host-defined kind byte.
    pub kind: u8,
    /// Object size in bytes.
    pub size: u64,
    /// Length in bytes of the prefix that may contain pointers.
    pub ptr_data: u64,
    mask: Vec<u8>,
}

impl TypeDescriptor {
    /// Build a descriptor from per-word pointer flags.
    ///
    /// `ptr_data` ends after the last pointer word, so trailing scalar words
    /// cost nothing in the record.
    pub fn new(type_index: TypeIndex, kind: u8, size: u64, pointers: &[bool]) -> Self {
        let ptr_words = pointers.iter().rposition(|&p| p).map_or(0, |i| i + 1);
        let mut mask = vec![0u8; ptr_words.div_ceil(8)];
        for (word, _) in pointers[..ptr_words].iter().enumerate().filter(|(_, p)| **p) {
            mask[word / 8] |= 1 << (word % 8);
        }
        Self {
            type_index,
            kind,
            size,
            ptr_data: ptr_words as u64 * WORD_SIZE,
            mask,
        }
    }

    /// Capture the layout of any host type.
    pub fn from_layout<L: PointerLayout>(type_index: TypeIndex, kind: u8, layout: &L) -> Self {
        let flags: Vec<bool> = layout.pointer_flags().collect();
        Self::new(type_index, kind, layout.size(), &flags)
    }

    /// Pointer mask bytes.
    pub fn mask(&self) -> &[u8] {
        &self.mask
    }

    /// Length of the encoded record.
    pub fn record_len(&self) -> u64 {
        DESCRIPTOR_HEADER_SIZE + self.mask.len() as u64
    }

    /// Encode the on-media record.
    pub fn to_record(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.record_len() as usize);
        buf.write_u64::<LittleEndian>(self.type_index.get())?;
        buf.write_u64::<LittleEndian>(self.kind as u64)?;
        buf.write_u64::<LittleEndian>(self.size)?;
        buf.write_u64::<LittleEndian>(self.ptr_data)?;
        buf.extend_from_slice(&self.mask);
        Ok(buf)
    }

    /// Decode a record. `bytes` may extend past the record.
    pub fn from_record(bytes: &[u8]) -> io::Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let type_index = TypeIndex::new(cursor.read_u64::<LittleEndian>()?).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "descriptor has no type index")
        })?;
        let kind = cursor.read_u64::<LittleEndian>()?;
        let size = cursor.read_u64::<LittleEndian>()?;
        let ptr_data = cursor.read_u64::<LittleEndian>()?;

        if kind > u8::MAX as u64 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "descriptor kind out of range"));
        }
        if ptr_data % WORD_SIZE != 0 || ptr_data > size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("pointer data {} invalid for object size {}", ptr_data, size),
            ));
        }

        let mask_len = (ptr_data / WORD_SIZE).div_ceil(8);
        if mask_len > (bytes.len() as u64).saturating_sub(DESCRIPTOR_HEADER_SIZE) {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "descriptor mask truncated",
            ));
        }
        let mut mask = vec![0u8; mask_len as usize];
        cursor.read_exact(&mut mask)?;

        Ok(Self {
            type_index,
            kind: kind as u8,
            size,
            ptr_data,
            mask,
        })
    }
}

impl PointerLayout for TypeDescriptor {
    fn size(&self) -> u64 {
        self.size
    }

    fn ptr_data(&self) -> u64 {
        self.ptr_data
    }

    fn is_pointer(&self, word: u64) -> bool {
        let byte = (word / 8) as usize;
        byte < self.mask.len() && self.mask[byte] & (1 << (word % 8)) != 0
    }
}
