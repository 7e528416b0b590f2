//! Heap bitmap encoding.
//!
//! Each bitmap byte covers one 32-byte granule (four words). Bit `i`
//! (0..4) says word `i` of the granule is a pointer; bit `4 + i` says more
//! pointer words may follow word `i` within the same object. The scan bit is
//! set on every word before the object's last pointer word, so a reader
//! walking an object stops at the first clear scan bit.

use super::descriptor::PointerLayout;
use crate::error::{PmemError, Result};
use crate::types::{GRANULE_SIZE, PmemAddr, WORDS_PER_GRANULE, WORD_SIZE};

const SCAN_SHIFT: u64 = 4;

/// Write the bits for one object into `bitmap`.
///
/// `first_word` is the word index of the object's first word relative to the
/// start of `bitmap`; `object_words` is the object size in words. Words past
/// the layout's pointer data are marked as scalars.
pub fn encode_object_bits<L: PointerLayout + ?Sized>(
    bitmap: &mut [u8],
    first_word: u64,
    object_words: u64,
    layout: &L,
) -> Result<()> {
    let last = first_word + object_words;
    if last.div_ceil(WORDS_PER_GRANULE) > bitmap.len() as u64 {
        return Err(PmemError::invalid_argument(format!(
            "object words {}..{} overrun a {}-byte bitmap",
            first_word,
            last,
            bitmap.len()
        )));
    }

    let ptr_words = layout.ptr_data() / WORD_SIZE;
    for w in 0..object_words {
        let word = first_word + w;
        let byte = &mut bitmap[(word / WORDS_PER_GRANULE) as usize];
        let shift = word % WORDS_PER_GRANULE;
        *byte &= !(1 << shift | 1 << (SCAN_SHIFT + shift));
        if w < ptr_words && layout.is_pointer(w) {
            *byte |= 1 << shift;
        }
        if w + 1 < ptr_words {
            *byte |= 1 << (SCAN_SHIFT + shift);
        }
    }
    Ok(())
}

/// Per-word pointer flags of one object, read back from a bitmap.
///
/// Stops after the first word whose scan bit is clear, or once the object's
/// words run out.
#[derive(Debug, Clone)]
pub struct HeapBitsIter<'a> {
    bitmap: &'a [u8],
    word: u64,
    remaining: u64,
    done: bool,
}

impl<'a> HeapBitsIter<'a> {
    /// Walk `object_words` words starting at word `first_word` of `bitmap`.
    pub fn new(bitmap: &'a [u8], first_word: u64, object_words: u64) -> Self {
        Self {
            bitmap,
            word: first_word,
            remaining: object_words,
            done: false,
        }
    }
}

impl Iterator for HeapBitsIter<'_> {
    type Item = bool;

    fn next(&mut self) -> Option<bool> {
        if self.done || self.remaining == 0 {
            return None;
        }
        let byte = *self.bitmap.get((self.word / WORDS_PER_GRANULE) as usize)?;
        let shift = self.word % WORDS_PER_GRANULE;
        let pointer = byte & (1 << shift) != 0;
        self.done = byte & (1 << (SCAN_SHIFT + shift)) == 0;
        self.word += 1;
        self.remaining -= 1;
        Some(pointer)
    }
}

/// Recovered heap bitmap covering one arena's data pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapBitmap {
    data_start: PmemAddr,
    bytes: Vec<u8>,
}

impl HeapBitmap {
    /// An all-scalar bitmap for `data_len` bytes starting at `data_start`.
    pub fn new(data_start: PmemAddr, data_len: u64) -> Self {
        Self {
            data_start,
            bytes: vec![0; (data_len / GRANULE_SIZE) as usize],
        }
    }

    /// First data address covered.
    pub fn data_start(&self) -> PmemAddr {
        self.data_start
    }

    /// Raw bitmap bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Whether the word at `addr` is marked as a pointer.
    pub fn is_pointer(&self, addr: PmemAddr) -> bool {
        self.word_index(addr)
            .and_then(|word| self.bytes.get((word / WORDS_PER_GRANULE) as usize).map(|b| (word, *b)))
            .is_some_and(|(word, byte)| byte & (1 << (word % WORDS_PER_GRANULE)) != 0)
    }

    /// Pointer flags of the object of `size` bytes at `addr`.
    pub fn object_bits(&self, addr: PmemAddr, size: u64) -> HeapBitsIter<'_> {
        match self.word_index(addr) {
            Some(word) => HeapBitsIter::new(&self.bytes, word, size / WORD_SIZE),
            None => HeapBitsIter::new(&[], 0, 0),
        }
    }

    /// Addresses of the pointer words of the object at `addr`.
    pub fn pointer_slots(&self, addr: PmemAddr, size: u64) -> Vec<PmemAddr> {
        self.object_bits(addr, size)
            .enumerate()
            .filter(|(_, pointer)| *pointer)
            .map(|(i, _)| addr.add(i as u64 * WORD_SIZE))
            .collect()
    }

    /// Copy raw bitmap bytes for the granules starting at `addr`.
    pub(crate) fn copy_from(&mut self, addr: PmemAddr, src: &[u8]) -> Result<()> {
        let start = self.granule_index(addr)?;
        let dst = self
            .bytes
            .get_mut(start..start + src.len())
            .ok_or_else(|| PmemError::invalid_argument("bitmap copy past end of arena"))?;
        dst.copy_from_slice(src);
        Ok(())
    }

    /// Encode one object of `size` bytes at `addr` using `layout`.
    pub(crate) fn set_object<L: PointerLayout + ?Sized>(
        &mut self,
        addr: PmemAddr,
        size: u64,
        layout: &L,
    ) -> Result<()> {
        let word = self
            .word_index(addr)
            .ok_or_else(|| PmemError::invalid_argument(format!("{} below bitmap start", addr)))?;
        encode_object_bits(&mut self.bytes, word, size / WORD_SIZE, layout)
    }

    fn word_index(&self, addr: PmemAddr) -> Option<u64> {
        addr.offset_from(self.data_start)
            .filter(|off| off % WORD_SIZE == 0)
            .map(|off| off / WORD_SIZE)
    }

    fn granule_index(&self, addr: PmemAddr) -> Result<usize> {
        addr.offset_from(self.data_start)
            .filter(|off| off % GRANULE_SIZE == 0)
            .map(|off| (off / GRANULE_SIZE) as usize)
            .ok_or_else(|| {
                PmemError::invalid_argument(format!("{} is not a granule of the bitmap", addr))
            })
    }
}
