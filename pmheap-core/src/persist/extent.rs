//! Owned memory mappings with checked accessors.

use crate::error::{PmemError, Result};
use byteorder::{ByteOrder, LittleEndian};
use memmap2::MmapRaw;
use std::sync::atomic::AtomicU32;

/// A mapped window of the backing file.
///
/// All access goes through offset-based accessors that check bounds and
/// alignment, so no raw pointer into the mapping ever escapes. Multi-byte
/// values are stored little-endian regardless of the host.
///
/// Writes are crate-private. Their callers uphold the allocator's
/// single-writer rule: at most one allocation or free is in flight per span,
/// and arena headers are only mutated with the growth lock held or during
/// initialization.
pub struct MappedExtent {
    map: MmapRaw,
    file_pos: u64,
    is_pmem: bool,
}

impl MappedExtent {
    /// Wrap a raw mapping of the file starting at `file_pos`.
    pub fn new(map: MmapRaw, file_pos: u64, is_pmem: bool) -> Self {
        Self {
            map,
            file_pos,
            is_pmem,
        }
    }

    /// Length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    /// File position of the first mapped byte.
    pub fn file_pos(&self) -> u64 {
        self.file_pos
    }

    /// Whether stores reach persistence through cache-line write-back.
    pub fn is_pmem(&self) -> bool {
        self.is_pmem
    }

    /// Virtual address the mapping starts at in this process.
    pub fn base_addr(&self) -> usize {
        self.map.as_ptr() as usize
    }

    /// Whether the file range `[pos, pos + len)` is inside this mapping.
    pub fn covers(&self, pos: u64, len: u64) -> bool {
        pos >= self.file_pos && pos - self.file_pos + len <= self.len() as u64
    }

    /// Translate a file position into an offset of this mapping.
    pub fn offset_of(&self, pos: u64) -> Result<usize> {
        if !self.covers(pos, 0) {
            return Err(PmemError::ExtentAccess {
                offset: pos.wrapping_sub(self.file_pos) as usize,
                len: 0,
                cause: "file position outside mapping",
            });
        }
        Ok((pos - self.file_pos) as usize)
    }

    fn check(&self, offset: usize, len: usize, align: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => {}
            _ => {
                return Err(PmemError::ExtentAccess {
                    offset,
                    len,
                    cause: "out of bounds",
                });
            }
        }
        if (self.base_addr() + offset) % align != 0 {
            return Err(PmemError::ExtentAccess {
                offset,
                len,
                cause: "misaligned",
            });
        }
        Ok(())
    }

    /// Copy bytes out of the mapping.
    pub fn read_into(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len(), 1)?;
        // SAFETY: the range was bounds-checked against the live mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.map.as_ptr().add(offset),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// Read an aligned little-endian `u64`.
    pub fn read_u64(&self, offset: usize) -> Result<u64> {
        self.check(offset, 8, 8)?;
        let mut buf = [0u8; 8];
        self.read_into(offset, &mut buf)?;
        Ok(LittleEndian::read_u64(&buf))
    }

    /// Read an aligned little-endian `u32` with a single atomic load.
    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        let cell = self.atomic_u32(offset)?;
        Ok(u32::from_le(cell.load(std::sync::atomic::Ordering::Acquire)))
    }

    /// View an aligned 4-byte slot as an atomic word.
    ///
    /// The raw value is little-endian on media; use `to_le`/`from_le` around
    /// loads and stores.
    pub(crate) fn atomic_u32(&self, offset: usize) -> Result<&AtomicU32> {
        self.check(offset, 4, 4)?;
        // SAFETY: in bounds, 4-byte aligned, and the mapping outlives the
        // returned reference. AtomicU32 has the layout of u32.
        Ok(unsafe { &*(self.map.as_mut_ptr().add(offset) as *const AtomicU32) })
    }

    /// Copy bytes into the mapping.
    pub(crate) fn write_bytes(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check(offset, bytes.len(), 1)?;
        // SAFETY: bounds-checked; concurrent writers to the same range are
        // excluded by the single-writer rule documented on the type.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.map.as_mut_ptr().add(offset),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Write an aligned little-endian `u64`.
    pub(crate) fn write_u64(&self, offset: usize, value: u64) -> Result<()> {
        self.check(offset, 8, 8)?;
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, value);
        self.write_bytes(offset, &buf)
    }

    /// Fill a range with `byte`.
    pub(crate) fn fill(&self, offset: usize, len: usize, byte: u8) -> Result<()> {
        self.check(offset, len, 1)?;
        // SAFETY: see `write_bytes`.
        unsafe {
            std::ptr::write_bytes(self.map.as_mut_ptr().add(offset), byte, len);
        }
        Ok(())
    }

    /// Synchronously write a range back to the file.
    pub(crate) fn msync_range(&self, offset: usize, len: usize) -> Result<()> {
        self.check(offset, len, 1)?;
        self.map
            .flush_range(offset, len)
            .map_err(|e| PmemError::Persist {
                offset,
                len,
                cause: e.to_string(),
            })
    }

    /// Check that `[offset, offset + len)` lies inside the mapping.
    pub(crate) fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        self.check(offset, len, 1)
    }

    /// Raw pointer for cache-line maintenance instructions.
    pub(crate) fn line_ptr(&self, offset: usize) -> Result<*const u8> {
        self.check(offset, 0, 1)?;
        // SAFETY: offset is within the mapping.
        Ok(unsafe { self.map.as_ptr().add(offset) })
    }
}

impl std::fmt::Debug for MappedExtent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedExtent")
            .field("file_pos", &self.file_pos)
            .field("len", &self.len())
            .field("is_pmem", &self.is_pmem)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memmap2::MmapOptions;
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    fn extent(len: u64) -> (tempfile::TempDir, MappedExtent) {
        let dir = tempdir().unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join("extent"))
            .unwrap();
        file.set_len(len).unwrap();
        let map = MmapOptions::new().len(len as usize).map_raw(&file).unwrap();
        (dir, MappedExtent::new(map, 0, false))
    }

    #[test]
    fn u64_roundtrip_is_little_endian() {
        let (_dir, ext) = extent(4096);
        ext.write_u64(8, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(ext.read_u64(8).unwrap(), 0x0102_0304_0506_0708);

        let mut raw = [0u8; 8];
        ext.read_into(8, &mut raw).unwrap();
        assert_eq!(raw[0], 0x08);
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        let (_dir, ext) = extent(4096);
        assert!(ext.write_bytes(4090, &[0u8; 8]).is_err());
        assert!(ext.read_u64(4096).is_err());
        assert!(ext.fill(usize::MAX, 2, 0).is_err());
    }

    #[test]
    fn misaligned_word_is_rejected() {
        let (_dir, ext) = extent(4096);
        assert!(ext.read_u64(4).is_err());
        assert!(ext.atomic_u32(6).is_err());
        assert!(ext.atomic_u32(8).is_ok());
    }

    #[test]
    fn covers_and_offset_of() {
        let (_dir, ext) = extent(4096);
        assert!(ext.covers(0, 4096));
        assert!(!ext.covers(1, 4096));
        assert_eq!(ext.offset_of(100).unwrap(), 100);
        assert!(ext.offset_of(5000).is_err());
    }
}
