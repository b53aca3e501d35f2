use std::fs::File;
use std::ptr;
use std::slice;
use std::sync::atomic::AtomicU64;

use memmap2::{MmapMut, MmapOptions};

use crate::error::{ChronicleError, ChronicleResult};

/// One fixed-size, writable mapping of a file region.
///
/// Extents are never remapped or moved once created, so slices handed out by
/// [`MappedExtent::read_slice`] stay valid for as long as the extent is alive.
/// Offsets taken by every method are absolute file offsets.
pub struct MappedExtent {
    map: MmapMut,
    ptr: *mut u8,
    base: u64,
    len: u64,
}

// The mapping is only written by the single appender, and readers only look
// at bytes published to them through an acquire load of an index entry.
unsafe impl Send for MappedExtent {}
unsafe impl Sync for MappedExtent {}

impl MappedExtent {
    /// Maps `len` bytes of `file` starting at `base`, which must be page aligned.
    pub fn map(file: &File, base: u64, len: u64) -> ChronicleResult<Self> {
        let mut map = unsafe {
            MmapOptions::new()
                .offset(base)
                .len(len as usize)
                .map_mut(file)
                .map_err(ChronicleError::from)?
        };
        if map.len() as u64 != len {
            return Err(ChronicleError::corruption(format!(
                "mapped {} bytes at {} but expected {}",
                map.len(),
                base,
                len
            )));
        }
        let ptr = map.as_mut_ptr();
        Ok(Self { map, ptr, base, len })
    }

    /// File offset of the first mapped byte.
    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// File offset one past the last mapped byte.
    #[inline]
    pub fn end(&self) -> u64 {
        self.base + self.len
    }

    #[inline]
    fn local_range(&self, offset: u64, len: usize) -> ChronicleResult<usize> {
        let end = offset.checked_add(len as u64).ok_or_else(|| {
            ChronicleError::corruption(format!("range at {offset} overflows"))
        })?;
        if offset < self.base || end > self.end() {
            return Err(ChronicleError::corruption(format!(
                "range {}..{} outside extent {}..{}",
                offset,
                end,
                self.base,
                self.end()
            )));
        }
        Ok((offset - self.base) as usize)
    }

    /// Copies `bytes` into the mapping at `offset`.
    ///
    /// Only the appender writes, and only to bytes no reader can observe yet.
    /// Fails with [`ChronicleError::Corruption`] if the range leaves the extent.
    pub fn write_bytes(&self, offset: u64, bytes: &[u8]) -> ChronicleResult<()> {
        let local = self.local_range(offset, bytes.len())?;
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(local), bytes.len());
        }
        Ok(())
    }

    /// Borrows `len` mapped bytes at `offset`.
    pub fn read_slice(&self, offset: u64, len: usize) -> ChronicleResult<&[u8]> {
        let local = self.local_range(offset, len)?;
        unsafe { Ok(slice::from_raw_parts(self.ptr.add(local), len)) }
    }

    /// Views the aligned 8 bytes at `offset` as an atomic word.
    pub fn atomic_u64(&self, offset: u64) -> ChronicleResult<&AtomicU64> {
        if offset % 8 != 0 {
            return Err(ChronicleError::invalid_state(format!(
                "atomic slot at {offset} is not 8-byte aligned"
            )));
        }
        let local = self.local_range(offset, 8)?;
        unsafe { Ok(&*(self.ptr.add(local) as *const AtomicU64)) }
    }

    /// msyncs `len` bytes at `offset`.
    pub fn flush_range(&self, offset: u64, len: usize) -> ChronicleResult<()> {
        let local = self.local_range(offset, len)?;
        self.map.flush_range(local, len).map_err(ChronicleError::from)
    }

    /// msyncs the whole extent.
    pub fn flush(&self) -> ChronicleResult<()> {
        self.map.flush().map_err(ChronicleError::from)
    }
}

impl std::fmt::Debug for MappedExtent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedExtent")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}
