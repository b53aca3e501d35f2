use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use super::extent::MappedExtent;
use crate::config::CycleId;
use crate::error::{ChronicleError, ChronicleResult};
use crate::fs::{ensure_len, open_existing_file, open_or_create_file};

const SLOT_SIZE: u64 = 8;

/// Dense array of frame offsets for one cycle, stored in lazily allocated blocks.
///
/// Slot `i` holds the data offset of record `i` in little-endian order. A zero
/// slot is uncommitted; data offset zero is the file header, so it never names
/// a frame.
///
/// Mapped blocks are published like [`DataStore`](super::DataStore) extents:
/// lookups never wait on file growth.
pub struct IndexStore {
    path: PathBuf,
    file: File,
    cycle: CycleId,
    block_size: u64,
    entries_per_cycle: u64,
    blocks: ArcSwap<Vec<Arc<MappedExtent>>>,
    grow: Mutex<()>,
    next: AtomicU64,
}

impl IndexStore {
    pub fn create(
        path: &Path,
        cycle: CycleId,
        block_size: u64,
        entries_per_cycle: u64,
    ) -> ChronicleResult<Self> {
        let file = open_or_create_file(path)?;
        ensure_len(&file, block_size)?;
        let first = Arc::new(MappedExtent::map(&file, 0, block_size)?);
        Ok(Self {
            path: path.to_path_buf(),
            file,
            cycle,
            block_size,
            entries_per_cycle,
            blocks: ArcSwap::from_pointee(vec![first]),
            grow: Mutex::new(()),
            next: AtomicU64::new(0),
        })
    }

    /// Opens an existing index and recovers the next free slot from the
    /// committed prefix.
    pub fn open(
        path: &Path,
        cycle: CycleId,
        block_size: u64,
        entries_per_cycle: u64,
    ) -> ChronicleResult<Self> {
        let file = open_existing_file(path)?;
        let len = file.metadata()?.len();
        if len % block_size != 0 {
            return Err(ChronicleError::corruption(format!(
                "index file {} has length {} which is not a multiple of {}",
                path.display(),
                len,
                block_size
            )));
        }
        let store = Self {
            path: path.to_path_buf(),
            file,
            cycle,
            block_size,
            entries_per_cycle,
            blocks: ArcSwap::from_pointee(Vec::new()),
            grow: Mutex::new(()),
            next: AtomicU64::new(0),
        };
        store.map_available()?;
        let committed = store.committed_count()?;
        store.next.store(committed, Ordering::Release);
        Ok(store)
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.entries_per_cycle
    }

    #[inline]
    fn slots_per_block(&self) -> u64 {
        self.block_size / SLOT_SIZE
    }

    /// Index the next [`IndexStore::append`] will fill.
    #[inline]
    pub fn next_index(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.next_index() >= self.entries_per_cycle
    }

    #[inline]
    pub fn mapped_blocks(&self) -> usize {
        self.blocks.load().len()
    }

    /// Publishes `offset` as the next record and returns its index.
    ///
    /// This is the commit point of an excerpt.
    pub fn append(&self, offset: u64) -> ChronicleResult<u64> {
        if offset == 0 {
            return Err(ChronicleError::invalid_state(
                "data offset zero cannot be indexed",
            ));
        }
        let index = self.next_index();
        if index >= self.entries_per_cycle {
            return Err(ChronicleError::CycleFull(self.cycle));
        }
        let block = self.block_for_write(index / self.slots_per_block())?;
        let slot = block.atomic_u64(index * SLOT_SIZE)?;
        slot.store(offset.to_le(), Ordering::Release);
        self.next.store(index + 1, Ordering::Release);
        Ok(index)
    }

    /// Data offset of record `index`, if committed.
    pub fn lookup(&self, index: u64) -> ChronicleResult<Option<u64>> {
        if index >= self.entries_per_cycle {
            return Ok(None);
        }
        let Some(block) = self.block_for_read(index / self.slots_per_block())? else {
            return Ok(None);
        };
        let raw = block.atomic_u64(index * SLOT_SIZE)?.load(Ordering::Acquire);
        let offset = u64::from_le(raw);
        Ok((offset != 0).then_some(offset))
    }

    /// Number of committed records, found by binary search over the dense prefix.
    pub fn committed_count(&self) -> ChronicleResult<u64> {
        self.map_available()?;
        let mut lo = 0u64;
        let mut hi = (self.mapped_blocks() as u64 * self.slots_per_block())
            .min(self.entries_per_cycle);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.lookup(mid)?.is_some() {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    pub fn flush(&self) -> ChronicleResult<()> {
        for block in self.blocks.load().iter() {
            block.flush()?;
        }
        Ok(())
    }

    fn block_for_write(&self, block: u64) -> ChronicleResult<Arc<MappedExtent>> {
        if let Some(mapped) = self.blocks.load().get(block as usize) {
            return Ok(Arc::clone(mapped));
        }
        let _grow = self.grow.lock();
        let mut blocks = Vec::clone(&self.blocks.load_full());
        while blocks.len() as u64 <= block {
            let base = blocks.len() as u64 * self.block_size;
            ensure_len(&self.file, base + self.block_size)?;
            blocks.push(Arc::new(MappedExtent::map(
                &self.file,
                base,
                self.block_size,
            )?));
        }
        let mapped = Arc::clone(&blocks[block as usize]);
        self.blocks.store(Arc::new(blocks));
        Ok(mapped)
    }

    fn block_for_read(&self, block: u64) -> ChronicleResult<Option<Arc<MappedExtent>>> {
        if let Some(mapped) = self.blocks.load().get(block as usize) {
            return Ok(Some(Arc::clone(mapped)));
        }
        self.map_available()?;
        Ok(self.blocks.load().get(block as usize).cloned())
    }

    fn map_available(&self) -> ChronicleResult<()> {
        let available = self.file.metadata()?.len() / self.block_size;
        if available <= self.blocks.load().len() as u64 {
            return Ok(());
        }
        let _grow = self.grow.lock();
        let mut blocks = Vec::clone(&self.blocks.load_full());
        if available <= blocks.len() as u64 {
            return Ok(());
        }
        while (blocks.len() as u64) < available {
            let base = blocks.len() as u64 * self.block_size;
            blocks.push(Arc::new(MappedExtent::map(
                &self.file,
                base,
                self.block_size,
            )?));
        }
        self.blocks.store(Arc::new(blocks));
        Ok(())
    }
}

impl std::fmt::Debug for IndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexStore")
            .field("path", &self.path)
            .field("cycle", &self.cycle)
            .field("next", &self.next_index())
            .finish()
    }
}
