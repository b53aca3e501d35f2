use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use super::extent::MappedExtent;
use super::{align_up, DATA_HEADER_SIZE, FRAME_ALIGN, FRAME_HEADER_SIZE};
use crate::config::CycleId;
use crate::error::{ChronicleError, ChronicleResult};
use crate::fs::{ensure_len, open_existing_file, open_or_create_file};

const DATA_MAGIC: u32 = 0x4348_5244; // "CHRD"
const DATA_VERSION: u16 = 1;

/// Metadata stored at the start of every data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub cycle: CycleId,
    pub created_at: i64,
    pub cycle_length_ms: u64,
    pub data_block_size: u64,
}

impl DataHeader {
    fn encode(&self, buf: &mut [u8]) {
        assert!(buf.len() >= DATA_HEADER_SIZE as usize);
        buf.fill(0);
        buf[0..4].copy_from_slice(&DATA_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&DATA_VERSION.to_le_bytes());
        buf[6..8].copy_from_slice(&(DATA_HEADER_SIZE as u16).to_le_bytes());
        buf[8..16].copy_from_slice(&self.cycle.as_u64().to_le_bytes());
        buf[16..24].copy_from_slice(&self.created_at.to_le_bytes());
        buf[24..32].copy_from_slice(&self.cycle_length_ms.to_le_bytes());
        buf[32..40].copy_from_slice(&self.data_block_size.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < DATA_HEADER_SIZE as usize {
            return None;
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().ok()?);
        if magic != DATA_MAGIC {
            return None;
        }
        let version = u16::from_le_bytes(buf[4..6].try_into().ok()?);
        if version != DATA_VERSION {
            return None;
        }
        let header_size = u16::from_le_bytes(buf[6..8].try_into().ok()?);
        if header_size as u64 != DATA_HEADER_SIZE {
            return None;
        }
        Some(Self {
            cycle: CycleId::new(u64::from_le_bytes(buf[8..16].try_into().ok()?)),
            created_at: i64::from_le_bytes(buf[16..24].try_into().ok()?),
            cycle_length_ms: u64::from_le_bytes(buf[24..32].try_into().ok()?),
            data_block_size: u64::from_le_bytes(buf[32..40].try_into().ok()?),
        })
    }

    /// Reads just the header of the data file at `path`.
    pub fn load(path: &Path) -> ChronicleResult<Self> {
        let mut buf = [0u8; DATA_HEADER_SIZE as usize];
        let mut file = File::open(path)?;
        file.read_exact(&mut buf)?;
        Self::decode(&buf).ok_or_else(|| {
            ChronicleError::corruption(format!("invalid data header: {}", path.display()))
        })
    }
}

/// Space claimed for one frame, header included.
#[must_use = "a reservation must be shrunk to its used size or released"]
#[derive(Debug)]
pub struct Reservation {
    extent: Arc<MappedExtent>,
    offset: u64,
    len: u64,
}

impl Reservation {
    /// Absolute offset of the frame header.
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Total reserved bytes, frame header included.
    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Bytes available for the payload.
    #[inline]
    pub fn payload_capacity(&self) -> usize {
        (self.len - FRAME_HEADER_SIZE) as usize
    }

    /// Writes `bytes` at `position` bytes into the payload.
    pub fn write_payload(&self, position: usize, bytes: &[u8]) -> ChronicleResult<()> {
        let end = position + bytes.len();
        if end > self.payload_capacity() {
            return Err(ChronicleError::CapacityExceeded {
                requested: bytes.len(),
                remaining: self.payload_capacity().saturating_sub(position),
            });
        }
        self.extent
            .write_bytes(self.offset + FRAME_HEADER_SIZE + position as u64, bytes)
    }

    /// Writes the `[len][checksum]` prefix once the payload is complete.
    pub fn write_header(&self, payload_len: u32, checksum: u32) -> ChronicleResult<()> {
        let mut header = [0u8; FRAME_HEADER_SIZE as usize];
        header[0..4].copy_from_slice(&payload_len.to_le_bytes());
        header[4..8].copy_from_slice(&checksum.to_le_bytes());
        self.extent.write_bytes(self.offset, &header)
    }

    /// The payload bytes written so far.
    pub fn payload(&self, used: usize) -> ChronicleResult<&[u8]> {
        self.extent
            .read_slice(self.offset + FRAME_HEADER_SIZE, used.min(self.payload_capacity()))
    }

    pub fn flush(&self, payload_len: usize) -> ChronicleResult<()> {
        self.extent
            .flush_range(self.offset, FRAME_HEADER_SIZE as usize + payload_len)
    }
}

/// Read-only view of a committed payload.
///
/// Holds its extent alive, so the bytes remain valid even if the store is
/// dropped by everyone else.
pub struct DataView {
    _extent: Arc<MappedExtent>,
    ptr: *const u8,
    len: usize,
    checksum: u32,
}

unsafe impl Send for DataView {}
unsafe impl Sync for DataView {}

impl DataView {
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr, self.len) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Checksum recorded by the appender.
    #[inline]
    pub fn checksum(&self) -> u32 {
        self.checksum
    }
}

impl std::fmt::Debug for DataView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataView")
            .field("len", &self.len)
            .field("checksum", &self.checksum)
            .finish()
    }
}

/// Append-only frame storage for one cycle.
///
/// Readers load the extent list without locking. Growth maps new extents
/// into a copy of the list under `grow` and publishes it with one store, so
/// `set_len` and `mmap` never block a reader.
pub struct DataStore {
    path: PathBuf,
    file: File,
    header: DataHeader,
    block_size: u64,
    extents: ArcSwap<Vec<Arc<MappedExtent>>>,
    grow: Mutex<()>,
    append_pos: AtomicU64,
}

impl DataStore {
    /// Creates a new data file with its first extent mapped and the header written.
    pub fn create(path: &Path, header: DataHeader) -> ChronicleResult<Self> {
        let block_size = header.data_block_size;
        let file = open_or_create_file(path)?;
        ensure_len(&file, block_size)?;
        let first = Arc::new(MappedExtent::map(&file, 0, block_size)?);

        let mut buf = [0u8; DATA_HEADER_SIZE as usize];
        header.encode(&mut buf);
        first.write_bytes(0, &buf)?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            header,
            block_size,
            extents: ArcSwap::from_pointee(vec![first]),
            grow: Mutex::new(()),
            append_pos: AtomicU64::new(DATA_HEADER_SIZE),
        })
    }

    /// Opens an existing data file and maps every complete extent.
    ///
    /// The append position starts right after the header; the owner of the
    /// store moves it past the last committed frame with
    /// [`DataStore::resume_after`].
    pub fn open(path: &Path) -> ChronicleResult<Self> {
        let header = DataHeader::load(path)?;
        let block_size = header.data_block_size;
        if !block_size.is_power_of_two() || block_size <= DATA_HEADER_SIZE {
            return Err(ChronicleError::corruption(format!(
                "data file {} has invalid block size {}",
                path.display(),
                block_size
            )));
        }

        let file = open_existing_file(path)?;
        let store = Self {
            path: path.to_path_buf(),
            file,
            header,
            block_size,
            extents: ArcSwap::from_pointee(Vec::new()),
            grow: Mutex::new(()),
            append_pos: AtomicU64::new(DATA_HEADER_SIZE),
        };
        store.map_available()?;
        Ok(store)
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn header(&self) -> &DataHeader {
        &self.header
    }

    #[inline]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    #[inline]
    pub fn append_position(&self) -> u64 {
        self.append_pos.load(Ordering::Acquire)
    }

    #[inline]
    pub fn mapped_extents(&self) -> usize {
        self.extents.load().len()
    }

    /// Largest payload a single frame may carry.
    #[inline]
    pub fn max_payload_len(&self) -> u64 {
        self.block_size - DATA_HEADER_SIZE - FRAME_HEADER_SIZE
    }

    /// Claims `payload_capacity` bytes plus a frame header at the append position.
    ///
    /// A frame never straddles two extents: when the remainder of the current
    /// extent is too small the frame starts at the next one, mapping it first.
    pub fn reserve(&self, payload_capacity: u64) -> ChronicleResult<Reservation> {
        if payload_capacity > self.max_payload_len() {
            return Err(ChronicleError::RecordTooLarge {
                len: payload_capacity,
                max: self.max_payload_len(),
            });
        }
        let frame_len = FRAME_HEADER_SIZE + payload_capacity;

        let mut offset = align_up(self.append_position(), FRAME_ALIGN);
        let within = offset % self.block_size;
        if within + frame_len > self.block_size {
            offset += self.block_size - within;
        }

        let extent = self.extent_for_write(offset / self.block_size)?;
        self.append_pos.store(offset + frame_len, Ordering::Release);

        Ok(Reservation {
            extent,
            offset,
            len: frame_len,
        })
    }

    /// Returns the unused tail of the latest reservation.
    pub fn shrink(&self, reservation: &Reservation, payload_used: usize) {
        debug_assert!(payload_used <= reservation.payload_capacity());
        let end = reservation.offset + FRAME_HEADER_SIZE + payload_used as u64;
        self.append_pos.store(end, Ordering::Release);
    }

    /// Abandons the latest reservation entirely.
    pub fn release(&self, reservation: Reservation) {
        self.append_pos
            .store(reservation.offset, Ordering::Release);
    }

    /// Moves the append position past the frame at `offset` (recovery after reopen).
    pub fn resume_after(&self, offset: u64) -> ChronicleResult<()> {
        let view = self.read_frame(offset)?;
        self.append_pos.store(
            offset + FRAME_HEADER_SIZE + view.len() as u64,
            Ordering::Release,
        );
        Ok(())
    }

    /// Returns a view of `len` bytes at `offset`.
    pub fn read_at(&self, offset: u64, len: usize) -> ChronicleResult<DataView> {
        let extent = self.extent_for_read(offset)?;
        let bytes = extent.read_slice(offset, len)?;
        Ok(DataView {
            ptr: bytes.as_ptr(),
            len,
            checksum: 0,
            _extent: extent,
        })
    }

    /// Decodes the frame whose header starts at `offset` and returns its payload.
    pub fn read_frame(&self, offset: u64) -> ChronicleResult<DataView> {
        if offset < DATA_HEADER_SIZE || offset % FRAME_ALIGN != 0 {
            return Err(ChronicleError::corruption(format!(
                "frame offset {offset} is invalid"
            )));
        }
        let extent = self.extent_for_read(offset)?;
        let header = extent.read_slice(offset, FRAME_HEADER_SIZE as usize)?;
        let len = u32::from_le_bytes(
            header[0..4]
                .try_into()
                .map_err(|_| ChronicleError::corruption("frame header corrupt"))?,
        ) as usize;
        let checksum = u32::from_le_bytes(
            header[4..8]
                .try_into()
                .map_err(|_| ChronicleError::corruption("frame checksum corrupt"))?,
        );
        let payload = extent.read_slice(offset + FRAME_HEADER_SIZE, len)?;
        Ok(DataView {
            ptr: payload.as_ptr(),
            len,
            checksum,
            _extent: extent,
        })
    }

    pub fn flush(&self) -> ChronicleResult<()> {
        for extent in self.extents.load().iter() {
            extent.flush()?;
        }
        Ok(())
    }

    fn extent_for_write(&self, index: u64) -> ChronicleResult<Arc<MappedExtent>> {
        if let Some(extent) = self.extents.load().get(index as usize) {
            return Ok(Arc::clone(extent));
        }
        let _grow = self.grow.lock();
        let mut extents = Vec::clone(&self.extents.load_full());
        while extents.len() as u64 <= index {
            let base = extents.len() as u64 * self.block_size;
            ensure_len(&self.file, base + self.block_size)?;
            extents.push(Arc::new(MappedExtent::map(
                &self.file,
                base,
                self.block_size,
            )?));
        }
        let extent = Arc::clone(&extents[index as usize]);
        self.extents.store(Arc::new(extents));
        Ok(extent)
    }

    fn extent_for_read(&self, offset: u64) -> ChronicleResult<Arc<MappedExtent>> {
        let index = offset / self.block_size;
        if let Some(extent) = self.extents.load().get(index as usize) {
            return Ok(Arc::clone(extent));
        }
        // Another process may have grown the file since we mapped it.
        self.map_available()?;
        self.extents
            .load()
            .get(index as usize)
            .cloned()
            .ok_or_else(|| {
                ChronicleError::corruption(format!(
                    "offset {} lies beyond data file {}",
                    offset,
                    self.path.display()
                ))
            })
    }

    /// Maps every complete extent present in the file.
    fn map_available(&self) -> ChronicleResult<()> {
        let available = self.file.metadata()?.len() / self.block_size;
        if self.extents.load().len() as u64 >= available {
            return Ok(());
        }
        let _grow = self.grow.lock();
        let mut extents = Vec::clone(&self.extents.load_full());
        if extents.len() as u64 >= available {
            return Ok(());
        }
        while (extents.len() as u64) < available {
            let base = extents.len() as u64 * self.block_size;
            extents.push(Arc::new(MappedExtent::map(
                &self.file,
                base,
                self.block_size,
            )?));
        }
        self.extents.store(Arc::new(extents));
        Ok(())
    }
}

impl std::fmt::Debug for DataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStore")
            .field("path", &self.path)
            .field("cycle", &self.header.cycle)
            .field("append_pos", &self.append_position())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::payload_checksum;
    use proptest::prelude::*;
    use tempfile::TempDir;

    const BLOCK: u64 = 64 * 1024;

    fn header(cycle: u64) -> DataHeader {
        DataHeader {
            cycle: CycleId::new(cycle),
            created_at: 1_700_000_000_000,
            cycle_length_ms: 1_000,
            data_block_size: BLOCK,
        }
    }

    fn append(store: &DataStore, payload: &[u8]) -> u64 {
        let reservation = store.reserve(payload.len() as u64 + 16).expect("reserve");
        reservation.write_payload(0, payload).expect("write");
        reservation
            .write_header(payload.len() as u32, payload_checksum(payload))
            .expect("header");
        store.shrink(&reservation, payload.len());
        reservation.offset()
    }

    #[test]
    fn header_round_trip() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("data");
        let store = DataStore::create(&path, header(42)).expect("create");
        drop(store);

        let loaded = DataHeader::load(&path).expect("load");
        assert_eq!(loaded, header(42));
    }

    #[test]
    fn frames_are_aligned_and_readable() {
        let tmp = TempDir::new().expect("tempdir");
        let store = DataStore::create(&tmp.path().join("data"), header(1)).expect("create");

        let first = append(&store, b"abc");
        let second = append(&store, b"hello world");
        assert_eq!(first, DATA_HEADER_SIZE);
        assert_eq!(second % FRAME_ALIGN, 0);
        assert!(second > first);

        let view = store.read_frame(second).expect("read");
        assert_eq!(view.bytes(), b"hello world");
        assert_eq!(view.checksum(), payload_checksum(b"hello world"));
    }

    #[test]
    fn frames_do_not_straddle_extents() {
        let tmp = TempDir::new().expect("tempdir");
        let store = DataStore::create(&tmp.path().join("data"), header(1)).expect("create");

        let big = vec![7u8; (BLOCK / 2) as usize];
        append(&store, &big);
        let offset = append(&store, &big);
        assert_eq!(offset, BLOCK);
        assert_eq!(store.mapped_extents(), 2);
        assert_eq!(store.read_frame(offset).expect("read").bytes(), &big[..]);
    }

    #[test]
    fn views_outlive_extent_growth() {
        let tmp = TempDir::new().expect("tempdir");
        let store = DataStore::create(&tmp.path().join("data"), header(1)).expect("create");
        let offset = append(&store, b"kept");
        let view = store.read_frame(offset).expect("read");

        let big = vec![3u8; (BLOCK / 2) as usize];
        for _ in 0..6 {
            append(&store, &big);
        }
        assert!(store.mapped_extents() >= 3);
        assert_eq!(view.bytes(), b"kept");
        assert_eq!(store.read_frame(offset).expect("reread").bytes(), b"kept");
    }

    #[test]
    fn reader_store_maps_extents_grown_by_writer() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("data");
        let writer = DataStore::create(&path, header(1)).expect("create");
        let reader = DataStore::open(&path).expect("open");
        assert_eq!(reader.mapped_extents(), 1);

        let big = vec![5u8; (BLOCK / 2) as usize];
        append(&writer, &big);
        let offset = append(&writer, &big);
        assert_eq!(offset, BLOCK);

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| reader.read_frame(offset).expect("read").bytes() == &big[..]))
                .collect();
            for handle in handles {
                assert!(handle.join().expect("join"));
            }
        });
        assert_eq!(reader.mapped_extents(), 2);
    }

    #[test]
    fn read_at_views_raw_bytes() {
        let tmp = TempDir::new().expect("tempdir");
        let store = DataStore::create(&tmp.path().join("data"), header(1)).expect("create");
        let offset = append(&store, b"raw view");
        let view = store
            .read_at(offset + FRAME_HEADER_SIZE, 3)
            .expect("read");
        assert_eq!(view.bytes(), b"raw");
        assert!(store.read_at(BLOCK - 2, 8).is_err());
    }

    #[test]
    fn oversized_reservation_is_rejected() {
        let tmp = TempDir::new().expect("tempdir");
        let store = DataStore::create(&tmp.path().join("data"), header(1)).expect("create");
        assert!(matches!(
            store.reserve(BLOCK),
            Err(ChronicleError::RecordTooLarge { .. })
        ));
    }

    #[test]
    fn release_rewinds_append_position() {
        let tmp = TempDir::new().expect("tempdir");
        let store = DataStore::create(&tmp.path().join("data"), header(1)).expect("create");
        let before = store.append_position();
        let reservation = store.reserve(1024).expect("reserve");
        store.release(reservation);
        assert_eq!(store.append_position(), before);
    }

    #[test]
    fn reopen_maps_grown_extents() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("data");
        let big = vec![1u8; (BLOCK / 2) as usize];
        let offset = {
            let store = DataStore::create(&path, header(9)).expect("create");
            append(&store, b"first");
            append(&store, &big);
            append(&store, &big)
        };
        assert_eq!(offset, BLOCK);

        let store = DataStore::open(&path).expect("open");
        assert_eq!(store.mapped_extents(), 2);
        store.resume_after(offset).expect("resume");
        assert_eq!(
            store.append_position(),
            offset + FRAME_HEADER_SIZE + big.len() as u64
        );
    }

    proptest! {
        #[test]
        fn appended_frames_read_back(payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..4096), 1..32)) {
            let tmp = TempDir::new().expect("tempdir");
            let store = DataStore::create(&tmp.path().join("data"), header(3)).expect("create");
            let offsets: Vec<u64> = payloads.iter().map(|p| append(&store, p)).collect();
            for (payload, offset) in payloads.iter().zip(offsets.iter()) {
                let view = store.read_frame(*offset).expect("read");
                prop_assert_eq!(view.bytes(), &payload[..]);
            }
            prop_assert!(offsets.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
