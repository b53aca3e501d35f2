use std::sync::Arc;

use crate::chronicle::ChronicleInner;
use crate::config::{CycleId, RecordNumber};
use crate::cycle::Cycle;
use crate::error::{ChronicleError, ChronicleResult};
use crate::store::DataView;

struct Loaded {
    view: DataView,
    record: RecordNumber,
    position: usize,
}

/// An independent read cursor over a chronicle.
///
/// A tailer is positioned between records. [`ExcerptTailer::next_index`]
/// loads the next committed record, if any, without blocking:
///
/// ```no_run
/// # use bop_chronicle::{Chronicle, ChronicleResult};
/// # fn demo(chronicle: &Chronicle) -> ChronicleResult<()> {
/// let mut tailer = chronicle.create_tailer()?;
/// while tailer.next_index()? {
///     let value = tailer.read_u64()?;
///     let name = tailer.read_str()?;
///     println!("{value} {name}");
///     tailer.finish();
/// }
/// # Ok(())
/// # }
/// ```
///
/// Tailers never create cycles. A cycle written later is picked up as soon
/// as the current one has nothing more to offer.
pub struct ExcerptTailer {
    chronicle: Arc<ChronicleInner>,
    cycle_id: Option<CycleId>,
    cycle: Option<Arc<Cycle>>,
    next: u64,
    current: Option<Loaded>,
}

impl ExcerptTailer {
    pub(crate) fn new(chronicle: Arc<ChronicleInner>) -> Self {
        Self {
            chronicle,
            cycle_id: None,
            cycle: None,
            next: 0,
            current: None,
        }
    }

    /// Moves before the first record of the earliest cycle.
    pub fn to_start(&mut self) -> ChronicleResult<()> {
        self.chronicle.ensure_open()?;
        self.current = None;
        match self.chronicle.cycles.first_cycle()? {
            Some(first) => self.position_at(first, 0)?,
            None => {
                self.cycle_id = None;
                self.cycle = None;
                self.next = 0;
            }
        }
        Ok(())
    }

    /// Moves onto the last committed record and loads it.
    ///
    /// Returns `false` and behaves like [`ExcerptTailer::to_start`] when the
    /// chronicle holds no records.
    pub fn to_end(&mut self) -> ChronicleResult<bool> {
        self.chronicle.ensure_open()?;
        self.current = None;
        for cycle_id in self.chronicle.cycles.list_cycles()?.into_iter().rev() {
            let Some(cycle) = self.chronicle.cycles.open_existing(cycle_id)? else {
                continue;
            };
            let count = cycle.committed_count()?;
            if count == 0 {
                continue;
            }
            self.cycle_id = Some(cycle_id);
            self.cycle = Some(cycle);
            self.next = count - 1;
            return self.load_next();
        }
        self.to_start()?;
        Ok(false)
    }

    /// Seeks directly to `record`.
    ///
    /// Returns `true` when the record is committed and now loaded. Otherwise
    /// the tailer is left positioned so that [`ExcerptTailer::next_index`]
    /// yields `record` (or the first record after it) once available.
    pub fn index(&mut self, record: RecordNumber) -> ChronicleResult<bool> {
        self.chronicle.ensure_open()?;
        self.current = None;
        let (cycle_id, index) = self.chronicle.config.split(record);
        self.position_at(cycle_id, index)?;
        self.load_next()
    }

    /// Loads the next committed record. Never blocks; `false` means the
    /// tailer is at the end of what has been written so far.
    pub fn next_index(&mut self) -> ChronicleResult<bool> {
        self.chronicle.ensure_open()?;
        self.current = None;
        loop {
            let Some(cycle_id) = self.cycle_id else {
                match self.chronicle.cycles.first_cycle_if_due()? {
                    Some(first) => {
                        self.position_at(first, 0)?;
                        continue;
                    }
                    None => return Ok(false),
                }
            };

            if self.load_next()? {
                return Ok(true);
            }

            let Some(later) = self.chronicle.cycles.next_cycle_after(cycle_id)? else {
                return Ok(false);
            };
            // The writer may have committed more here before moving on.
            if self.load_next()? {
                return Ok(true);
            }
            self.position_at(later, 0)?;
        }
    }

    fn position_at(&mut self, cycle_id: CycleId, index: u64) -> ChronicleResult<()> {
        self.cycle = self.chronicle.cycles.open_existing(cycle_id)?;
        self.cycle_id = Some(cycle_id);
        self.next = index;
        Ok(())
    }

    /// Loads the record at the current position if it is committed.
    fn load_next(&mut self) -> ChronicleResult<bool> {
        let Some(cycle_id) = self.cycle_id else {
            return Ok(false);
        };
        if self.cycle.is_none() {
            self.cycle = self.chronicle.cycles.open_existing(cycle_id)?;
        }
        let Some(cycle) = self.cycle.as_ref() else {
            return Ok(false);
        };
        let Some(offset) = cycle.index().lookup(self.next)? else {
            return Ok(false);
        };
        let view = cycle.data().read_frame(offset)?;
        let record = self.chronicle.record_number(cycle_id, self.next)?;
        self.next += 1;
        self.current = Some(Loaded {
            view,
            record,
            position: 0,
        });
        Ok(true)
    }

    /// Releases the loaded record.
    pub fn finish(&mut self) {
        self.current = None;
    }

    fn loaded(&self) -> ChronicleResult<&Loaded> {
        self.current
            .as_ref()
            .ok_or_else(|| ChronicleError::invalid_state("no excerpt loaded"))
    }

    fn take(&mut self, len: usize) -> ChronicleResult<&[u8]> {
        let loaded = self
            .current
            .as_mut()
            .ok_or_else(|| ChronicleError::invalid_state("no excerpt loaded"))?;
        let remaining = loaded.view.len() - loaded.position;
        if len > remaining {
            return Err(ChronicleError::BufferUnderflow {
                requested: len,
                remaining,
            });
        }
        let start = loaded.position;
        loaded.position += len;
        Ok(&loaded.view.bytes()[start..start + len])
    }

    fn take_array<const N: usize>(&mut self) -> ChronicleResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> ChronicleResult<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_i32(&mut self) -> ChronicleResult<i32> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> ChronicleResult<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> ChronicleResult<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> ChronicleResult<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn read_f64(&mut self) -> ChronicleResult<f64> {
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    pub fn read_bytes(&mut self, len: usize) -> ChronicleResult<&[u8]> {
        self.take(len)
    }

    /// Reads a string written with `write_str`.
    pub fn read_str(&mut self) -> ChronicleResult<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|err| ChronicleError::Parse(format!("string is not valid UTF-8: {err}")))
    }

    /// Parses a decimal integer at the read position and consumes the single
    /// byte that terminates it, if any.
    pub fn parse_i64(&mut self) -> ChronicleResult<i64> {
        let loaded = self
            .current
            .as_mut()
            .ok_or_else(|| ChronicleError::invalid_state("no excerpt loaded"))?;
        let bytes = &loaded.view.bytes()[loaded.position..];

        let mut cursor = 0;
        let negative = match bytes.first() {
            Some(b'-') => {
                cursor += 1;
                true
            }
            Some(b'+') => {
                cursor += 1;
                false
            }
            _ => false,
        };

        let digits_start = cursor;
        let mut value: i64 = 0;
        while let Some(byte) = bytes.get(cursor).copied().filter(u8::is_ascii_digit) {
            let digit = i64::from(byte - b'0');
            value = value
                .checked_mul(10)
                .and_then(|v| {
                    if negative {
                        v.checked_sub(digit)
                    } else {
                        v.checked_add(digit)
                    }
                })
                .ok_or_else(|| ChronicleError::Parse("integer overflows i64".to_string()))?;
            cursor += 1;
        }
        if cursor == digits_start {
            return Err(ChronicleError::Parse(format!(
                "expected digits at position {}",
                loaded.position
            )));
        }
        if cursor < bytes.len() {
            cursor += 1;
        }
        loaded.position += cursor;
        Ok(value)
    }

    /// Whole payload of the loaded record; empty when none is loaded.
    pub fn bytes(&self) -> &[u8] {
        self.current
            .as_ref()
            .map_or(&[][..], |loaded| loaded.view.bytes())
    }

    pub fn remaining(&self) -> usize {
        self.current
            .as_ref()
            .map_or(0, |loaded| loaded.view.len() - loaded.position)
    }

    pub fn position(&self) -> usize {
        self.current.as_ref().map_or(0, |loaded| loaded.position)
    }

    /// Record number of the loaded record.
    pub fn record_number(&self) -> Option<RecordNumber> {
        self.current.as_ref().map(|loaded| loaded.record)
    }

    /// Checksum stored with the loaded record.
    pub(crate) fn checksum(&self) -> ChronicleResult<u32> {
        Ok(self.loaded()?.view.checksum())
    }

    /// Cycle the tailer is positioned in.
    pub fn cycle(&self) -> Option<CycleId> {
        self.cycle_id
    }
}

impl std::fmt::Debug for ExcerptTailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExcerptTailer")
            .field("cycle", &self.cycle_id)
            .field("next", &self.next)
            .field("record", &self.record_number())
            .finish()
    }
}
