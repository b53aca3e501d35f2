use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::chronicle::ChronicleInner;
use crate::config::{CycleId, RecordNumber};
use crate::cycle::Cycle;
use crate::error::{ChronicleError, ChronicleResult};
use crate::store::{payload_checksum, Reservation};

struct Excerpt {
    reservation: Reservation,
    position: usize,
}

/// The single writer of a chronicle.
///
/// ```no_run
/// # use bop_chronicle::{Chronicle, ChronicleResult};
/// # fn demo(chronicle: &Chronicle) -> ChronicleResult<()> {
/// let mut appender = chronicle.create_appender()?;
/// appender.start_excerpt()?;
/// appender.write_u64(42)?;
/// appender.write_str("hello")?;
/// let record = appender.finish()?;
/// # let _ = record;
/// # Ok(())
/// # }
/// ```
///
/// Nothing written after [`ExcerptAppender::start_excerpt`] is visible to
/// tailers until [`ExcerptAppender::finish`] publishes the index entry.
pub struct ExcerptAppender {
    chronicle: Arc<ChronicleInner>,
    cycle: Option<Arc<Cycle>>,
    excerpt: Option<Excerpt>,
    last: Option<RecordNumber>,
    released: bool,
}

impl ExcerptAppender {
    pub(crate) fn new(chronicle: Arc<ChronicleInner>) -> Self {
        Self {
            chronicle,
            cycle: None,
            excerpt: None,
            last: None,
            released: false,
        }
    }

    /// Starts an excerpt with the configured default capacity.
    pub fn start_excerpt(&mut self) -> ChronicleResult<()> {
        let capacity = self.chronicle.config.default_message_size as usize;
        self.start_excerpt_with_capacity(capacity)
    }

    /// Starts an excerpt able to hold `capacity` payload bytes.
    pub fn start_excerpt_with_capacity(&mut self, capacity: usize) -> ChronicleResult<()> {
        self.ensure_usable()?;
        if self.excerpt.is_some() {
            return Err(ChronicleError::invalid_state("excerpt already started"));
        }
        let max = self.chronicle.config.max_payload_len();
        if capacity as u64 > max {
            return Err(ChronicleError::RecordTooLarge {
                len: capacity as u64,
                max,
            });
        }

        let cycle = self.writable_cycle()?;
        let reservation = cycle.data().reserve(capacity as u64)?;
        self.excerpt = Some(Excerpt {
            reservation,
            position: 0,
        });
        Ok(())
    }

    /// Picks the cycle the next record goes to, rolling over when the clock
    /// has moved on or the active cycle is out of index capacity.
    fn writable_cycle(&mut self) -> ChronicleResult<Arc<Cycle>> {
        let now = self.chronicle.now_millis();
        let by_time = self.chronicle.cycles.current_cycle(now);

        let mut cycle = match self.cycle.take() {
            Some(active) if by_time > active.id() => self.roll(active, by_time, now)?,
            Some(active) => active,
            None => {
                let newest = self.chronicle.cycles.last_cycle()?;
                let start = newest.map_or(by_time, |newest| newest.max(by_time));
                self.chronicle.cycles.open_or_create(start, now)?
            }
        };

        if cycle.index().is_full() {
            warn!(
                cycle = %cycle.id(),
                entries = cycle.index().capacity(),
                "cycle index full; forcing rollover"
            );
            cycle = self.roll(cycle, CycleId::new(0), now)?;
        }
        self.cycle = Some(Arc::clone(&cycle));
        Ok(cycle)
    }

    /// Moves from `active` to `max(target, active + 1)`.
    fn roll(&self, active: Arc<Cycle>, target: CycleId, now: u64) -> ChronicleResult<Arc<Cycle>> {
        let next = target.max(active.id().next());
        if let Err(err) = active.flush() {
            warn!(cycle = %active.id(), error = %err, "flush failed during rollover");
        }
        let cycle = self.chronicle.cycles.open_or_create(next, now)?;
        info!(from = %active.id(), to = %next, "rolled cycle");
        Ok(cycle)
    }

    fn ensure_usable(&self) -> ChronicleResult<()> {
        if self.released {
            return Err(ChronicleError::Closed);
        }
        self.chronicle.ensure_open()
    }

    fn excerpt_mut(&mut self) -> ChronicleResult<&mut Excerpt> {
        self.excerpt
            .as_mut()
            .ok_or_else(|| ChronicleError::invalid_state("no excerpt started"))
    }

    fn put(&mut self, bytes: &[u8]) -> ChronicleResult<()> {
        let excerpt = self.excerpt_mut()?;
        excerpt
            .reservation
            .write_payload(excerpt.position, bytes)?;
        excerpt.position += bytes.len();
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> ChronicleResult<()> {
        self.put(&[value])
    }

    pub fn write_i32(&mut self, value: i32) -> ChronicleResult<()> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> ChronicleResult<()> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_i64(&mut self, value: i64) -> ChronicleResult<()> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> ChronicleResult<()> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_f64(&mut self, value: f64) -> ChronicleResult<()> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> ChronicleResult<()> {
        self.put(bytes)
    }

    /// Writes a u32 length prefix followed by the UTF-8 bytes.
    pub fn write_str(&mut self, value: &str) -> ChronicleResult<()> {
        let len = u32::try_from(value.len()).map_err(|_| ChronicleError::CapacityExceeded {
            requested: value.len(),
            remaining: self.remaining(),
        })?;
        if 4 + value.len() > self.remaining() {
            return Err(ChronicleError::CapacityExceeded {
                requested: 4 + value.len(),
                remaining: self.remaining(),
            });
        }
        self.put(&len.to_le_bytes())?;
        self.put(value.as_bytes())
    }

    /// Appends `value` as decimal text.
    pub fn append_i64(&mut self, value: i64) -> ChronicleResult<&mut Self> {
        self.put(value.to_string().as_bytes())?;
        Ok(self)
    }

    pub fn append_u64(&mut self, value: u64) -> ChronicleResult<&mut Self> {
        self.put(value.to_string().as_bytes())?;
        Ok(self)
    }

    pub fn append_char(&mut self, value: char) -> ChronicleResult<&mut Self> {
        let mut buf = [0u8; 4];
        self.put(value.encode_utf8(&mut buf).as_bytes())?;
        Ok(self)
    }

    /// Appends raw UTF-8 without a length prefix.
    pub fn append_str(&mut self, value: &str) -> ChronicleResult<&mut Self> {
        self.put(value.as_bytes())?;
        Ok(self)
    }

    /// Payload bytes written to the current excerpt.
    pub fn position(&self) -> usize {
        self.excerpt.as_ref().map_or(0, |excerpt| excerpt.position)
    }

    /// Bytes still available in the current excerpt.
    pub fn remaining(&self) -> usize {
        self.excerpt.as_ref().map_or(0, |excerpt| {
            excerpt.reservation.payload_capacity() - excerpt.position
        })
    }

    pub fn capacity(&self) -> usize {
        self.excerpt
            .as_ref()
            .map_or(0, |excerpt| excerpt.reservation.payload_capacity())
    }

    pub fn is_in_excerpt(&self) -> bool {
        self.excerpt.is_some()
    }

    /// Commits the current excerpt and returns its record number.
    pub fn finish(&mut self) -> ChronicleResult<RecordNumber> {
        self.ensure_usable()?;
        let excerpt = self
            .excerpt
            .take()
            .ok_or_else(|| ChronicleError::invalid_state("no excerpt started"))?;
        let cycle = match self.cycle.as_ref() {
            Some(cycle) => Arc::clone(cycle),
            None => return Err(ChronicleError::invalid_state("excerpt has no cycle")),
        };
        self.commit(&cycle, excerpt.reservation, excerpt.position)
    }

    /// Publishes the frame in `reservation`. Until the index entry is
    /// written, any failure hands the reserved space back to the data store.
    fn commit(
        &mut self,
        cycle: &Cycle,
        reservation: Reservation,
        len: usize,
    ) -> ChronicleResult<RecordNumber> {
        if let Err(err) = self.seal(&reservation, len) {
            cycle.data().release(reservation);
            return Err(err);
        }
        cycle.data().shrink(&reservation, len);

        let index = match cycle.index().append(reservation.offset()) {
            Ok(index) => index,
            Err(err) => {
                cycle.data().release(reservation);
                return Err(err);
            }
        };
        if self.chronicle.config.synchronous {
            cycle.index().flush()?;
        }

        let record = self.chronicle.record_number(cycle.id(), index)?;
        self.last = Some(record);
        self.chronicle.commits.notify();
        Ok(record)
    }

    /// Writes the frame header and, in synchronous mode, flushes the frame.
    fn seal(&self, reservation: &Reservation, len: usize) -> ChronicleResult<()> {
        let payload_len = u32::try_from(len).map_err(|_| ChronicleError::RecordTooLarge {
            len: len as u64,
            max: u64::from(u32::MAX),
        })?;
        let checksum = payload_checksum(reservation.payload(len)?);
        reservation.write_header(payload_len, checksum)?;
        if self.chronicle.config.synchronous {
            reservation.flush(len)?;
        }
        Ok(())
    }

    /// Abandons the current excerpt without committing it.
    pub fn discard(&mut self) {
        if let Some(excerpt) = self.excerpt.take() {
            if let Some(cycle) = self.cycle.as_ref() {
                cycle.data().release(excerpt.reservation);
            }
        }
    }

    /// Record number of the last record committed by this appender.
    pub fn last_record_number(&self) -> Option<RecordNumber> {
        self.last
    }

    /// Cycle currently written to, if any record has been started.
    pub fn cycle(&self) -> Option<CycleId> {
        self.cycle.as_ref().map(|cycle| cycle.id())
    }

    /// Commits `payload` at exactly `record`, as received from a replication peer.
    ///
    /// The record must directly follow what is already stored: the next index
    /// of its cycle, with cycles only ever moving forward.
    pub(crate) fn append_replicated(
        &mut self,
        record: RecordNumber,
        payload: &[u8],
    ) -> ChronicleResult<()> {
        self.ensure_usable()?;
        if self.excerpt.is_some() {
            return Err(ChronicleError::invalid_state("excerpt already started"));
        }
        let max = self.chronicle.config.max_payload_len();
        if payload.len() as u64 > max {
            return Err(ChronicleError::RecordTooLarge {
                len: payload.len() as u64,
                max,
            });
        }

        let (cycle_id, index) = self.chronicle.config.split(record);
        let now = self.chronicle.now_millis();
        let cycle = match self.cycle.take() {
            Some(active) if active.id() == cycle_id => active,
            Some(active) if active.id() > cycle_id => {
                let active_id = active.id();
                self.cycle = Some(active);
                return Err(ChronicleError::protocol(format!(
                    "record {record} belongs to cycle {cycle_id} before active cycle {active_id}"
                )));
            }
            Some(active) => {
                if let Err(err) = active.flush() {
                    warn!(cycle = %active.id(), error = %err, "flush failed during rollover");
                }
                debug!(from = %active.id(), to = %cycle_id, "replicated rollover");
                self.chronicle.cycles.open_or_create(cycle_id, now)?
            }
            None => {
                if let Some(newest) = self.chronicle.cycles.last_cycle()? {
                    if newest > cycle_id {
                        return Err(ChronicleError::protocol(format!(
                            "record {record} belongs to cycle {cycle_id} before stored cycle {newest}"
                        )));
                    }
                }
                self.chronicle.cycles.open_or_create(cycle_id, now)?
            }
        };
        self.cycle = Some(Arc::clone(&cycle));

        let expected = cycle.index().next_index();
        if index != expected {
            let reason = if index < expected { "duplicate" } else { "gap before" };
            return Err(ChronicleError::protocol(format!(
                "{reason} record {record}: cycle {cycle_id} expects index {expected}, got {index}"
            )));
        }

        let reservation = cycle.data().reserve(payload.len() as u64)?;
        if let Err(err) = reservation.write_payload(0, payload) {
            cycle.data().release(reservation);
            return Err(err);
        }
        self.commit(&cycle, reservation, payload.len())?;
        Ok(())
    }

    /// Abandons any open excerpt and releases the appender claim.
    pub fn close(&mut self) {
        self.discard();
        if !self.released {
            self.released = true;
            self.chronicle.release_appender();
        }
    }
}

impl Drop for ExcerptAppender {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ExcerptAppender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExcerptAppender")
            .field("cycle", &self.cycle())
            .field("in_excerpt", &self.is_in_excerpt())
            .field("last", &self.last)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{small_config, ManualClock};
    use crate::Chronicle;
    use tempfile::TempDir;

    fn open(tmp: &TempDir, start_ms: u64) -> (Chronicle, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start_ms));
        let chronicle =
            Chronicle::open_with_clock(small_config(tmp.path()), clock.clone()).expect("open");
        (chronicle, clock)
    }

    #[test]
    fn record_numbers_are_consecutive() {
        let tmp = TempDir::new().expect("tempdir");
        let (chronicle, _) = open(&tmp, 5_000);
        let mut appender = chronicle.create_appender().expect("appender");

        let mut records = Vec::new();
        for i in 0..5u64 {
            appender.start_excerpt().expect("start");
            appender.write_u64(i).expect("write");
            records.push(appender.finish().expect("finish"));
        }
        for pair in records.windows(2) {
            assert_eq!(pair[1], pair[0].next());
        }
        let (cycle, index) = chronicle.config().split(records[0]);
        assert_eq!(cycle, CycleId::new(5));
        assert_eq!(index, 0);
    }

    #[test]
    fn writes_past_capacity_fail() {
        let tmp = TempDir::new().expect("tempdir");
        let (chronicle, _) = open(&tmp, 1_000);
        let mut appender = chronicle.create_appender().expect("appender");
        appender.start_excerpt_with_capacity(8).expect("start");
        appender.write_u64(1).expect("fits");
        assert!(matches!(
            appender.write_u8(1),
            Err(ChronicleError::CapacityExceeded {
                requested: 1,
                remaining: 0
            })
        ));
        appender.finish().expect("finish");
    }

    #[test]
    fn writes_without_excerpt_fail() {
        let tmp = TempDir::new().expect("tempdir");
        let (chronicle, _) = open(&tmp, 1_000);
        let mut appender = chronicle.create_appender().expect("appender");
        assert!(matches!(
            appender.write_u8(1),
            Err(ChronicleError::InvalidState(_))
        ));
        assert!(appender.finish().is_err());
    }

    #[test]
    fn oversized_capacity_is_rejected() {
        let tmp = TempDir::new().expect("tempdir");
        let (chronicle, _) = open(&tmp, 1_000);
        let mut appender = chronicle.create_appender().expect("appender");
        let too_big = chronicle.config().max_payload_len() as usize + 1;
        assert!(matches!(
            appender.start_excerpt_with_capacity(too_big),
            Err(ChronicleError::RecordTooLarge { .. })
        ));
    }

    #[test]
    fn clock_rollover_moves_forward_only() {
        let tmp = TempDir::new().expect("tempdir");
        let (chronicle, clock) = open(&tmp, 20_000);
        let mut appender = chronicle.create_appender().expect("appender");

        appender.start_excerpt().expect("start");
        appender.finish().expect("finish");
        assert_eq!(appender.cycle(), Some(CycleId::new(20)));

        clock.advance(2_500);
        appender.start_excerpt().expect("start");
        let record = appender.finish().expect("finish");
        assert_eq!(appender.cycle(), Some(CycleId::new(22)));
        assert_eq!(chronicle.config().split(record), (CycleId::new(22), 0));

        clock.set(10_000);
        appender.start_excerpt().expect("start");
        appender.finish().expect("finish");
        assert_eq!(appender.cycle(), Some(CycleId::new(22)));
    }

    #[test]
    fn full_cycle_forces_next_cycle() {
        let tmp = TempDir::new().expect("tempdir");
        let clock = Arc::new(ManualClock::new(3_000));
        let mut config = small_config(tmp.path());
        config.entries_per_cycle = 16;
        let chronicle = Chronicle::open_with_clock(config, clock).expect("open");
        let mut appender = chronicle.create_appender().expect("appender");

        let mut last = RecordNumber::ZERO;
        for _ in 0..17 {
            appender.start_excerpt_with_capacity(8).expect("start");
            appender.write_u64(7).expect("write");
            last = appender.finish().expect("finish");
        }
        assert_eq!(chronicle.config().split(last), (CycleId::new(4), 0));
        assert_eq!(chronicle.count().expect("count"), 17);
    }

    #[test]
    fn failed_commit_returns_reserved_space() {
        let tmp = TempDir::new().expect("tempdir");
        let clock = Arc::new(ManualClock::new(3_000));
        let mut config = small_config(tmp.path());
        config.entries_per_cycle = 16;
        let chronicle = Chronicle::open_with_clock(config, clock).expect("open");
        let mut appender = chronicle.create_appender().expect("appender");

        appender.start_excerpt().expect("start");
        appender.write_u64(1).expect("write");
        let offset = appender
            .excerpt
            .as_ref()
            .expect("excerpt")
            .reservation
            .offset();
        let cycle = Arc::clone(appender.cycle.as_ref().expect("cycle"));
        // Another writer of the same cycle used up every slot meanwhile.
        for i in 0..16 {
            cycle.index().append(64 + i * 8).expect("fill");
        }

        assert!(matches!(
            appender.finish(),
            Err(ChronicleError::CycleFull(CycleId(3)))
        ));
        assert!(!appender.is_in_excerpt());
        assert_eq!(cycle.data().append_position(), offset);

        appender.start_excerpt().expect("start after failure");
        appender.write_u64(2).expect("write");
        let record = appender.finish().expect("finish");
        assert_eq!(chronicle.config().split(record), (CycleId::new(4), 0));
    }

    #[test]
    fn synchronous_commits_are_readable() {
        let tmp = TempDir::new().expect("tempdir");
        let mut config = small_config(tmp.path());
        config.synchronous = true;
        let chronicle =
            Chronicle::open_with_clock(config, Arc::new(ManualClock::new(2_000))).expect("open");
        let mut appender = chronicle.create_appender().expect("appender");
        appender.start_excerpt().expect("start");
        appender.write_str("durable").expect("write");
        let record = appender.finish().expect("finish");

        let mut tailer = chronicle.create_tailer().expect("tailer");
        assert!(tailer.next_index().expect("next"));
        assert_eq!(tailer.record_number(), Some(record));
        assert_eq!(tailer.read_str().expect("read"), "durable");
    }

    #[test]
    fn discarded_excerpt_is_not_committed() {
        let tmp = TempDir::new().expect("tempdir");
        let (chronicle, _) = open(&tmp, 1_000);
        let mut appender = chronicle.create_appender().expect("appender");
        appender.start_excerpt().expect("start");
        appender.write_u64(99).expect("write");
        appender.discard();
        assert_eq!(chronicle.count().expect("count"), 0);

        appender.start_excerpt().expect("start");
        appender.write_u64(1).expect("write");
        appender.finish().expect("finish");
        assert_eq!(chronicle.count().expect("count"), 1);
    }

    #[test]
    fn reopened_chronicle_continues_numbering() {
        let tmp = TempDir::new().expect("tempdir");
        let first = {
            let (chronicle, _) = open(&tmp, 7_000);
            let mut appender = chronicle.create_appender().expect("appender");
            appender.start_excerpt().expect("start");
            appender.write_str("one").expect("write");
            appender.finish().expect("finish")
        };
        let (chronicle, _) = open(&tmp, 7_100);
        let mut appender = chronicle.create_appender().expect("appender");
        appender.start_excerpt().expect("start");
        appender.write_str("two").expect("write");
        assert_eq!(appender.finish().expect("finish"), first.next());
    }

    #[test]
    fn replicated_appends_reject_gaps_and_duplicates() {
        let tmp = TempDir::new().expect("tempdir");
        let (chronicle, _) = open(&tmp, 1_000);
        let config = chronicle.config().clone();
        let mut appender = chronicle.create_appender().expect("appender");

        let r0 = config.record_number(CycleId::new(40), 0).expect("record");
        appender.append_replicated(r0, b"zero").expect("first");
        appender
            .append_replicated(r0.next(), b"one")
            .expect("second");

        assert!(matches!(
            appender.append_replicated(r0, b"again"),
            Err(ChronicleError::Protocol(_))
        ));
        assert!(matches!(
            appender.append_replicated(
                config.record_number(CycleId::new(40), 5).expect("record"),
                b"gap"
            ),
            Err(ChronicleError::Protocol(_))
        ));
        assert!(matches!(
            appender.append_replicated(
                config.record_number(CycleId::new(39), 0).expect("record"),
                b"old"
            ),
            Err(ChronicleError::Protocol(_))
        ));
        appender
            .append_replicated(
                config.record_number(CycleId::new(42), 0).expect("record"),
                b"later",
            )
            .expect("next cycle");
        assert_eq!(chronicle.count().expect("count"), 3);
    }
}
