//! Cycle naming, opening and the per-chronicle registry of mapped cycles.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::format::{Fixed, Item, Numeric, StrftimeItems};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::{ChronicleConfig, CycleId};
use crate::error::{ChronicleError, ChronicleResult};
use crate::fs::{fsync_dir, Layout};
use crate::store::{DataHeader, DataStore, IndexStore};

/// Formats the UTC start instant of `cycle` with a strftime pattern.
///
/// Fails instead of panicking when `format` contains an unknown specifier.
pub fn format_cycle_name(
    format: &str,
    cycle_length_ms: u64,
    cycle: CycleId,
) -> ChronicleResult<String> {
    let start = i64::try_from(cycle.start_millis(cycle_length_ms)).map_err(|_| {
        ChronicleError::invalid_config(format!("cycle {cycle} starts beyond the supported range"))
    })?;
    let instant = DateTime::<Utc>::from_timestamp_millis(start).ok_or_else(|| {
        ChronicleError::invalid_config(format!("cycle {cycle} starts beyond the supported range"))
    })?;
    let mut name = String::new();
    write!(name, "{}", instant.format(format)).map_err(|_| {
        ChronicleError::invalid_config(format!("invalid cycle_format {format:?}"))
    })?;
    if name.is_empty() || name.contains(&['/', '\\'][..]) {
        return Err(ChronicleError::invalid_config(format!(
            "cycle_format {format:?} does not produce a usable directory name"
        )));
    }
    Ok(name)
}

const SECOND_MS: u64 = 1_000;
const MINUTE_MS: u64 = 60 * SECOND_MS;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;

/// Worst-case time span in milliseconds over which a strftime pattern
/// produces the same name.
///
/// A year is mandatory. Below it, each level counts only if every coarser
/// level is present: `%Y%m%d%M` resolves to a day because the hour is
/// missing. A month of 31 days, a week of 7 days and a year of 366 days
/// cover patterns that stop above the day.
pub fn cycle_name_resolution_ms(format: &str) -> ChronicleResult<u64> {
    #[derive(Default)]
    struct Fields {
        year: bool,
        century: bool,
        year_of_century: bool,
        month: bool,
        day: bool,
        ordinal: bool,
        week: bool,
        weekday: bool,
        hour: bool,
        hour12: bool,
        am_pm: bool,
        minute: bool,
        second: bool,
        fraction: bool,
        timestamp: bool,
    }

    let mut f = Fields::default();
    for item in StrftimeItems::new(format) {
        match item {
            Item::Error => {
                return Err(ChronicleError::invalid_config(format!(
                    "invalid cycle_format {format:?}"
                )))
            }
            Item::Numeric(numeric, _) => match numeric {
                Numeric::Year | Numeric::IsoYear => f.year = true,
                Numeric::YearDiv100 | Numeric::IsoYearDiv100 => f.century = true,
                Numeric::YearMod100 | Numeric::IsoYearMod100 => f.year_of_century = true,
                Numeric::Month => f.month = true,
                Numeric::Day => f.day = true,
                Numeric::Ordinal => f.ordinal = true,
                Numeric::WeekFromSun | Numeric::WeekFromMon | Numeric::IsoWeek => f.week = true,
                Numeric::NumDaysFromSun | Numeric::WeekdayFromMon => f.weekday = true,
                Numeric::Hour => f.hour = true,
                Numeric::Hour12 => f.hour12 = true,
                Numeric::Minute => f.minute = true,
                Numeric::Second => f.second = true,
                Numeric::Nanosecond => f.fraction = true,
                Numeric::Timestamp => f.timestamp = true,
                _ => {}
            },
            Item::Fixed(fixed) => match fixed {
                Fixed::ShortMonthName | Fixed::LongMonthName => f.month = true,
                Fixed::ShortWeekdayName | Fixed::LongWeekdayName => f.weekday = true,
                Fixed::LowerAmPm | Fixed::UpperAmPm => f.am_pm = true,
                Fixed::Nanosecond
                | Fixed::Nanosecond3
                | Fixed::Nanosecond6
                | Fixed::Nanosecond9 => f.fraction = true,
                Fixed::RFC2822 | Fixed::RFC3339 => f.timestamp = true,
                _ => {}
            },
            _ => {}
        }
    }

    if f.timestamp {
        return Ok(if f.fraction { 1 } else { SECOND_MS });
    }
    if !(f.year || (f.century && f.year_of_century)) {
        return Err(ChronicleError::invalid_config(format!(
            "cycle_format {format:?} does not include the year"
        )));
    }
    if !((f.month && f.day) || f.ordinal || (f.week && f.weekday)) {
        return Ok(if f.week {
            7 * DAY_MS
        } else if f.month {
            31 * DAY_MS
        } else {
            366 * DAY_MS
        });
    }
    let levels = [
        (f.hour || (f.hour12 && f.am_pm), DAY_MS),
        (f.minute, HOUR_MS),
        (f.second, MINUTE_MS),
        (f.fraction, SECOND_MS),
    ];
    for (present, coarser) in levels {
        if !present {
            return Ok(coarser);
        }
    }
    Ok(1)
}

/// One mapped cycle: its data frames and their index.
#[derive(Debug)]
pub struct Cycle {
    id: CycleId,
    name: String,
    data: DataStore,
    index: IndexStore,
}

impl Cycle {
    fn create(
        layout: &Layout,
        config: &ChronicleConfig,
        id: CycleId,
        name: String,
        created_at: i64,
    ) -> ChronicleResult<Self> {
        let dir = layout.cycle_dir(&name);
        fs::create_dir_all(&dir)?;
        let data_path = layout.data_path(&name);
        let data = if data_path.is_file() {
            let data = DataStore::open(&data_path)?;
            if data.header().cycle != id {
                return Err(ChronicleError::corruption(format!(
                    "directory {} already holds cycle {}, cannot reuse it for {}",
                    name,
                    data.header().cycle,
                    id
                )));
            }
            data
        } else {
            DataStore::create(
                &data_path,
                DataHeader {
                    cycle: id,
                    created_at,
                    cycle_length_ms: config.cycle_length_ms,
                    data_block_size: config.data_block_size,
                },
            )?
        };
        let index_path = layout.index_path(&name);
        let index = if index_path.is_file() {
            IndexStore::open(&index_path, id, config.index_block_size, config.entries_per_cycle)?
        } else {
            IndexStore::create(&index_path, id, config.index_block_size, config.entries_per_cycle)?
        };
        fsync_dir(&dir)?;
        fsync_dir(layout.root())?;

        let cycle = Self {
            id,
            name,
            data,
            index,
        };
        cycle.recover()?;
        Ok(cycle)
    }

    fn open(
        layout: &Layout,
        config: &ChronicleConfig,
        id: CycleId,
        name: String,
    ) -> ChronicleResult<Self> {
        let data = DataStore::open(&layout.data_path(&name))?;
        if data.header().cycle != id {
            return Err(ChronicleError::corruption(format!(
                "directory {} holds cycle {} instead of {}",
                name,
                data.header().cycle,
                id
            )));
        }
        let index = IndexStore::open(
            &layout.index_path(&name),
            id,
            config.index_block_size,
            config.entries_per_cycle,
        )?;
        let cycle = Self {
            id,
            name,
            data,
            index,
        };
        cycle.recover()?;
        Ok(cycle)
    }

    /// Moves the data append position past the last committed frame. Bytes of
    /// an excerpt that never reached the index are overwritten by the next one.
    fn recover(&self) -> ChronicleResult<()> {
        let committed = self.index.next_index();
        if committed == 0 {
            return Ok(());
        }
        let offset = self.index.lookup(committed - 1)?.ok_or_else(|| {
            ChronicleError::corruption(format!(
                "cycle {} lost index entry {}",
                self.name,
                committed - 1
            ))
        })?;
        self.data.resume_after(offset)
    }

    #[inline]
    pub fn id(&self) -> CycleId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn data(&self) -> &DataStore {
        &self.data
    }

    #[inline]
    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    /// Committed records, as currently visible on disk.
    pub fn committed_count(&self) -> ChronicleResult<u64> {
        self.index.committed_count()
    }

    pub fn flush(&self) -> ChronicleResult<()> {
        self.data.flush()?;
        self.index.flush()
    }
}

/// Registry of the cycles opened through one chronicle.
///
/// Every appender and tailer created from the same chronicle shares these
/// mappings. Tailers only ever call [`CycleManager::open_existing`].
#[derive(Debug)]
pub struct CycleManager {
    config: ChronicleConfig,
    layout: Layout,
    cycles: Mutex<BTreeMap<CycleId, Arc<Cycle>>>,
    /// Serializes file creation and mapping. Never held with `cycles`.
    opening: Mutex<()>,
    names: Mutex<HashMap<String, CycleId>>,
    /// Newest cycle known in-process, plus one. Zero when none.
    highest: AtomicU64,
    last_probe: Mutex<Option<Instant>>,
}

impl CycleManager {
    pub fn new(config: ChronicleConfig, layout: Layout) -> Self {
        Self {
            config,
            layout,
            cycles: Mutex::new(BTreeMap::new()),
            opening: Mutex::new(()),
            names: Mutex::new(HashMap::new()),
            highest: AtomicU64::new(0),
            last_probe: Mutex::new(None),
        }
    }

    #[inline]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    #[inline]
    pub fn current_cycle(&self, now_ms: u64) -> CycleId {
        CycleId::from_timestamp(now_ms, self.config.cycle_length_ms)
    }

    pub fn cycle_name(&self, cycle: CycleId) -> ChronicleResult<String> {
        format_cycle_name(&self.config.cycle_format, self.config.cycle_length_ms, cycle)
    }

    /// Cycle ids present on disk, ascending.
    pub fn list_cycles(&self) -> ChronicleResult<Vec<CycleId>> {
        let mut cycles = Vec::new();
        for name in self.layout.cycle_dir_names()? {
            if let Some(cycle) = self.resolve_name(&name) {
                cycles.push(cycle);
            }
        }
        cycles.sort_unstable();
        cycles.dedup();
        if let Some(last) = cycles.last() {
            self.note_cycle(*last);
        }
        Ok(cycles)
    }

    fn resolve_name(&self, name: &str) -> Option<CycleId> {
        if let Some(cycle) = self.names.lock().get(name) {
            return Some(*cycle);
        }
        let header = match DataHeader::load(&self.layout.data_path(name)) {
            Ok(header) => header,
            Err(err) => {
                debug!(name, error = %err, "skipping unreadable cycle directory");
                return None;
            }
        };
        let expected = self.cycle_name(header.cycle).ok()?;
        if expected != name || header.cycle_length_ms != self.config.cycle_length_ms {
            debug!(name, cycle = %header.cycle, "skipping cycle directory with foreign name");
            return None;
        }
        self.names.lock().insert(name.to_string(), header.cycle);
        Some(header.cycle)
    }

    fn registered(&self, cycle: CycleId) -> Option<Arc<Cycle>> {
        self.cycles.lock().get(&cycle).cloned()
    }

    /// Adds `opened` unless another thread registered the cycle first, and
    /// returns whichever mapping is now in the registry.
    fn register(&self, opened: Cycle) -> Arc<Cycle> {
        let id = opened.id();
        let registered = Arc::clone(
            self.cycles
                .lock()
                .entry(id)
                .or_insert_with(|| Arc::new(opened)),
        );
        self.note_cycle(id);
        registered
    }

    /// Opens `cycle`, creating its directory and files if absent.
    ///
    /// Fails with [`ChronicleError::RecordNumberOverflow`] when records of
    /// `cycle` cannot be numbered.
    pub fn open_or_create(&self, cycle: CycleId, now_ms: u64) -> ChronicleResult<Arc<Cycle>> {
        if let Some(existing) = self.registered(cycle) {
            return Ok(existing);
        }
        self.config.record_number(cycle, 0)?;
        let _opening = self.opening.lock();
        if let Some(existing) = self.registered(cycle) {
            return Ok(existing);
        }
        let name = self.cycle_name(cycle)?;
        let existed = self.layout.data_path(&name).is_file();
        self.layout.ensure_root()?;
        let opened = Cycle::create(
            &self.layout,
            &self.config,
            cycle,
            name.clone(),
            i64::try_from(now_ms).unwrap_or(i64::MAX),
        )?;
        if existed {
            debug!(cycle = %cycle, name = %name, "reopened cycle");
        } else {
            info!(cycle = %cycle, name = %name, "created cycle");
        }
        self.names.lock().insert(name, cycle);
        Ok(self.register(opened))
    }

    /// Opens `cycle` only if it already exists.
    pub fn open_existing(&self, cycle: CycleId) -> ChronicleResult<Option<Arc<Cycle>>> {
        if let Some(existing) = self.registered(cycle) {
            return Ok(Some(existing));
        }
        let name = self.cycle_name(cycle)?;
        if !self.layout.data_path(&name).is_file() || !self.layout.index_path(&name).is_file() {
            return Ok(None);
        }
        let _opening = self.opening.lock();
        if let Some(existing) = self.registered(cycle) {
            return Ok(Some(existing));
        }
        let opened = Cycle::open(&self.layout, &self.config, cycle, name)?;
        Ok(Some(self.register(opened)))
    }

    /// Newest cycle observed by this process.
    pub fn highest_cycle(&self) -> Option<CycleId> {
        match self.highest.load(Ordering::Acquire) {
            0 => None,
            raw => Some(CycleId::new(raw - 1)),
        }
    }

    pub fn first_cycle(&self) -> ChronicleResult<Option<CycleId>> {
        Ok(self.list_cycles()?.first().copied())
    }

    /// Like [`CycleManager::first_cycle`], but skips the directory listing
    /// until a probe is due while no cycle is known in-process.
    pub fn first_cycle_if_due(&self) -> ChronicleResult<Option<CycleId>> {
        if self.highest_cycle().is_none() && !self.probe_due() {
            return Ok(None);
        }
        self.first_cycle()
    }

    pub fn last_cycle(&self) -> ChronicleResult<Option<CycleId>> {
        Ok(self.list_cycles()?.last().copied())
    }

    /// Smallest existing cycle after `cycle`.
    ///
    /// Cycles registered in-process are seen immediately; the directory is
    /// re-listed at most once per `cycle_probe_interval_ms` otherwise.
    pub fn next_cycle_after(&self, cycle: CycleId) -> ChronicleResult<Option<CycleId>> {
        let registered = match self.highest_cycle() {
            Some(highest) if highest > cycle => self
                .cycles
                .lock()
                .range(cycle.next()..)
                .next()
                .map(|(id, _)| *id),
            _ => None,
        };
        if registered == Some(cycle.next()) {
            return Ok(registered);
        }
        if registered.is_none() && !self.probe_due() {
            return Ok(None);
        }
        let on_disk = self.list_cycles()?.into_iter().find(|id| *id > cycle);
        Ok(match (registered, on_disk) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        })
    }

    fn probe_due(&self) -> bool {
        let interval = self.config.cycle_probe_interval();
        let mut last = self.last_probe.lock();
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    fn note_cycle(&self, cycle: CycleId) {
        self.highest
            .fetch_max(cycle.as_u64().saturating_add(1), Ordering::AcqRel);
    }

    /// Flushes every mapped cycle.
    pub fn flush_all(&self) -> ChronicleResult<()> {
        let cycles: Vec<Arc<Cycle>> = self.cycles.lock().values().cloned().collect();
        for cycle in cycles {
            cycle.flush()?;
        }
        Ok(())
    }

    /// Drops every mapping held by the registry.
    pub fn clear(&self) {
        self.cycles.lock().clear();
        self.names.lock().clear();
        self.highest.store(0, Ordering::Release);
    }
}
