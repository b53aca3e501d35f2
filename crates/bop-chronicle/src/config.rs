use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::cycle::{cycle_name_resolution_ms, format_cycle_name};
use crate::error::{ChronicleError, ChronicleResult};
use crate::store::{DATA_HEADER_SIZE, FRAME_HEADER_SIZE};

/// Smallest index block (one page of 512 entries).
const INDEX_BLOCK_MIN_BYTES: u64 = 4 * 1024;

/// Largest index block.
const INDEX_BLOCK_MAX_BYTES: u64 = 1 << 30;

/// Smallest data extent.
const DATA_BLOCK_MIN_BYTES: u64 = 64 * 1024;

/// Largest data extent. Frame lengths are stored as `u32`.
const DATA_BLOCK_MAX_BYTES: u64 = 1 << 32;

/// Entries per cycle must leave room for the cycle id in the high bits.
const ENTRIES_PER_CYCLE_MIN: u64 = 1 << 4;
const ENTRIES_PER_CYCLE_MAX: u64 = 1 << 40;

const DEFAULT_CYCLE_LENGTH_MS: u64 = 24 * 60 * 60 * 1000;
const DEFAULT_CYCLE_FORMAT: &str = "%Y%m%d";
const DEFAULT_ENTRIES_PER_CYCLE: u64 = 1 << 20;
const DEFAULT_INDEX_BLOCK_BYTES: u64 = 16 * 1024;
const DEFAULT_DATA_BLOCK_BYTES: u64 = 64 * 1024 * 1024;
const DEFAULT_MESSAGE_SIZE: u64 = 128 * 1024;
const DEFAULT_CYCLE_PROBE_INTERVAL_MS: u64 = 10;

/// Last millisecond of 9999-12-31 UTC. Every cycle up to this instant must
/// have a record number.
const MAX_TIMESTAMP_MS: u64 = 253_402_300_799_999;

const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 2_500;
const DEFAULT_SOURCE_POLL_INTERVAL_MS: u64 = 50;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_RECONNECT_INITIAL_MS: u64 = 10;
const DEFAULT_RECONNECT_MAX_MS: u64 = 1_000;

/// Computes the largest power of two that is less than or equal to the input value.
#[inline]
fn floor_power_of_two(value: u64) -> u64 {
    if value == 0 {
        0
    } else {
        let shift = 63_u32 - value.leading_zeros();
        1_u64 << shift
    }
}

/// Clamps a value to the given range and rounds to the nearest power of two.
#[inline]
fn clamp_power_of_two(value: u64, min: u64, max: u64) -> u64 {
    let clamped = value.clamp(min, max);
    if clamped.is_power_of_two() {
        return clamped;
    }

    let lower = floor_power_of_two(clamped).max(min);
    let upper = (lower << 1).min(max).max(min);

    if clamped - lower <= upper.saturating_sub(clamped) {
        lower
    } else {
        upper
    }
}

/// Identifier of a time-bounded cycle.
///
/// A cycle id is `floor(timestamp_ms / cycle_length_ms)`, so ids grow with
/// wall-clock time and sort in creation order.
///
/// ```rust
/// use bop_chronicle::CycleId;
///
/// let id = CycleId::from_timestamp(5_500, 1_000);
/// assert_eq!(id, CycleId::new(5));
/// assert_eq!(id.next().as_u64(), 6);
/// ```
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CycleId(pub u64);

impl CycleId {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Derives the cycle containing `timestamp_ms`.
    #[inline]
    pub const fn from_timestamp(timestamp_ms: u64, cycle_length_ms: u64) -> Self {
        Self(timestamp_ms / cycle_length_ms)
    }

    /// Start of the cycle in milliseconds since the epoch.
    #[inline]
    pub const fn start_millis(self, cycle_length_ms: u64) -> u64 {
        self.0.saturating_mul(cycle_length_ms)
    }

    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl From<u64> for CycleId {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Logical, globally ordered record number.
///
/// # Encoding Format
///
/// ```text
/// | 64 - index_bits | index_bits        |
/// | Cycle ID        | Index in cycle    |
/// ```
///
/// `index_bits` is `log2(entries_per_cycle)`, so two chronicles agree on
/// record numbers only when they share `entries_per_cycle`.
///
/// ```rust
/// use bop_chronicle::{CycleId, RecordNumber};
///
/// let rn = RecordNumber::from_parts(CycleId::new(3), 17, 20).expect("fits");
/// assert_eq!(rn.cycle(20), CycleId::new(3));
/// assert_eq!(rn.index(20), 17);
///
/// // 44 high bits cannot hold a cycle id of 2^50.
/// assert!(RecordNumber::from_parts(CycleId::new(1 << 50), 0, 20).is_none());
/// ```
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RecordNumber(pub u64);

impl RecordNumber {
    /// The first possible record number; used as "resume from the beginning".
    pub const ZERO: RecordNumber = RecordNumber(0);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Packs `cycle` and `index`, or `None` when either part overflows its
    /// bit field.
    #[inline]
    pub const fn from_parts(cycle: CycleId, index: u64, index_bits: u32) -> Option<Self> {
        if index_bits == 0 || index_bits >= 64 {
            return None;
        }
        if index >> index_bits != 0 || cycle.0 >> (64 - index_bits) != 0 {
            return None;
        }
        match cycle.0.checked_shl(index_bits) {
            Some(high) => Some(Self(high | index)),
            None => None,
        }
    }

    #[inline]
    pub const fn cycle(self, index_bits: u32) -> CycleId {
        CycleId(self.0 >> index_bits)
    }

    #[inline]
    pub const fn index(self, index_bits: u32) -> u64 {
        self.0 & ((1u64 << index_bits) - 1)
    }

    /// The record number that directly follows this one inside the same cycle.
    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl From<u64> for RecordNumber {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<RecordNumber> for u64 {
    #[inline]
    fn from(value: RecordNumber) -> Self {
        value.0
    }
}

impl Display for RecordNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Primary configuration surface for a chronicle instance.
///
/// ```rust
/// use bop_chronicle::ChronicleConfig;
/// use std::path::PathBuf;
///
/// let config = ChronicleConfig {
///     root_dir: PathBuf::from("/data/chronicle"),
///     cycle_length_ms: 1_000,
///     cycle_format: "%Y%m%d%H%M%S".to_string(),
///     ..ChronicleConfig::default()
/// }
/// .normalized();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChronicleConfig {
    /// Directory holding one subdirectory per cycle.
    pub root_dir: PathBuf,

    /// Length of a cycle in milliseconds.
    pub cycle_length_ms: u64,

    /// strftime pattern used to name cycle directories from the cycle's start
    /// instant (UTC). Must distinguish consecutive cycles.
    pub cycle_format: String,

    /// Maximum number of records per cycle. Rounded to a power of two.
    pub entries_per_cycle: u64,

    /// Size in bytes of one index block. Rounded to a power of two.
    pub index_block_size: u64,

    /// Size in bytes of one data extent; the data file grows by this amount.
    pub data_block_size: u64,

    /// Capacity reserved by `start_excerpt` when no explicit size is given.
    pub default_message_size: u64,

    /// msync the record and its index entry on every `finish`.
    pub synchronous: bool,

    /// Minimum interval between directory scans performed by a tailer that
    /// is waiting at the end of a cycle.
    pub cycle_probe_interval_ms: u64,
}

impl Default for ChronicleConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./data/chronicle"),
            cycle_length_ms: DEFAULT_CYCLE_LENGTH_MS,
            cycle_format: DEFAULT_CYCLE_FORMAT.to_string(),
            entries_per_cycle: DEFAULT_ENTRIES_PER_CYCLE,
            index_block_size: DEFAULT_INDEX_BLOCK_BYTES,
            data_block_size: DEFAULT_DATA_BLOCK_BYTES,
            default_message_size: DEFAULT_MESSAGE_SIZE,
            synchronous: false,
            cycle_probe_interval_ms: DEFAULT_CYCLE_PROBE_INTERVAL_MS,
        }
    }
}

impl ChronicleConfig {
    /// Returns a copy with sizes rounded into their power-of-two windows and
    /// zero values replaced by defaults.
    pub fn normalized(mut self) -> Self {
        if self.cycle_length_ms == 0 {
            self.cycle_length_ms = DEFAULT_CYCLE_LENGTH_MS;
        }
        if self.cycle_format.trim().is_empty() {
            self.cycle_format = DEFAULT_CYCLE_FORMAT.to_string();
        }

        let entries = if self.entries_per_cycle == 0 {
            DEFAULT_ENTRIES_PER_CYCLE
        } else {
            self.entries_per_cycle
        };
        self.entries_per_cycle =
            clamp_power_of_two(entries, ENTRIES_PER_CYCLE_MIN, ENTRIES_PER_CYCLE_MAX);

        let index_block = if self.index_block_size == 0 {
            DEFAULT_INDEX_BLOCK_BYTES
        } else {
            self.index_block_size
        };
        self.index_block_size =
            clamp_power_of_two(index_block, INDEX_BLOCK_MIN_BYTES, INDEX_BLOCK_MAX_BYTES);

        let data_block = if self.data_block_size == 0 {
            DEFAULT_DATA_BLOCK_BYTES
        } else {
            self.data_block_size
        };
        self.data_block_size =
            clamp_power_of_two(data_block, DATA_BLOCK_MIN_BYTES, DATA_BLOCK_MAX_BYTES);

        if self.default_message_size == 0 {
            self.default_message_size = DEFAULT_MESSAGE_SIZE;
        }
        self.default_message_size = self.default_message_size.min(self.max_payload_len());

        self
    }

    /// Checks invariants that normalization cannot repair.
    pub fn validate(&self) -> ChronicleResult<()> {
        if self.root_dir.as_os_str().is_empty() {
            return Err(ChronicleError::invalid_config("root_dir must not be empty"));
        }
        if self.cycle_length_ms == 0 {
            return Err(ChronicleError::invalid_config(
                "cycle_length_ms must be positive",
            ));
        }
        if !self.entries_per_cycle.is_power_of_two()
            || !(ENTRIES_PER_CYCLE_MIN..=ENTRIES_PER_CYCLE_MAX).contains(&self.entries_per_cycle)
        {
            return Err(ChronicleError::invalid_config(format!(
                "entries_per_cycle must be a power of two between {} and {}",
                ENTRIES_PER_CYCLE_MIN, ENTRIES_PER_CYCLE_MAX
            )));
        }
        if !self.index_block_size.is_power_of_two() || self.index_block_size < 8 {
            return Err(ChronicleError::invalid_config(
                "index_block_size must be a power of two of at least 8 bytes",
            ));
        }
        if self.data_block_size <= DATA_HEADER_SIZE + FRAME_HEADER_SIZE {
            return Err(ChronicleError::invalid_config(
                "data_block_size must exceed the data header and one frame header",
            ));
        }
        if self.max_payload_len() > u64::from(u32::MAX) {
            return Err(ChronicleError::invalid_config(format!(
                "data_block_size {} allows payloads longer than a u32 frame length",
                self.data_block_size
            )));
        }
        if self.default_message_size > self.max_payload_len() {
            return Err(ChronicleError::invalid_config(format!(
                "default_message_size {} exceeds the largest payload {}",
                self.default_message_size,
                self.max_payload_len()
            )));
        }

        // The top cycle id plus the top index must stay below the heartbeat
        // marker `u64::MAX`.
        let last_cycle = CycleId::from_timestamp(MAX_TIMESTAMP_MS, self.cycle_length_ms);
        let cycle_bits = 64 - self.index_bits();
        if last_cycle.as_u64() >= (1u64 << cycle_bits) - 1 {
            return Err(ChronicleError::invalid_config(format!(
                "{} cycle bits cannot number {} ms cycles through year 9999; \
                 lower entries_per_cycle or lengthen the cycle",
                cycle_bits, self.cycle_length_ms
            )));
        }

        // Each name must cover no more than one cycle, so consecutive cycles
        // never share a directory.
        let resolution = cycle_name_resolution_ms(&self.cycle_format)?;
        if self.cycle_length_ms < resolution {
            return Err(ChronicleError::invalid_config(format!(
                "cycle_format {:?} only changes every {} ms, longer than the cycle length of {} ms",
                self.cycle_format, resolution, self.cycle_length_ms
            )));
        }
        let sample = CycleId::from_timestamp(1_600_000_000_000, self.cycle_length_ms);
        let first = format_cycle_name(&self.cycle_format, self.cycle_length_ms, sample)?;
        let second = format_cycle_name(&self.cycle_format, self.cycle_length_ms, sample.next())?;
        if first == second {
            return Err(ChronicleError::invalid_config(format!(
                "cycle_format {:?} is too coarse for a cycle length of {} ms",
                self.cycle_format, self.cycle_length_ms
            )));
        }
        Ok(())
    }

    /// Number of low bits of a record number used for the index within a cycle.
    #[inline]
    pub fn index_bits(&self) -> u32 {
        self.entries_per_cycle.trailing_zeros()
    }

    /// Number of index entries held by one index block.
    #[inline]
    pub fn index_block_capacity(&self) -> u64 {
        self.index_block_size / 8
    }

    /// Largest payload that fits into one data extent.
    #[inline]
    pub fn max_payload_len(&self) -> u64 {
        self.data_block_size
            .saturating_sub(DATA_HEADER_SIZE + FRAME_HEADER_SIZE)
    }

    /// Packs `cycle` and `index` into a record number.
    ///
    /// Fails with [`ChronicleError::RecordNumberOverflow`] when the cycle id
    /// needs more than `64 - index_bits` bits or the index is out of range.
    #[inline]
    pub fn record_number(&self, cycle: CycleId, index: u64) -> ChronicleResult<RecordNumber> {
        let index_bits = self.index_bits();
        RecordNumber::from_parts(cycle, index, index_bits).ok_or(
            ChronicleError::RecordNumberOverflow {
                cycle,
                index,
                index_bits,
            },
        )
    }

    /// Inverse of [`ChronicleConfig::record_number`].
    #[inline]
    pub fn split(&self, record: RecordNumber) -> (CycleId, u64) {
        let bits = self.index_bits();
        (record.cycle(bits), record.index(bits))
    }

    /// Minimum pause between directory scans for a new cycle.
    #[inline]
    pub fn cycle_probe_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_probe_interval_ms)
    }
}

impl Display for ChronicleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ChronicleConfig(root_dir={:?}, cycle_length_ms={}, cycle_format={:?}, entries_per_cycle={}, index_block_size={}, data_block_size={}, default_message_size={}, synchronous={})",
            self.root_dir,
            self.cycle_length_ms,
            self.cycle_format,
            self.entries_per_cycle,
            self.index_block_size,
            self.data_block_size,
            self.default_message_size,
            self.synchronous
        )
    }
}

/// Configuration for a replication source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Address to bind. Port `0` picks an ephemeral port; the bound address is
    /// reported through [`ConnectionListener::on_bind`](crate::ConnectionListener::on_bind).
    pub bind_addr: SocketAddr,

    /// Idle time after which a heartbeat frame is sent to a caught-up sink.
    pub heartbeat_interval_ms: u64,

    /// Upper bound on how long a caught-up connection sleeps before polling
    /// the index again when no commit notification arrives.
    pub poll_interval_ms: u64,

    /// How long a new connection may take to send its resume request.
    pub handshake_timeout_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            poll_interval_ms: DEFAULT_SOURCE_POLL_INTERVAL_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
        }
    }
}

impl SourceConfig {
    /// Default settings listening on `bind_addr`.
    pub fn with_bind_addr(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Self::default()
        }
    }

    /// Replaces zero intervals and timeouts by their defaults.
    pub fn normalized(mut self) -> Self {
        if self.heartbeat_interval_ms == 0 {
            self.heartbeat_interval_ms = DEFAULT_HEARTBEAT_INTERVAL_MS;
        }
        if self.poll_interval_ms == 0 {
            self.poll_interval_ms = DEFAULT_SOURCE_POLL_INTERVAL_MS;
        }
        if self.handshake_timeout_ms == 0 {
            self.handshake_timeout_ms = DEFAULT_HANDSHAKE_TIMEOUT_MS;
        }
        self
    }

    /// See [`SourceConfig::heartbeat_interval_ms`].
    #[inline]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[inline]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[inline]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Configuration for a replication sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Address of the source, e.g. `"localhost:7070"`.
    pub connect_addr: String,

    /// Upper bound on establishing one TCP connection.
    pub connect_timeout_ms: u64,

    /// Heartbeat interval the source is configured with. Must match the
    /// source's [`SourceConfig::heartbeat_interval_ms`] so that an idle but
    /// healthy connection is not mistaken for a dead one.
    pub expected_heartbeat_ms: u64,

    /// A connection that delivers nothing, not even a heartbeat, for this
    /// long is considered dead. `0` means twice `expected_heartbeat_ms`.
    pub read_timeout_ms: u64,

    /// First reconnect delay; doubles on every failed attempt.
    pub reconnect_initial_ms: u64,

    /// Cap for the reconnect delay.
    pub reconnect_max_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            connect_addr: String::from("127.0.0.1:0"),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            expected_heartbeat_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            read_timeout_ms: 0,
            reconnect_initial_ms: DEFAULT_RECONNECT_INITIAL_MS,
            reconnect_max_ms: DEFAULT_RECONNECT_MAX_MS,
        }
    }
}

impl SinkConfig {
    /// Default settings connecting to `connect_addr`.
    pub fn with_connect_addr(connect_addr: impl Into<String>) -> Self {
        Self {
            connect_addr: connect_addr.into(),
            ..Self::default()
        }
    }

    /// Replaces zero values by their defaults and derives the read timeout
    /// from `expected_heartbeat_ms` when it is unset.
    pub fn normalized(mut self) -> Self {
        if self.connect_timeout_ms == 0 {
            self.connect_timeout_ms = DEFAULT_CONNECT_TIMEOUT_MS;
        }
        if self.expected_heartbeat_ms == 0 {
            self.expected_heartbeat_ms = DEFAULT_HEARTBEAT_INTERVAL_MS;
        }
        if self.read_timeout_ms == 0 {
            self.read_timeout_ms = self.expected_heartbeat_ms.saturating_mul(2);
        }
        if self.reconnect_initial_ms == 0 {
            self.reconnect_initial_ms = DEFAULT_RECONNECT_INITIAL_MS;
        }
        if self.reconnect_max_ms < self.reconnect_initial_ms {
            self.reconnect_max_ms = self.reconnect_initial_ms;
        }
        self
    }

    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[inline]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_reasonable() {
        let cfg = ChronicleConfig::default().normalized();
        assert!(cfg.entries_per_cycle.is_power_of_two());
        assert!(cfg.index_block_size.is_power_of_two());
        assert!(cfg.data_block_size.is_power_of_two());
        assert_eq!(cfg.index_bits(), 20);
        assert_eq!(cfg.index_block_capacity(), 2048);
        assert!(cfg.default_message_size <= cfg.max_payload_len());
        cfg.validate().expect("defaults validate");
    }

    #[test]
    fn normalized_rounds_sizes() {
        let cfg = ChronicleConfig {
            entries_per_cycle: 1000,
            index_block_size: 5000,
            data_block_size: 1,
            default_message_size: u64::MAX,
            ..ChronicleConfig::default()
        }
        .normalized();

        assert_eq!(cfg.entries_per_cycle, 1024);
        assert_eq!(cfg.index_block_size, 4096);
        assert_eq!(cfg.data_block_size, DATA_BLOCK_MIN_BYTES);
        assert_eq!(cfg.default_message_size, cfg.max_payload_len());
    }

    #[test]
    fn coarse_cycle_format_is_rejected() {
        let cfg = ChronicleConfig {
            cycle_length_ms: 1_000,
            cycle_format: "%Y%m%d".to_string(),
            ..ChronicleConfig::default()
        }
        .normalized();
        assert!(matches!(
            cfg.validate(),
            Err(ChronicleError::InvalidConfig(_))
        ));

        let cfg = ChronicleConfig {
            cycle_format: "%Y%m%d%H%M%S".to_string(),
            ..cfg
        };
        cfg.validate().expect("second resolution validates");
    }

    #[test]
    fn serde_round_trip() {
        let cfg = ChronicleConfig::default();
        let json = serde_json::to_string(&cfg).expect("serialize");
        let decoded: ChronicleConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(cfg, decoded);

        let partial: SinkConfig =
            serde_json::from_str(r#"{"connect_addr":"localhost:9000"}"#).expect("deserialize");
        assert_eq!(partial.connect_addr, "localhost:9000");
        assert_eq!(partial.reconnect_max_ms, DEFAULT_RECONNECT_MAX_MS);
    }

    #[test]
    fn record_number_pack_unpack() {
        let cfg = ChronicleConfig::default().normalized();
        let rn = cfg
            .record_number(CycleId::new(19_000), 4096)
            .expect("fits");
        assert_eq!(cfg.split(rn), (CycleId::new(19_000), 4096));
        let next_cycle = cfg.record_number(CycleId::new(19_001), 0).expect("fits");
        assert!(next_cycle > rn);
    }

    #[test]
    fn record_number_rejects_overflowing_parts() {
        let cfg = ChronicleConfig {
            entries_per_cycle: 1 << 40,
            ..ChronicleConfig::default()
        }
        .normalized();
        assert_eq!(cfg.index_bits(), 40);

        // 1.7e12 ms seen through one-second cycles needs 31 bits; 24 remain.
        let err = cfg
            .record_number(CycleId::new(1_700_000_000), 0)
            .expect_err("cycle too large");
        assert!(matches!(
            err,
            ChronicleError::RecordNumberOverflow { index_bits: 40, .. }
        ));
        assert!(cfg.record_number(CycleId::new(1), 1 << 40).is_err());
        assert!(RecordNumber::from_parts(CycleId::new(1), 0, 64).is_none());
        assert!(RecordNumber::from_parts(CycleId::new(1), 0, 0).is_none());

        let top = RecordNumber::from_parts(CycleId::new((1 << 24) - 1), (1 << 40) - 1, 40)
            .expect("all bits set");
        assert_eq!(top.as_u64(), u64::MAX);
    }

    #[test]
    fn wide_index_needs_long_cycles() {
        let cfg = ChronicleConfig {
            cycle_length_ms: 1_000,
            cycle_format: "%Y%m%d%H%M%S".to_string(),
            entries_per_cycle: 1 << 40,
            ..ChronicleConfig::default()
        }
        .normalized();
        assert!(matches!(
            cfg.validate(),
            Err(ChronicleError::InvalidConfig(_))
        ));

        // Daily cycles through year 9999 fit into 24 bits.
        let daily = ChronicleConfig {
            cycle_length_ms: DEFAULT_CYCLE_LENGTH_MS,
            cycle_format: DEFAULT_CYCLE_FORMAT.to_string(),
            ..cfg
        };
        daily.validate().expect("daily cycles validate");
        let last = CycleId::from_timestamp(MAX_TIMESTAMP_MS, daily.cycle_length_ms);
        let rn = daily.record_number(last, 0).expect("last cycle fits");
        assert_eq!(daily.split(rn), (last, 0));

        // The default index width rejects one-millisecond cycles.
        let millis = ChronicleConfig {
            cycle_length_ms: 1,
            cycle_format: "%Y%m%d%H%M%S%.3f".to_string(),
            ..ChronicleConfig::default()
        }
        .normalized();
        assert!(millis.validate().is_err());
    }

    #[test]
    fn cycle_format_must_change_every_cycle() {
        let hourly_names = |cycle_length_ms: u64| {
            ChronicleConfig {
                cycle_length_ms,
                cycle_format: "%Y%m%d%H".to_string(),
                ..ChronicleConfig::default()
            }
            .normalized()
        };
        // 59 minute cycles would put two cycle starts into one hour.
        assert!(matches!(
            hourly_names(59 * 60 * 1000).validate(),
            Err(ChronicleError::InvalidConfig(_))
        ));
        hourly_names(60 * 60 * 1000).validate().expect("hourly");
        hourly_names(90 * 60 * 1000).validate().expect("ninety minutes");

        let with_format = |cycle_length_ms: u64, format: &str| {
            ChronicleConfig {
                cycle_length_ms,
                cycle_format: format.to_string(),
                ..ChronicleConfig::default()
            }
            .normalized()
            .validate()
        };
        // Time of day alone repeats every day.
        assert!(with_format(1_000, "%H%M%S").is_err());
        assert!(with_format(DEFAULT_CYCLE_LENGTH_MS, "%m%d").is_err());
        // Twelve hour clocks need the am/pm marker.
        assert!(with_format(60 * 60 * 1000, "%Y%m%d%I").is_err());
        with_format(60 * 60 * 1000, "%Y%m%d%I%p").expect("twelve hour clock");
        with_format(1_000, "%s").expect("epoch seconds");
        with_format(DEFAULT_CYCLE_LENGTH_MS, "%Y-%j").expect("ordinal days");
        with_format(7 * DEFAULT_CYCLE_LENGTH_MS, "%G-W%V").expect("iso weeks");
        assert!(with_format(DEFAULT_CYCLE_LENGTH_MS, "%G-W%V").is_err());

        let tenths = ChronicleConfig {
            cycle_length_ms: 100,
            cycle_format: "%Y%m%d%H%M%S%.3f".to_string(),
            entries_per_cycle: 1 << 10,
            ..ChronicleConfig::default()
        }
        .normalized();
        tenths.validate().expect("millisecond names");
    }

    #[test]
    fn data_blocks_are_capped_at_u32_frames() {
        let cfg = ChronicleConfig {
            data_block_size: 1 << 34,
            ..ChronicleConfig::default()
        }
        .normalized();
        assert_eq!(cfg.data_block_size, DATA_BLOCK_MAX_BYTES);
        assert!(cfg.max_payload_len() <= u64::from(u32::MAX));
        cfg.validate().expect("largest extent validates");

        let raw = ChronicleConfig {
            data_block_size: 1 << 33,
            ..ChronicleConfig::default()
        };
        assert!(matches!(
            raw.validate(),
            Err(ChronicleError::InvalidConfig(_))
        ));
    }

    #[test]
    fn sink_read_timeout_defaults_to_twice_heartbeat() {
        let cfg = SinkConfig::with_connect_addr("localhost:1").normalized();
        assert_eq!(cfg.read_timeout_ms, 2 * DEFAULT_HEARTBEAT_INTERVAL_MS);

        let cfg = SinkConfig {
            expected_heartbeat_ms: 10_000,
            ..SinkConfig::with_connect_addr("localhost:1")
        }
        .normalized();
        assert_eq!(cfg.read_timeout_ms, 20_000);

        let cfg = SinkConfig {
            expected_heartbeat_ms: 10_000,
            read_timeout_ms: 3_000,
            ..SinkConfig::with_connect_addr("localhost:1")
        }
        .normalized();
        assert_eq!(cfg.read_timeout_ms, 3_000);
    }
}
