//! A memory-mapped, append-only record log split into rolling time cycles,
//! with TCP replication between chronicles.
//!
//! Records are appended by a single [`ExcerptAppender`] and read by any number
//! of independent [`ExcerptTailer`]s. Each record gets a [`RecordNumber`]
//! packing its [`CycleId`] and its index within that cycle, so record numbers
//! grow monotonically across cycles.
//!
//! ```text
//! <root>/20240101/data     64-byte header, then [len][crc][payload] frames
//! <root>/20240101/index    one u64 offset per record
//! <root>/20240102/...
//! ```
//!
//! A [`ChronicleSource`] streams a chronicle to [`ChronicleSink`]s, and a sink
//! that reconnects resumes after the last record it already stores.

pub mod appender;
pub mod chronicle;
pub mod clock;
pub mod config;
pub mod cycle;
pub mod error;
pub mod fs;
pub mod metrics;
pub mod notify;
pub mod replication;
pub mod store;
pub mod tailer;
pub mod test_support;

pub use appender::ExcerptAppender;
pub use chronicle::Chronicle;
pub use clock::{Clock, SystemClock};
pub use config::{ChronicleConfig, CycleId, RecordNumber, SinkConfig, SourceConfig};
pub use cycle::{cycle_name_resolution_ms, format_cycle_name};
pub use error::{ChronicleError, ChronicleResult};
pub use metrics::{SinkMetrics, SinkMetricsSnapshot, SourceMetrics, SourceMetricsSnapshot};
pub use replication::{ChronicleSink, ChronicleSource, ConnectionListener};
pub use tailer::ExcerptTailer;
