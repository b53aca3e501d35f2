//! Counters for the replication endpoints.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │            Replication Metrics               │
//! ├──────────────────────────────────────────────┤
//! │ ┌──────────────────┐  ┌────────────────────┐ │
//! │ │  SourceMetrics   │  │   SinkMetrics      │ │
//! │ │  (per source)    │  │   (per sink)       │ │
//! │ └──────────────────┘  └────────────────────┘ │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Counters are relaxed atomics updated from the worker threads. Call
//! `snapshot()` for a point-in-time copy.

pub mod replication;

pub use replication::{SinkMetrics, SinkMetricsSnapshot, SourceMetrics, SourceMetricsSnapshot};
