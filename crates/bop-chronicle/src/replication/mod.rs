//! TCP replication from one chronicle (the source) to others (the sinks).
//!
//! A sink connects, sends the record number it wants next and then commits
//! every frame the source streams back. Reconnecting resumes from the sink's
//! own last record, so a sink never sees a gap or a duplicate.

mod sink;
mod source;
pub mod wire;

use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;

pub use sink::ChronicleSink;
pub use source::ChronicleSource;

/// Callbacks for a source's socket lifecycle. All methods default to no-ops.
pub trait ConnectionListener: Send + Sync {
    /// Called once with the address actually bound (useful with port 0).
    fn on_bind(&self, _local: SocketAddr) {}

    fn on_connect(&self, _peer: SocketAddr) {}

    fn on_disconnect(&self, _peer: SocketAddr) {}
}

/// Exponential reconnect delay with a little jitter.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    initial_ms: u64,
    max_ms: u64,
    attempts: u32,
}

impl Backoff {
    pub(crate) fn new(initial_ms: u64, max_ms: u64) -> Self {
        let initial_ms = initial_ms.max(1);
        Self {
            initial_ms,
            max_ms: max_ms.max(initial_ms),
            attempts: 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.attempts = 0;
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let shift = self.attempts.min(20);
        self.attempts = self.attempts.saturating_add(1);
        let base = self
            .initial_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_ms);
        let jitter_window = (base / 4).max(1);
        let jitter = u64::from(Utc::now().timestamp_subsec_micros()) % jitter_window;
        Duration::from_millis(base.saturating_add(jitter).min(self.max_ms))
    }
}
