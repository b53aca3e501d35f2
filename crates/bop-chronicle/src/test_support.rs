//! Helpers for deterministic tests of chronicles and replication.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::clock::Clock;
use crate::config::ChronicleConfig;
use crate::replication::ConnectionListener;

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::Release);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now_ms.load(Ordering::Acquire)
    }
}

/// Configuration with one-second cycles and the smallest block sizes, rooted
/// at `<dir>/chronicle`.
pub fn small_config(dir: &Path) -> ChronicleConfig {
    ChronicleConfig {
        root_dir: dir.join("chronicle"),
        cycle_length_ms: 1_000,
        cycle_format: "%Y%m%d%H%M%S".to_string(),
        entries_per_cycle: 1 << 16,
        index_block_size: 4 * 1024,
        data_block_size: 64 * 1024,
        default_message_size: 1024,
        synchronous: false,
        cycle_probe_interval_ms: 0,
    }
}

/// A [`ConnectionListener`] that hands the bound address to the test thread.
#[derive(Debug, Default)]
pub struct PortSupplier {
    bound: Mutex<Option<SocketAddr>>,
    cond: Condvar,
    connects: AtomicU64,
    disconnects: AtomicU64,
}

impl PortSupplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits up to `timeout` for the source to bind.
    pub fn wait_for_addr(&self, timeout: Duration) -> Option<SocketAddr> {
        let deadline = Instant::now() + timeout;
        let mut bound = self.bound.lock();
        while bound.is_none() {
            if self.cond.wait_until(&mut bound, deadline).timed_out() {
                break;
            }
        }
        *bound
    }

    pub fn port(&self) -> Option<u16> {
        self.bound.lock().map(|addr| addr.port())
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Acquire)
    }

    pub fn disconnects(&self) -> u64 {
        self.disconnects.load(Ordering::Acquire)
    }
}

impl ConnectionListener for PortSupplier {
    fn on_bind(&self, local: SocketAddr) {
        *self.bound.lock() = Some(local);
        self.cond.notify_all();
    }

    fn on_connect(&self, _peer: SocketAddr) {
        self.connects.fetch_add(1, Ordering::AcqRel);
    }

    fn on_disconnect(&self, _peer: SocketAddr) {
        self.disconnects.fetch_add(1, Ordering::AcqRel);
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Installs a `tracing` subscriber writing to the test harness, once.
#[cfg(test)]
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
