use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Wakes threads waiting for new commits.
///
/// The appender bumps a sequence counter on every commit. Waiters remember
/// the sequence they last observed and sleep until it moves or their timeout
/// expires. Commits with nobody waiting skip the mutex entirely.
#[derive(Debug, Default)]
pub struct CommitSignal {
    seq: Mutex<u64>,
    cond: Condvar,
    waiters: AtomicUsize,
}

impl CommitSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current sequence; pass it to [`CommitSignal::wait_after`].
    pub fn sequence(&self) -> u64 {
        *self.seq.lock()
    }

    pub fn notify(&self) {
        if self.waiters.load(Ordering::Acquire) == 0 {
            return;
        }
        let mut seq = self.seq.lock();
        *seq = seq.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Blocks until the sequence differs from `observed` or `timeout` passes.
    /// Returns `true` when woken by a commit.
    pub fn wait_after(&self, observed: u64, timeout: Duration) -> bool {
        let mut seq = self.seq.lock();
        if *seq != observed {
            return true;
        }
        self.waiters.fetch_add(1, Ordering::AcqRel);
        let result = self.cond.wait_for(&mut seq, timeout);
        self.waiters.fetch_sub(1, Ordering::AcqRel);
        !result.timed_out() || *seq != observed
    }
}

/// Interruptible sleep for worker threads that must stop promptly on close.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        *self.stopped.lock() = true;
        self.cond.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleeps for `timeout` unless triggered first. Returns `true` if triggered.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            let _ = self.cond.wait_for(&mut stopped, timeout);
        }
        *stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn wait_times_out_without_commits() {
        let signal = CommitSignal::new();
        let seq = signal.sequence();
        assert!(!signal.wait_after(seq, Duration::from_millis(20)));
    }

    #[test]
    fn notify_wakes_waiter() {
        let signal = Arc::new(CommitSignal::new());
        let seq = signal.sequence();
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait_after(seq, Duration::from_secs(10)))
        };
        let deadline = Instant::now() + Duration::from_secs(10);
        while signal.waiters.load(Ordering::Acquire) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        signal.notify();
        assert!(waiter.join().expect("join"));
    }

    #[test]
    fn shutdown_interrupts_sleep() {
        let signal = Arc::new(ShutdownSignal::new());
        let sleeper = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || {
                let started = Instant::now();
                let triggered = signal.sleep(Duration::from_secs(30));
                (triggered, started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        signal.trigger();
        let (triggered, elapsed) = sleeper.join().expect("join");
        assert!(triggered);
        assert!(elapsed < Duration::from_secs(10));
        assert!(signal.sleep(Duration::from_secs(30)));
    }
}
