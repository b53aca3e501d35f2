use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time snapshot of a replication source.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SourceMetricsSnapshot {
    /// Sinks accepted since bind
    pub connections_accepted: u64,
    /// Sinks currently streaming
    pub connections_active: u64,
    /// Record frames written to sinks
    pub records_sent: u64,
    /// Heartbeat frames written to sinks
    pub heartbeats_sent: u64,
    /// Connections closed for a bad resume point or handshake
    pub protocol_violations: u64,
}

/// Counters updated by the source acceptor and its connection threads.
#[derive(Debug, Default)]
pub struct SourceMetrics {
    connections_accepted: AtomicU64,
    connections_active: AtomicU64,
    records_sent: AtomicU64,
    heartbeats_sent: AtomicU64,
    protocol_violations: AtomicU64,
}

impl SourceMetrics {
    /// Counts an accepted sink, which is also active until
    /// [`SourceMetrics::decr_connection_active`].
    pub fn incr_connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero.
    pub fn decr_connection_active(&self) {
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn add_records_sent(&self, count: u64) {
        self.records_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn incr_heartbeat_sent(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_protocol_violation(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SourceMetricsSnapshot {
        SourceMetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            records_sent: self.records_sent.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of a replication sink.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SinkMetricsSnapshot {
    /// Successful handshakes with a source
    pub connects: u64,
    /// Failed connections or broken streams followed by a retry
    pub reconnect_attempts: u64,
    /// Records committed locally
    pub records_received: u64,
    /// Heartbeats observed
    pub heartbeats_received: u64,
    /// Raw value of the last committed record number, zero if none
    pub last_record_number: u64,
}

/// Counters updated by the sink worker thread.
#[derive(Debug, Default)]
pub struct SinkMetrics {
    connects: AtomicU64,
    reconnect_attempts: AtomicU64,
    records_received: AtomicU64,
    heartbeats_received: AtomicU64,
    last_record_number: AtomicU64,
}

impl SinkMetrics {
    pub fn incr_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one committed record and remembers its number.
    pub fn record_received(&self, record_number: u64) {
        self.records_received.fetch_add(1, Ordering::Relaxed);
        self.last_record_number
            .store(record_number, Ordering::Relaxed);
    }

    pub fn incr_heartbeat_received(&self) {
        self.heartbeats_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SinkMetricsSnapshot {
        SinkMetricsSnapshot {
            connects: self.connects.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            records_received: self.records_received.load(Ordering::Relaxed),
            heartbeats_received: self.heartbeats_received.load(Ordering::Relaxed),
            last_record_number: self.last_record_number.load(Ordering::Relaxed),
        }
    }
}
