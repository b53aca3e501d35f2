use std::collections::HashMap;
use std::io::{self, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::wire;
use super::ConnectionListener;
use crate::appender::ExcerptAppender;
use crate::chronicle::Chronicle;
use crate::config::{RecordNumber, SourceConfig};
use crate::error::{ChronicleError, ChronicleResult};
use crate::metrics::{SourceMetrics, SourceMetricsSnapshot};
use crate::tailer::ExcerptTailer;

/// Records written between flushes of a connection's socket buffer.
const SEND_BATCH: usize = 256;

/// Longest sleep of the acceptor between polls of a non-blocking accept.
const ACCEPT_POLL: Duration = Duration::from_millis(10);

struct SourceShared {
    chronicle: Chronicle,
    config: SourceConfig,
    listener: Option<Arc<dyn ConnectionListener>>,
    metrics: SourceMetrics,
    shutdown: AtomicBool,
    next_connection: AtomicU64,
    streams: Mutex<HashMap<u64, TcpStream>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SourceShared {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Serves a chronicle's records to any number of sinks over TCP.
///
/// One acceptor thread plus one thread per connected sink. Each connection
/// reads with its own tailer, so a slow sink only ever slows itself down.
pub struct ChronicleSource {
    shared: Arc<SourceShared>,
    local_addr: SocketAddr,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl ChronicleSource {
    /// Binds `config.bind_addr` and starts accepting sinks.
    pub fn bind(
        chronicle: Chronicle,
        config: SourceConfig,
        listener: Option<Arc<dyn ConnectionListener>>,
    ) -> ChronicleResult<Self> {
        let config = config.normalized();
        let tcp = TcpListener::bind(config.bind_addr)?;
        tcp.set_nonblocking(true)?;
        let local_addr = tcp.local_addr()?;
        if let Some(listener) = listener.as_ref() {
            listener.on_bind(local_addr);
        }
        info!(addr = %local_addr, root = %chronicle.root().display(), "replication source bound");

        let shared = Arc::new(SourceShared {
            chronicle,
            config,
            listener,
            metrics: SourceMetrics::default(),
            shutdown: AtomicBool::new(false),
            next_connection: AtomicU64::new(0),
            streams: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
        });
        let acceptor = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("chronicle-source-acceptor".into())
                .spawn(move || accept_loop(shared, tcp))?
        };

        Ok(Self {
            shared,
            local_addr,
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    /// Address actually bound, with the ephemeral port resolved.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline]
    pub fn chronicle(&self) -> &Chronicle {
        &self.shared.chronicle
    }

    /// Shorthand for [`Chronicle::create_appender`] on the served chronicle.
    pub fn create_appender(&self) -> ChronicleResult<ExcerptAppender> {
        self.shared.chronicle.create_appender()
    }

    pub fn create_tailer(&self) -> ChronicleResult<ExcerptTailer> {
        self.shared.chronicle.create_tailer()
    }

    /// Point-in-time copy of the source's counters.
    pub fn metrics(&self) -> SourceMetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Stops accepting, disconnects every sink and joins all threads.
    /// The chronicle itself stays open.
    pub fn close(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        for stream in self.shared.streams.lock().values() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.shared.chronicle.inner().commits.notify();

        if let Some(acceptor) = self.acceptor.lock().take() {
            if acceptor.join().is_err() {
                error!(addr = %self.local_addr, "source acceptor panicked");
            }
        }
        let workers: Vec<JoinHandle<()>> = self.shared.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                error!(addr = %self.local_addr, "source connection thread panicked");
            }
        }
        info!(addr = %self.local_addr, "replication source closed");
    }
}

impl Drop for ChronicleSource {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ChronicleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChronicleSource")
            .field("local_addr", &self.local_addr)
            .field("metrics", &self.metrics())
            .finish()
    }
}

fn accept_loop(shared: Arc<SourceShared>, tcp: TcpListener) {
    let idle = shared.config.poll_interval().min(ACCEPT_POLL);
    while !shared.is_shutdown() {
        match tcp.accept() {
            Ok((stream, peer)) => {
                let id = shared.next_connection.fetch_add(1, Ordering::Relaxed);
                let worker = {
                    let shared = Arc::clone(&shared);
                    thread::Builder::new()
                        .name(format!("chronicle-source-{id}"))
                        .spawn(move || run_connection(shared, id, stream, peer))
                };
                let mut workers = shared.workers.lock();
                workers.retain(|worker| !worker.is_finished());
                match worker {
                    Ok(worker) => workers.push(worker),
                    Err(err) => error!(peer = %peer, error = %err, "failed to spawn connection thread"),
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::sleep(idle),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                warn!(error = %err, "accept failed");
                thread::sleep(idle);
            }
        }
    }
    debug!("source acceptor stopped");
}

fn run_connection(shared: Arc<SourceShared>, id: u64, stream: TcpStream, peer: SocketAddr) {
    shared.metrics.incr_connection_accepted();
    if let Some(listener) = shared.listener.as_ref() {
        listener.on_connect(peer);
    }
    info!(peer = %peer, "sink connected");

    let registered = stream
        .try_clone()
        .map(|clone| shared.streams.lock().insert(id, clone));
    let result = match registered {
        Ok(_) if shared.is_shutdown() => Ok(()),
        Ok(_) => serve(&shared, &stream, peer),
        Err(err) => Err(err.into()),
    };
    match result {
        Ok(()) => debug!(peer = %peer, "sink connection closed"),
        Err(err @ ChronicleError::Protocol(_)) => {
            shared.metrics.incr_protocol_violation();
            warn!(peer = %peer, error = %err, "closing sink after protocol violation");
        }
        Err(err) => debug!(peer = %peer, error = %err, "sink connection dropped"),
    }

    shared.streams.lock().remove(&id);
    let _ = stream.shutdown(Shutdown::Both);
    shared.metrics.decr_connection_active();
    if let Some(listener) = shared.listener.as_ref() {
        listener.on_disconnect(peer);
    }
}

fn serve(shared: &SourceShared, stream: &TcpStream, peer: SocketAddr) -> ChronicleResult<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(shared.config.handshake_timeout()))?;
    let resume = wire::read_handshake(&mut &*stream)?;
    stream.set_read_timeout(None)?;

    let mut tailer = shared.chronicle.create_tailer()?;
    let mut pending = position_for_resume(&shared.chronicle, &mut tailer, resume)?;
    debug!(peer = %peer, resume, "sink resume point accepted");

    let commits = &shared.chronicle.inner().commits;
    let heartbeat = shared.config.heartbeat_interval();
    let poll = shared.config.poll_interval();
    let mut writer = BufWriter::new(stream);
    let mut last_send = Instant::now();

    while !shared.is_shutdown() {
        let observed = commits.sequence();
        let mut sent = 0usize;
        while sent < SEND_BATCH {
            let loaded = if pending {
                pending = false;
                true
            } else {
                tailer.next_index()?
            };
            if !loaded {
                break;
            }
            let record = tailer
                .record_number()
                .ok_or_else(|| ChronicleError::invalid_state("tailer lost its record"))?;
            wire::write_record(&mut writer, record, tailer.checksum()?, tailer.bytes())?;
            tailer.finish();
            sent += 1;
        }

        if sent > 0 {
            writer.flush()?;
            shared.metrics.add_records_sent(sent as u64);
            last_send = Instant::now();
            continue;
        }

        let idle = last_send.elapsed();
        if idle >= heartbeat {
            wire::write_heartbeat(&mut writer)?;
            shared.metrics.incr_heartbeat_sent();
            last_send = Instant::now();
            continue;
        }
        commits.wait_after(observed, poll.min(heartbeat - idle));
    }
    Ok(())
}

/// Positions `tailer` for a sink asking to resume at `resume`.
///
/// Returns `true` when the requested record is already loaded.
fn position_for_resume(
    chronicle: &Chronicle,
    tailer: &mut ExcerptTailer,
    resume: u64,
) -> ChronicleResult<bool> {
    if resume == 0 {
        tailer.to_start()?;
        return Ok(false);
    }

    let record = RecordNumber::new(resume);
    let (cycle, index) = chronicle.config().split(record);
    let cycles = chronicle.cycles()?;
    if let Some(first) = cycles.first() {
        if cycle < *first {
            return Err(ChronicleError::protocol(format!(
                "record {record} is no longer available; earliest cycle is {first}"
            )));
        }
    }

    match chronicle.inner().cycles.open_existing(cycle)? {
        Some(existing) => {
            let committed = existing.committed_count()?;
            if index > committed {
                return Err(ChronicleError::protocol(format!(
                    "record {record} is ahead of source: cycle {cycle} holds {committed} records"
                )));
            }
        }
        None if index > 0 => {
            return Err(ChronicleError::protocol(format!(
                "record {record} names index {index} of missing cycle {cycle}"
            )));
        }
        None => {}
    }
    tailer.index(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CycleId;
    use crate::test_support::{small_config, ManualClock};
    use tempfile::TempDir;

    fn chronicle_with_records(tmp: &TempDir, per_cycle: &[(u64, u64)]) -> Chronicle {
        let clock = Arc::new(ManualClock::new(0));
        let chronicle =
            Chronicle::open_with_clock(small_config(tmp.path()), clock.clone()).expect("open");
        let mut appender = chronicle.create_appender().expect("appender");
        for (cycle, count) in per_cycle {
            clock.set(cycle * 1_000);
            for i in 0..*count {
                appender.start_excerpt().expect("start");
                appender.write_u64(i).expect("write");
                appender.finish().expect("finish");
            }
        }
        chronicle
    }

    #[test]
    fn resume_validation_rules() {
        let tmp = TempDir::new().expect("tempdir");
        let chronicle = chronicle_with_records(&tmp, &[(10, 3), (12, 2)]);
        let config = chronicle.config().clone();
        let rn = |cycle: u64, index: u64| {
            config
                .record_number(CycleId::new(cycle), index)
                .expect("record")
        };
        let mut tailer = chronicle.create_tailer().expect("tailer");

        let before_start = rn(9, 0);
        assert!(matches!(
            position_for_resume(&chronicle, &mut tailer, before_start.as_u64()),
            Err(ChronicleError::Protocol(_))
        ));

        let ahead = rn(10, 4);
        assert!(matches!(
            position_for_resume(&chronicle, &mut tailer, ahead.as_u64()),
            Err(ChronicleError::Protocol(_))
        ));

        let missing = rn(11, 1);
        assert!(matches!(
            position_for_resume(&chronicle, &mut tailer, missing.as_u64()),
            Err(ChronicleError::Protocol(_))
        ));

        let loaded = rn(10, 1);
        assert!(position_for_resume(&chronicle, &mut tailer, loaded.as_u64()).expect("resume"));
        assert_eq!(tailer.record_number(), Some(loaded));

        let end_of_cycle = rn(10, 3);
        assert!(!position_for_resume(&chronicle, &mut tailer, end_of_cycle.as_u64())
            .expect("resume"));
        assert!(tailer.next_index().expect("next"));
        assert_eq!(
            tailer.record_number(),
            Some(rn(12, 0))
        );

        let gap_cycle = rn(11, 0);
        assert!(!position_for_resume(&chronicle, &mut tailer, gap_cycle.as_u64())
            .expect("resume"));
        assert!(tailer.next_index().expect("next"));
        assert_eq!(
            tailer.record_number(),
            Some(rn(12, 0))
        );
    }

    #[test]
    fn bad_handshake_counts_as_violation() {
        crate::test_support::init_tracing();
        let tmp = TempDir::new().expect("tempdir");
        let chronicle = chronicle_with_records(&tmp, &[(5, 1)]);
        let source =
            ChronicleSource::bind(chronicle.clone(), SourceConfig::default(), None).expect("bind");

        let ahead = chronicle
            .config()
            .record_number(CycleId::new(5), 9)
            .expect("record");
        let mut stream = TcpStream::connect(source.local_addr()).expect("connect");
        wire::write_handshake(&mut stream, ahead.as_u64()).expect("handshake");

        let deadline = Instant::now() + Duration::from_secs(10);
        while source.metrics().protocol_violations == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(source.metrics().protocol_violations, 1);
        source.close();
        assert_eq!(source.metrics().connections_active, 0);
    }
}
