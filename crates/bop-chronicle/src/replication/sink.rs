use std::io::BufReader;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::wire::{self, Frame};
use super::Backoff;
use crate::appender::ExcerptAppender;
use crate::chronicle::Chronicle;
use crate::config::{RecordNumber, SinkConfig};
use crate::error::{ChronicleError, ChronicleResult};
use crate::metrics::{SinkMetrics, SinkMetricsSnapshot};
use crate::notify::ShutdownSignal;
use crate::tailer::ExcerptTailer;

struct SinkShared {
    config: SinkConfig,
    metrics: SinkMetrics,
    shutdown: ShutdownSignal,
    stream: Mutex<Option<TcpStream>>,
}

/// Mirrors a remote source into a local chronicle.
///
/// The sink owns the local chronicle's appender for as long as it runs, and
/// every reconnect resumes right after the last record stored locally.
pub struct ChronicleSink {
    chronicle: Chronicle,
    shared: Arc<SinkShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ChronicleSink {
    /// Claims the appender of `chronicle` and starts the replication worker.
    ///
    /// Returns once the worker thread runs; connecting happens in the
    /// background and is retried with capped exponential backoff. Fails with
    /// [`ChronicleError::AppenderBusy`] if the chronicle already has a writer.
    pub fn start(chronicle: Chronicle, config: SinkConfig) -> ChronicleResult<Self> {
        let config = config.normalized();
        if config.connect_addr.trim().is_empty() {
            return Err(ChronicleError::invalid_config("connect_addr must not be empty"));
        }
        let appender = chronicle.create_appender()?;
        let shared = Arc::new(SinkShared {
            config,
            metrics: SinkMetrics::default(),
            shutdown: ShutdownSignal::new(),
            stream: Mutex::new(None),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            let chronicle = chronicle.clone();
            thread::Builder::new()
                .name("chronicle-sink".into())
                .spawn(move || run(shared, chronicle, appender))?
        };
        info!(
            source = %shared.config.connect_addr,
            root = %chronicle.root().display(),
            "replication sink started"
        );

        Ok(Self {
            chronicle,
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// The local chronicle being written.
    #[inline]
    pub fn chronicle(&self) -> &Chronicle {
        &self.chronicle
    }

    pub fn create_tailer(&self) -> ChronicleResult<ExcerptTailer> {
        self.chronicle.create_tailer()
    }

    /// Last record stored locally, which is where the next reconnect resumes.
    pub fn last_record_number(&self) -> ChronicleResult<Option<RecordNumber>> {
        self.chronicle.last_record_number()
    }

    /// Point-in-time copy of the sink's counters.
    pub fn metrics(&self) -> SinkMetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Stops the worker, interrupting any blocked read, and releases the
    /// appender. The chronicle itself stays open.
    pub fn close(&self) {
        self.shared.shutdown.trigger();
        if let Some(stream) = self.shared.stream.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!(source = %self.shared.config.connect_addr, "sink worker panicked");
            }
            info!(source = %self.shared.config.connect_addr, "replication sink closed");
        }
    }
}

impl Drop for ChronicleSink {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ChronicleSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChronicleSink")
            .field("source", &self.shared.config.connect_addr)
            .field("metrics", &self.metrics())
            .finish()
    }
}

fn run(shared: Arc<SinkShared>, chronicle: Chronicle, mut appender: ExcerptAppender) {
    let mut backoff = Backoff::new(
        shared.config.reconnect_initial_ms,
        shared.config.reconnect_max_ms,
    );
    while !shared.shutdown.is_triggered() {
        let result = session(&shared, &chronicle, &mut appender, &mut backoff);
        if let Some(stream) = shared.stream.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if shared.shutdown.is_triggered() {
            break;
        }
        let err = match result {
            Ok(()) => continue,
            Err(ChronicleError::Closed) => {
                error!(source = %shared.config.connect_addr, "local chronicle closed; sink stopping");
                break;
            }
            Err(err) => err,
        };

        shared.metrics.incr_reconnect_attempt();
        let delay = backoff.next_delay();
        if err.is_timeout() {
            warn!(
                source = %shared.config.connect_addr,
                timeout_ms = shared.config.read_timeout_ms,
                "no frame or heartbeat within read timeout; reconnecting"
            );
        } else if backoff.attempts() == 1 || matches!(err, ChronicleError::Protocol(_)) {
            warn!(
                source = %shared.config.connect_addr,
                error = %err,
                retry_in_ms = delay.as_millis() as u64,
                "replication session failed"
            );
        } else {
            debug!(
                source = %shared.config.connect_addr,
                attempt = backoff.attempts(),
                error = %err,
                retry_in_ms = delay.as_millis() as u64,
                "reconnecting to source"
            );
        }
        if shared.shutdown.sleep(delay) {
            break;
        }
    }
    appender.close();
    debug!(source = %shared.config.connect_addr, "sink worker stopped");
}

fn resolve(addr: &str) -> ChronicleResult<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| ChronicleError::invalid_config(format!("{addr} did not resolve")))
}

/// One connection: handshake, then commit frames until the stream breaks.
fn session(
    shared: &SinkShared,
    chronicle: &Chronicle,
    appender: &mut ExcerptAppender,
    backoff: &mut Backoff,
) -> ChronicleResult<()> {
    let addr = resolve(&shared.config.connect_addr)?;
    let stream = TcpStream::connect_timeout(&addr, shared.config.connect_timeout())?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(shared.config.read_timeout()))?;
    *shared.stream.lock() = Some(stream.try_clone()?);
    if shared.shutdown.is_triggered() {
        return Ok(());
    }

    let resume = chronicle
        .last_record_number()?
        .map_or(0, |last| last.next().as_u64());
    wire::write_handshake(&mut &stream, resume)?;
    backoff.reset();
    shared.metrics.incr_connect();
    info!(source = %addr, resume, "sink connected");

    let max_len = chronicle.config().max_payload_len();
    let mut reader = BufReader::new(&stream);
    while !shared.shutdown.is_triggered() {
        match wire::read_frame(&mut reader, max_len)? {
            Frame::Heartbeat => shared.metrics.incr_heartbeat_received(),
            Frame::Record { record, payload } => {
                appender.append_replicated(record, &payload)?;
                shared.metrics.record_received(record.as_u64());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::small_config;
    use std::net::TcpListener;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    #[test]
    fn sink_holds_the_appender() {
        let tmp = TempDir::new().expect("tempdir");
        let chronicle = Chronicle::open(small_config(tmp.path())).expect("open");
        let sink = ChronicleSink::start(
            chronicle.clone(),
            SinkConfig::with_connect_addr("127.0.0.1:1"),
        )
        .expect("start");
        assert!(matches!(
            chronicle.create_appender(),
            Err(ChronicleError::AppenderBusy)
        ));
        sink.close();
        chronicle.create_appender().expect("released");
    }

    #[test]
    fn unreachable_source_is_retried() {
        let tmp = TempDir::new().expect("tempdir");
        let chronicle = Chronicle::open(small_config(tmp.path())).expect("open");
        // Reserve a port, then free it so connections are refused.
        let port = TcpListener::bind("127.0.0.1:0")
            .expect("bind")
            .local_addr()
            .expect("addr")
            .port();
        let mut config = SinkConfig::with_connect_addr(format!("127.0.0.1:{port}"));
        config.reconnect_initial_ms = 1;
        config.reconnect_max_ms = 5;
        let sink = ChronicleSink::start(chronicle, config).expect("start");

        let deadline = Instant::now() + Duration::from_secs(10);
        while sink.metrics().reconnect_attempts < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(sink.metrics().reconnect_attempts >= 3);
        assert_eq!(sink.metrics().connects, 0);
        sink.close();
    }

    #[test]
    fn empty_sink_requests_from_start() {
        let tmp = TempDir::new().expect("tempdir");
        let chronicle = Chronicle::open(small_config(tmp.path())).expect("open");
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let sink = ChronicleSink::start(chronicle, SinkConfig::with_connect_addr(addr.to_string()))
            .expect("start");

        let (mut stream, _) = listener.accept().expect("accept");
        assert_eq!(wire::read_handshake(&mut stream).expect("handshake"), 0);
        sink.close();
    }
}
