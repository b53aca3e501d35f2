use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::appender::ExcerptAppender;
use crate::clock::{Clock, SystemClock};
use crate::config::{ChronicleConfig, CycleId, RecordNumber};
use crate::cycle::CycleManager;
use crate::error::{ChronicleError, ChronicleResult};
use crate::fs::Layout;
use crate::notify::CommitSignal;
use crate::tailer::ExcerptTailer;

/// State shared by a chronicle and every cursor created from it.
#[derive(Debug)]
pub(crate) struct ChronicleInner {
    pub(crate) config: ChronicleConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) cycles: CycleManager,
    pub(crate) commits: CommitSignal,
    appender_claimed: AtomicBool,
    closed: AtomicBool,
}

impl ChronicleInner {
    #[inline]
    pub(crate) fn ensure_open(&self) -> ChronicleResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(ChronicleError::Closed)
        } else {
            Ok(())
        }
    }

    #[inline]
    pub(crate) fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    #[inline]
    pub(crate) fn record_number(
        &self,
        cycle: CycleId,
        index: u64,
    ) -> ChronicleResult<RecordNumber> {
        self.config.record_number(cycle, index)
    }

    pub(crate) fn release_appender(&self) {
        self.appender_claimed.store(false, Ordering::Release);
    }

    pub(crate) fn last_record_number(&self) -> ChronicleResult<Option<RecordNumber>> {
        for cycle_id in self.cycles.list_cycles()?.into_iter().rev() {
            let Some(cycle) = self.cycles.open_existing(cycle_id)? else {
                continue;
            };
            let count = cycle.committed_count()?;
            if count > 0 {
                return self.record_number(cycle_id, count - 1).map(Some);
            }
        }
        Ok(None)
    }
}

/// A rolling, memory-mapped record log rooted at one directory.
///
/// Cloning is cheap; clones share mappings, the appender claim and the
/// commit signal.
#[derive(Debug, Clone)]
pub struct Chronicle {
    inner: Arc<ChronicleInner>,
}

impl Chronicle {
    /// Opens (or creates) the chronicle described by `config`.
    pub fn open(config: ChronicleConfig) -> ChronicleResult<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Opens the chronicle using `clock` to decide the active cycle.
    pub fn open_with_clock(config: ChronicleConfig, clock: Arc<dyn Clock>) -> ChronicleResult<Self> {
        let config = config.normalized();
        config.validate()?;
        let layout = Layout::new(&config.root_dir);
        layout.ensure_root()?;
        info!(config = %config, "opened chronicle");

        let cycles = CycleManager::new(config.clone(), layout);
        Ok(Self {
            inner: Arc::new(ChronicleInner {
                config,
                clock,
                cycles,
                commits: CommitSignal::new(),
                appender_claimed: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        })
    }

    #[inline]
    pub fn config(&self) -> &ChronicleConfig {
        &self.inner.config
    }

    #[inline]
    pub fn root(&self) -> &Path {
        self.inner.cycles.layout().root()
    }

    #[inline]
    pub(crate) fn inner(&self) -> &Arc<ChronicleInner> {
        &self.inner
    }

    /// Claims the single appender of this chronicle.
    pub fn create_appender(&self) -> ChronicleResult<ExcerptAppender> {
        self.inner.ensure_open()?;
        self.inner
            .appender_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ChronicleError::AppenderBusy)?;
        Ok(ExcerptAppender::new(Arc::clone(&self.inner)))
    }

    /// Creates a tailer positioned before the first record.
    pub fn create_tailer(&self) -> ChronicleResult<ExcerptTailer> {
        self.inner.ensure_open()?;
        let mut tailer = ExcerptTailer::new(Arc::clone(&self.inner));
        tailer.to_start()?;
        Ok(tailer)
    }

    /// Record number of the last committed record, if any.
    pub fn last_record_number(&self) -> ChronicleResult<Option<RecordNumber>> {
        self.inner.ensure_open()?;
        self.inner.last_record_number()
    }

    /// Total committed records across every cycle on disk.
    pub fn count(&self) -> ChronicleResult<u64> {
        self.inner.ensure_open()?;
        let mut total = 0;
        for cycle_id in self.inner.cycles.list_cycles()? {
            if let Some(cycle) = self.inner.cycles.open_existing(cycle_id)? {
                total += cycle.committed_count()?;
            }
        }
        Ok(total)
    }

    /// Cycle ids on disk, ascending.
    pub fn cycles(&self) -> ChronicleResult<Vec<CycleId>> {
        self.inner.ensure_open()?;
        self.inner.cycles.list_cycles()
    }

    pub fn flush(&self) -> ChronicleResult<()> {
        self.inner.ensure_open()?;
        self.inner.cycles.flush_all()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Flushes and releases every mapping. Later operations fail with
    /// [`ChronicleError::Closed`]. Idempotent.
    pub fn close(&self) -> ChronicleResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let flushed = self.inner.cycles.flush_all();
        self.inner.cycles.clear();
        self.inner.commits.notify();
        info!(root = %self.root().display(), "closed chronicle");
        flushed
    }

    /// Closes the chronicle and deletes its directory tree.
    pub fn clear(&self) -> ChronicleResult<()> {
        if let Err(err) = self.close() {
            debug!(error = %err, "flush failed while clearing chronicle");
        }
        self.inner.cycles.layout().remove_all()?;
        info!(root = %self.root().display(), "cleared chronicle");
        Ok(())
    }
}
