//! Download stage: bounded-concurrency transfer of scanned items.
//!
//! # Concurrency model
//!
//! - A producer moves items from the stage's own pending queue and from the
//!   scan stage's output into a ready queue bounded at `N`
//! - `N` consumers pop the ready queue and run one [`Transfer`] each
//! - A reporter logs progress; a checkpoint writer persists outstanding ids
//!
//! The ready queue bound plus the consumer count cap concurrent transfers at
//! `N`. Cancellation stops the producer and consumers; items interrupted
//! mid-transfer stay in the active set so [`DownloadStage::on_interrupt`]
//! can clean their files up.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use indicatif::{HumanBytes, HumanDuration};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::constants::{
    CHECKPOINT_INTERVAL, FORCED_REPORT_INTERVAL, IDLE_POLL_INTERVAL, REPORT_INTERVAL,
};
use super::transfer::{Transfer, TransferContext};
use crate::checkpoint::Checkpoint;
use crate::index::FileIndex;
use crate::item::{ItemFlags, ItemState, Outcome, TransferTracker, WorkItem};
use crate::queue::WorkQueue;
use crate::scan::ScanShared;
use crate::stats::RunStats;

/// Minimum allowed concurrency value.
pub const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
pub const MAX_CONCURRENCY: usize = 32;

/// Default concurrency if not specified.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Error type for download stage construction.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Invalid concurrency value provided.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
    },
}

/// Download stage settings.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Concurrent transfers.
    pub concurrency: usize,
    /// Root directory for media files.
    pub output_dir: PathBuf,
    /// Keep partial files created this run when interrupted.
    pub keep_unfinished: bool,
    /// Checkpoint file, if checkpointing is enabled.
    pub checkpoint: Option<PathBuf>,
    /// Option tokens replayed after the id set in checkpoints.
    pub checkpoint_args: Vec<String>,
    /// Checkpoint rewrite cadence.
    pub checkpoint_interval: Duration,
    /// Progress cadence while busy.
    pub report_interval: Duration,
    /// Progress poll cadence while idle.
    pub idle_poll_interval: Duration,
    /// Upper bound between progress lines.
    pub forced_report_interval: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            output_dir: PathBuf::from("."),
            keep_unfinished: false,
            checkpoint: None,
            checkpoint_args: Vec::new(),
            checkpoint_interval: CHECKPOINT_INTERVAL,
            report_interval: REPORT_INTERVAL,
            idle_poll_interval: IDLE_POLL_INTERVAL,
            forced_report_interval: FORCED_REPORT_INTERVAL,
        }
    }
}

#[derive(Debug)]
struct ActiveEntry {
    id: u64,
    tracker: Arc<TransferTracker>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    config: DownloadConfig,
    transfer: Arc<dyn Transfer>,
    ctx: TransferContext,
    stats: Arc<RunStats>,
    pending: WorkQueue<WorkItem>,
    ready: WorkQueue<WorkItem>,
    active: Mutex<Vec<ActiveEntry>>,
    handoff: Mutex<Option<u64>>,
    done: Mutex<Vec<WorkItem>>,
    interrupted: Mutex<Vec<u64>>,
    scan: Option<Arc<ScanShared>>,
    feedback: Option<mpsc::UnboundedSender<(u64, Outcome)>>,
    entered: AtomicUsize,
    prefiltered: usize,
    interrupt_handled: AtomicBool,
}

/// Bounded-concurrency consumer of scanned items.
pub struct DownloadStage {
    inner: Arc<Inner>,
}

impl DownloadStage {
    /// Creates a stage over `items` (already scanned or preloaded).
    ///
    /// `prefiltered` counts items removed before reaching this stage; it is
    /// only used in the summary denominator.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::InvalidConcurrency`] if the concurrency is
    /// outside 1..=32.
    #[instrument(level = "debug", skip(items, transfer, stats, index, cancel, config), fields(concurrency = config.concurrency))]
    pub fn new(
        items: Vec<WorkItem>,
        transfer: Arc<dyn Transfer>,
        prefiltered: usize,
        config: DownloadConfig,
        stats: Arc<RunStats>,
        index: Arc<FileIndex>,
        cancel: CancellationToken,
    ) -> Result<Self, StageError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&config.concurrency) {
            return Err(StageError::InvalidConcurrency {
                value: config.concurrency,
            });
        }
        debug!(
            preloaded = items.len(),
            prefiltered,
            checkpoint = config.checkpoint.is_some(),
            "creating download stage"
        );
        let ctx = TransferContext::new(config.output_dir.clone(), index, cancel);
        Ok(Self {
            inner: Arc::new(Inner {
                ready: WorkQueue::bounded(config.concurrency),
                pending: WorkQueue::from_items(items),
                config,
                transfer,
                ctx,
                stats,
                active: Mutex::new(Vec::new()),
                handoff: Mutex::new(None),
                done: Mutex::new(Vec::new()),
                interrupted: Mutex::new(Vec::new()),
                scan: None,
                feedback: None,
                entered: AtomicUsize::new(0),
                prefiltered,
                interrupt_handled: AtomicBool::new(false),
            }),
        })
    }

    /// Pulls additional items from a scan stage and reports results back.
    ///
    /// Must be called before [`run`](Self::run).
    #[must_use]
    pub fn with_scan(
        mut self,
        scan: Arc<ScanShared>,
        feedback: mpsc::UnboundedSender<(u64, Outcome)>,
    ) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.scan = Some(scan);
            inner.feedback = Some(feedback);
        } else {
            warn!("download stage already running, scan input ignored");
        }
        self
    }

    /// Configured concurrency.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.inner.config.concurrency
    }

    /// Ids not yet finished: pending, ready, in flight, interrupted, and
    /// (when wired to a scan stage) unscanned or awaiting pickup.
    #[must_use]
    pub fn outstanding_ids(&self) -> Vec<u64> {
        self.inner.outstanding_ids()
    }

    /// Number of outstanding items.
    #[must_use]
    pub fn workload_size(&self) -> usize {
        self.inner.outstanding_ids().len()
    }

    /// Items that entered the stage.
    #[must_use]
    pub fn total(&self) -> usize {
        self.inner.entered.load(Ordering::SeqCst)
    }

    /// Takes the successfully transferred items.
    #[must_use]
    pub fn take_done(&self) -> Vec<WorkItem> {
        std::mem::take(&mut *lock(&self.inner.done))
    }

    /// Runs the stage to completion or cancellation.
    ///
    /// Returns after every task has ended and the summary is logged. A
    /// cancelled run triggers [`on_interrupt`](Self::on_interrupt) before
    /// returning.
    #[instrument(skip(self), fields(concurrency = self.inner.config.concurrency))]
    pub async fn run(&self) {
        let inner = &self.inner;
        info!(
            pending = inner.pending.len(),
            scan = inner.scan.is_some(),
            "download stage started"
        );
        let finished = CancellationToken::new();

        let producer = tokio::spawn(produce(Arc::clone(inner)));
        let consumers: Vec<_> = (0..inner.config.concurrency)
            .map(|worker| tokio::spawn(consume(Arc::clone(inner), worker)))
            .collect();
        let reporter = tokio::spawn(report(Arc::clone(inner), finished.clone()));
        let checkpointer = inner
            .config
            .checkpoint
            .clone()
            .map(|path| tokio::spawn(checkpoint_loop(Arc::clone(inner), path, finished.clone())));

        if let Err(e) = producer.await {
            warn!(error = %e, "producer task panicked");
        }
        for handle in consumers {
            if let Err(e) = handle.await {
                warn!(error = %e, "consumer task panicked");
            }
        }
        if !inner.ctx.cancel.is_cancelled() {
            inner.ready.wait_empty().await;
        }
        finished.cancel();
        for handle in std::iter::once(reporter).chain(checkpointer) {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task panicked");
            }
        }

        if inner.ctx.cancel.is_cancelled() {
            self.on_interrupt();
        }
        inner.finalize_checkpoint().await;
        inner.log_summary();
    }

    /// Cleans up after an external interruption. Runs at most once.
    ///
    /// Every in-flight item whose file exists and was created by this run is
    /// deleted, or kept when `keep_unfinished` is set.
    pub fn on_interrupt(&self) {
        let inner = &self.inner;
        if inner.interrupt_handled.swap(true, Ordering::SeqCst) {
            return;
        }
        let active = lock(&inner.active);
        info!(active = active.len(), "handling interruption");
        for entry in active.iter() {
            let Some(path) = entry.tracker.destination() else {
                continue;
            };
            if !entry.tracker.has(ItemFlags::CREATED_THIS_RUN) || !path.exists() {
                continue;
            }
            if inner.config.keep_unfinished {
                info!(item_id = entry.id, path = %path.display(), "keeping unfinished file");
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    inner.ctx.index.remove(&path);
                    info!(item_id = entry.id, path = %path.display(), "removed unfinished file");
                }
                Err(e) => {
                    warn!(item_id = entry.id, path = %path.display(), error = %e, "cannot remove unfinished file");
                }
            }
        }
    }
}

impl Inner {
    fn outstanding_ids(&self) -> Vec<u64> {
        let mut ids = self.pending.snapshot(WorkItem::id);
        ids.extend(self.ready.snapshot(WorkItem::id));
        ids.extend(lock(&self.active).iter().map(|e| e.id));
        ids.extend(*lock(&self.handoff));
        ids.extend(lock(&self.interrupted).iter().copied());
        if let Some(scan) = &self.scan {
            ids.extend(scan.unscanned_ids());
            ids.extend(scan.output_ids());
        }
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    async fn enqueue(&self, mut item: WorkItem) -> bool {
        let id = item.id();
        if let Err(e) = item.advance(ItemState::DownloadPending) {
            warn!(error = %e, "unexpected item state entering download stage");
        }
        self.entered.fetch_add(1, Ordering::SeqCst);
        *lock(&self.handoff) = Some(id);
        let pushed = tokio::select! {
            biased;
            () = self.ctx.cancel.cancelled() => {
                lock(&self.interrupted).push(id);
                false
            }
            pushed = self.ready.push(item) => pushed.is_ok(),
        };
        *lock(&self.handoff) = None;
        pushed
    }

    async fn process(&self, mut item: WorkItem) {
        let id = item.id();
        if let Err(e) = item.advance(ItemState::Downloading) {
            warn!(error = %e, "unexpected item state at transfer start");
        }
        lock(&self.active).push(ActiveEntry {
            id,
            tracker: Arc::clone(item.tracker()),
        });

        let outcome = self.transfer.transfer(&mut item, &self.ctx).await;

        if self.ctx.cancel.is_cancelled() && outcome != Outcome::Success {
            // stays in the active set for on_interrupt and the checkpoint
            debug!(item_id = id, "transfer interrupted");
            item.fail();
            return;
        }
        lock(&self.active).retain(|e| e.id != id);

        match outcome {
            Outcome::Success
            | Outcome::AlreadyExists
            | Outcome::Skipped
            | Outcome::SkippedByFilter => {
                if let Err(e) = item.advance(ItemState::Done) {
                    warn!(error = %e, outcome = %outcome, "unexpected state at transfer end");
                }
            }
            _ => {
                if outcome == Outcome::NotFound {
                    item.add_flags(ItemFlags::RETURNED_NOT_FOUND);
                }
                item.fail();
            }
        }
        self.stats.record(&item, outcome);
        if let Some(tx) = &self.feedback {
            let _ = tx.send((id, outcome));
        }
        if outcome == Outcome::Success {
            lock(&self.done).push(item);
        }
    }

    async fn finalize_checkpoint(&self) {
        let Some(path) = self.config.checkpoint.as_deref() else {
            return;
        };
        let mut ids = self.outstanding_ids();
        ids.extend(self.stats.failed_ids());
        if ids.is_empty() && !self.ctx.cancel.is_cancelled() {
            if let Err(e) = Checkpoint::remove(path).await {
                warn!(error = %e, "cannot remove checkpoint");
            } else {
                debug!(path = %path.display(), "checkpoint removed after complete run");
            }
            return;
        }
        if ids.is_empty() {
            return;
        }
        let checkpoint = Checkpoint::new(ids, self.config.checkpoint_args.clone());
        match checkpoint.write(path).await {
            Ok(()) => info!(
                path = %path.display(),
                remaining = checkpoint.ids().len(),
                "checkpoint written, resume with --resume"
            ),
            Err(e) => error!(error = %e, "cannot write final checkpoint"),
        }
    }

    fn log_summary(&self) {
        let stats = &self.stats;
        let total = self.entered.load(Ordering::SeqCst) + self.prefiltered;
        info!(
            downloaded = stats.downloaded(),
            total,
            existed = stats.already_existed(),
            skipped = stats.skipped(),
            not_found = stats.not_found(),
            "downloaded {} / {total}",
            stats.downloaded()
        );
        let remaining = self.outstanding_ids();
        if !remaining.is_empty() {
            error!(
                remaining = remaining.len(),
                ids = ?remaining,
                "run ended with unfinished work"
            );
        }
        let failed = stats.failed_ids();
        if !failed.is_empty() {
            error!(failed = failed.len(), ids = ?failed, "retries exhausted");
        }
    }
}

async fn produce(inner: Arc<Inner>) {
    loop {
        if inner.ctx.cancel.is_cancelled() {
            break;
        }
        if let Some(item) = inner.pending.try_pop() {
            if !inner.enqueue(item).await {
                break;
            }
            continue;
        }
        let Some(scan) = inner.scan.as_ref() else {
            break;
        };
        let next = tokio::select! {
            biased;
            () = inner.ctx.cancel.cancelled() => break,
            next = scan.output().pop() => next,
        };
        let Some(item) = next else {
            break;
        };
        if !inner.enqueue(item).await {
            break;
        }
    }
    inner.ready.close();
    debug!("producer finished");
}

async fn consume(inner: Arc<Inner>, worker: usize) {
    loop {
        let next = tokio::select! {
            biased;
            () = inner.ctx.cancel.cancelled() => break,
            next = inner.ready.pop() => next,
        };
        let Some(item) = next else {
            break;
        };
        debug!(worker, item_id = item.id(), "consumer picked item");
        inner.process(item).await;
    }
    debug!(worker, "consumer finished");
}

async fn report(inner: Arc<Inner>, finished: CancellationToken) {
    let mut last: Option<(usize, usize, usize)> = None;
    let mut last_forced = Instant::now();
    loop {
        let busy = !lock(&inner.active).is_empty();
        let cadence = if busy {
            inner.config.report_interval
        } else {
            inner.config.idle_poll_interval
        };
        tokio::select! {
            biased;
            () = finished.cancelled() => break,
            () = tokio::time::sleep(cadence) => {}
        }

        let queued = inner.pending.len()
            + inner.ready.len()
            + inner.scan.as_ref().map_or(0, |s| s.output().len());
        let active = lock(&inner.active).len();
        let writing = inner.ctx.writing.len();
        let snapshot = (queued, active, writing);
        let forced = last_forced.elapsed() >= inner.config.forced_report_interval;
        if last != Some(snapshot) || forced {
            info!(
                queued,
                active,
                writing,
                downloaded = inner.stats.downloaded(),
                "progress"
            );
            last = Some(snapshot);
        }
        if forced {
            last_forced = Instant::now();
            log_item_progress(&inner);
        }
    }
}

fn log_item_progress(inner: &Inner) {
    for entry in lock(&inner.active).iter() {
        let written = entry.tracker.written();
        let expected = entry.tracker.expected();
        let speed = entry.tracker.sample_speed();
        info!(item_id = entry.id, "{}", progress_line(written, expected, speed));
    }
}

/// Formats one item's progress: bytes, percent, speed and ETA.
#[must_use]
fn progress_line(written: u64, expected: u64, speed: Option<f64>) -> String {
    let mut line = if expected > 0 {
        #[allow(clippy::cast_precision_loss)]
        let percent = written as f64 * 100.0 / expected as f64;
        format!(
            "{} / {} ({percent:.1}%)",
            HumanBytes(written),
            HumanBytes(expected)
        )
    } else {
        format!("{}", HumanBytes(written))
    };
    if let Some(speed) = speed.filter(|s| *s > 0.0) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let per_sec = speed as u64;
        line.push_str(&format!(" at {}/s", HumanBytes(per_sec)));
        if expected > written {
            #[allow(clippy::cast_precision_loss)]
            let eta = (expected - written) as f64 / speed;
            line.push_str(&format!(
                ", {} left",
                HumanDuration(Duration::from_secs_f64(eta))
            ));
        }
    }
    line
}

async fn checkpoint_loop(inner: Arc<Inner>, path: PathBuf, finished: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            () = finished.cancelled() => break,
            () = tokio::time::sleep(inner.config.checkpoint_interval) => {}
        }
        let ids = inner.outstanding_ids();
        if ids.is_empty() {
            continue;
        }
        let checkpoint = Checkpoint::new(ids, inner.config.checkpoint_args.clone());
        if let Err(e) = checkpoint.write(&path).await {
            warn!(error = %e, "checkpoint write failed");
        }
    }
}
