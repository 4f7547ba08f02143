//! Scan stage: sequential metadata inspection.
//!
//! The scan stage drains its pending queue strictly in order, one item at a
//! time (only transfers run in parallel). Each item is handed to a
//! [`Scanner`]; eligible items move to the output queue consumed by the
//! download stage, everything else is recorded in [`RunStats`] and dropped.
//!
//! # Extension modes
//!
//! With a positive lookahead `L`, exhausting the pending queue synthesizes
//! the next `L − trailing_not_found` ids. A negative `L` enables watcher
//! mode: once `|L|` consecutive ids were not found, the stage rewinds up to
//! `|L|` ids behind the last existing one, re-extends, and sleeps before the
//! next pass. Watcher mode only ends through cancellation.

mod gaps;
mod scanner;

pub use gaps::{GapAudit, GapPredictor, GapReport, GapTable};
pub use scanner::{MetadataScanner, Scanner};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::item::{ItemFlags, ItemState, Outcome, WorkItem};
use crate::queue::WorkQueue;
use crate::stats::RunStats;

/// Delay before re-scanning an item that returned an empty response.
pub const DEFAULT_EMPTY_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Watcher pause per id of lookahead.
const WATCHER_DELAY_PER_ID: Duration = Duration::from_secs(30);

/// Shortest watcher pause.
const WATCHER_MIN_DELAY: Duration = Duration::from_secs(5 * 60);

/// Longest watcher pause.
const WATCHER_MAX_DELAY: Duration = Duration::from_secs(30 * 60);

/// Scan stage settings.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// `0` disables extension, `> 0` is lookahead, `< 0` is watcher mode.
    pub lookahead: i64,
    /// Skip fetches for predicted gaps.
    pub predict_gaps: bool,
    /// Record not-found runs and report them at shutdown.
    pub audit_gaps: bool,
    /// Block sizes per id range.
    pub gap_table: GapTable,
    /// Pause before retrying an empty response.
    pub empty_retry_delay: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            lookahead: 0,
            predict_gaps: false,
            audit_gaps: false,
            gap_table: GapTable::default(),
            empty_retry_delay: DEFAULT_EMPTY_RETRY_DELAY,
        }
    }
}

/// Watcher pause for a lookahead of `width` ids.
#[must_use]
pub fn watcher_delay(width: u64) -> Duration {
    let per_id = u32::try_from(width).unwrap_or(u32::MAX);
    WATCHER_DELAY_PER_ID
        .saturating_mul(per_id)
        .clamp(WATCHER_MIN_DELAY, WATCHER_MAX_DELAY)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Queues and markers of the scan stage visible to other tasks.
///
/// The download stage reads it to pull scanned items and to enumerate
/// unscanned ids for checkpoints.
#[derive(Debug, Default)]
pub struct ScanShared {
    pending: WorkQueue<WorkItem>,
    output: WorkQueue<WorkItem>,
    current: Mutex<Option<u64>>,
    abandoned: Mutex<Vec<u64>>,
    sequence: Mutex<Vec<u64>>,
}

impl ScanShared {
    /// Items waiting to be scanned.
    #[must_use]
    pub fn pending(&self) -> &WorkQueue<WorkItem> {
        &self.pending
    }

    /// Scanned items waiting for the download stage.
    #[must_use]
    pub fn output(&self) -> &WorkQueue<WorkItem> {
        &self.output
    }

    /// Ids not yet scanned: the item being scanned, pending items and items
    /// dropped by cancellation.
    #[must_use]
    pub fn unscanned_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = lock(&self.current).iter().copied().collect();
        ids.extend(self.pending.snapshot(WorkItem::id));
        ids.extend(lock(&self.abandoned).iter().copied());
        ids
    }

    /// Ids of scanned items not yet pulled by the download stage.
    #[must_use]
    pub fn output_ids(&self) -> Vec<u64> {
        self.output.snapshot(WorkItem::id)
    }

    /// Every id that entered the scan stage, in order.
    #[must_use]
    pub fn sequence(&self) -> Vec<u64> {
        lock(&self.sequence).clone()
    }
}

#[derive(Debug)]
struct ScanState {
    predictor: GapPredictor,
    audit: Option<GapAudit>,
    trailing_not_found: u64,
    last_processed: Option<u64>,
    last_existing: Option<u64>,
}

impl ScanState {
    fn record(&mut self, id: u64, outcome: Outcome) {
        self.predictor.observe(id, outcome);
        if let Some(audit) = self.audit.as_mut() {
            audit.observe(id, outcome);
        }
        self.last_processed = Some(id);
        match outcome {
            Outcome::NotFound => self.trailing_not_found += 1,
            Outcome::EmptyResponse | Outcome::RetriesExhausted => {}
            _ => {
                self.trailing_not_found = 0;
                self.note_existing(id);
            }
        }
    }

    /// Folds a download result back into the prediction state.
    fn note_download(&mut self, id: u64, outcome: Outcome) {
        self.predictor.observe(id, outcome);
        if outcome == Outcome::Success {
            self.note_existing(id);
        }
    }

    fn note_existing(&mut self, id: u64) {
        self.last_existing = Some(self.last_existing.map_or(id, |prev| prev.max(id)));
    }
}

/// Sequential metadata inspection stage.
pub struct ScanStage {
    scanner: Arc<dyn Scanner>,
    config: ScanConfig,
    shared: Arc<ScanShared>,
    stats: Arc<RunStats>,
    cancel: CancellationToken,
    feedback: Mutex<Option<mpsc::UnboundedReceiver<(u64, Outcome)>>>,
}

impl ScanStage {
    /// Creates a stage over `items`, scanned in the given order.
    #[must_use]
    pub fn new(
        items: Vec<WorkItem>,
        scanner: Arc<dyn Scanner>,
        config: ScanConfig,
        stats: Arc<RunStats>,
        cancel: CancellationToken,
    ) -> Self {
        let shared = Arc::new(ScanShared::default());
        let mut ids = Vec::with_capacity(items.len());
        let queued: Vec<WorkItem> = items
            .into_iter()
            .map(|mut item| {
                if let Err(e) = item.advance(ItemState::Queued) {
                    warn!(error = %e, "scan input not in new state");
                }
                ids.push(item.id());
                item
            })
            .collect();
        shared.pending.extend(queued);
        *lock(&shared.sequence) = ids;
        Self {
            scanner,
            config,
            shared,
            stats,
            cancel,
            feedback: Mutex::new(None),
        }
    }

    /// Connects the per-item results reported by the download stage.
    #[must_use]
    pub fn with_feedback(self, feedback: mpsc::UnboundedReceiver<(u64, Outcome)>) -> Self {
        *lock(&self.feedback) = Some(feedback);
        self
    }

    /// Shared queues, for wiring the download stage.
    #[must_use]
    pub fn shared(&self) -> Arc<ScanShared> {
        Arc::clone(&self.shared)
    }

    /// Drains the pending queue, extending it per the lookahead setting.
    ///
    /// Returns once the queue is exhausted (and cannot be extended) or the
    /// stage is cancelled. The output queue is closed on return.
    #[instrument(skip(self), fields(lookahead = self.config.lookahead))]
    pub async fn run(&self) {
        let mut feedback = lock(&self.feedback).take();
        let mut state = ScanState {
            predictor: GapPredictor::new(self.config.gap_table.clone(), self.config.predict_gaps),
            audit: self.config.audit_gaps.then(GapAudit::new),
            trailing_not_found: 0,
            last_processed: None,
            last_existing: None,
        };
        if self.config.predict_gaps && !state.predictor.is_enabled() {
            warn!("gap prediction requested but the gap table is empty");
        }
        info!(pending = self.shared.pending.len(), "scan stage started");

        loop {
            if self.cancel.is_cancelled() {
                self.abandon_pending();
                break;
            }
            if let Some(rx) = feedback.as_mut() {
                while let Ok((id, outcome)) = rx.try_recv() {
                    state.note_download(id, outcome);
                }
            }

            let Some(item) = self.shared.pending.try_pop() else {
                if self.extend(&mut state).await {
                    continue;
                }
                break;
            };
            self.process(item, &mut state).await;
        }

        self.shared.output.close();
        if let Some(audit) = state.audit.as_ref() {
            audit.log_report();
        }
        info!(scanned = self.stats.scanned(), "scan stage finished");
    }

    async fn process(&self, mut item: WorkItem, state: &mut ScanState) {
        let id = item.id();
        *lock(&self.shared.current) = Some(id);

        let outcome = if state.predictor.predict(id) {
            debug!(item_id = id, "predicted gap, skipping fetch");
            advance(&mut item, ItemState::Active);
            advance(&mut item, ItemState::Scanning);
            Some(Outcome::NotFound)
        } else {
            self.scan_until_answer(&mut item).await
        };

        let Some(outcome) = outcome else {
            // cancelled during an empty-response pause
            lock(&self.shared.abandoned).push(id);
            *lock(&self.shared.current) = None;
            return;
        };
        state.record(id, outcome);

        match outcome {
            Outcome::Success => {
                advance(&mut item, ItemState::Scanned);
                self.stats.record_scanned();
                debug!(item_id = id, "scanned");
                self.shared.output.extend([item]);
            }
            Outcome::AlreadyExists | Outcome::Skipped | Outcome::SkippedByFilter => {
                advance(&mut item, ItemState::Done);
                self.stats.record(&item, outcome);
            }
            _ => {
                if outcome == Outcome::NotFound {
                    item.add_flags(ItemFlags::RETURNED_NOT_FOUND);
                }
                item.fail();
                self.stats.record(&item, outcome);
            }
        }
        *lock(&self.shared.current) = None;
    }

    /// Scans an item, retrying empty responses in place.
    ///
    /// Returns `None` if cancelled while waiting to retry.
    async fn scan_until_answer(&self, item: &mut WorkItem) -> Option<Outcome> {
        let mut empty_responses = 0u32;
        loop {
            advance(item, ItemState::Active);
            advance(item, ItemState::Scanning);
            let outcome = self.scanner.scan(item).await;
            if !outcome.is_transient() {
                return Some(outcome);
            }
            empty_responses += 1;
            warn!(
                item_id = item.id(),
                empty_responses,
                delay_ms = self.config.empty_retry_delay.as_millis(),
                "empty response, retrying in place"
            );
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return None,
                () = tokio::time::sleep(self.config.empty_retry_delay) => {}
            }
        }
    }

    /// Extends the pending queue after it ran dry. Returns `false` when the
    /// stage should stop.
    async fn extend(&self, state: &mut ScanState) -> bool {
        let lookahead = self.config.lookahead;
        let Some(last) = state.last_processed else {
            return false;
        };
        if lookahead == 0 {
            return false;
        }
        let width = lookahead.unsigned_abs();

        if lookahead > 0 {
            let budget = width.saturating_sub(state.trailing_not_found);
            if budget == 0 {
                debug!(last, "lookahead budget spent");
                return false;
            }
            self.synthesize(last.saturating_add(1), budget.min(width));
            return true;
        }

        if state.trailing_not_found < width {
            self.synthesize(last.saturating_add(1), width - state.trailing_not_found);
            return true;
        }

        let last_existing = state.last_existing.unwrap_or(last);
        let rewind = width.min(last.saturating_sub(last_existing));
        let start = last.saturating_add(1).saturating_sub(rewind);
        let delay = watcher_delay(width);
        state.trailing_not_found = 0;
        self.synthesize(start, width + rewind);
        info!(
            from = start,
            count = width + rewind,
            rewind,
            delay_secs = delay.as_secs(),
            "watcher pass complete, sleeping"
        );
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                self.abandon_pending();
                false
            }
            () = tokio::time::sleep(delay) => true,
        }
    }

    fn synthesize(&self, start: u64, count: u64) {
        let ids: Vec<u64> = (0..count).filter_map(|k| start.checked_add(k)).collect();
        debug!(start, count, "extending scan range");
        lock(&self.shared.sequence).extend(ids.iter().copied());
        self.shared.pending.extend(ids.into_iter().map(|id| {
            let mut item = WorkItem::new(id);
            advance(&mut item, ItemState::Queued);
            item
        }));
    }

    fn abandon_pending(&self) {
        let dropped = self.shared.pending.drain();
        if !dropped.is_empty() {
            info!(dropped = dropped.len(), "scan cancelled, pending items cleared");
        }
        lock(&self.shared.abandoned).extend(dropped.iter().map(WorkItem::id));
    }
}

fn advance(item: &mut WorkItem, next: ItemState) {
    if let Err(e) = item.advance(next) {
        warn!(error = %e, "unexpected state transition");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    /// Scanner answering from a script; unscripted ids are not found.
    #[derive(Default)]
    struct ScriptedScanner {
        found: HashSet<u64>,
        empties: Mutex<HashMap<u64, usize>>,
        calls: Mutex<Vec<u64>>,
    }

    impl ScriptedScanner {
        fn found(ids: impl IntoIterator<Item = u64>) -> Self {
            Self {
                found: ids.into_iter().collect(),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<u64> {
            lock(&self.calls).clone()
        }
    }

    #[async_trait]
    impl Scanner for ScriptedScanner {
        async fn scan(&self, item: &mut WorkItem) -> Outcome {
            lock(&self.calls).push(item.id());
            if let Some(left) = lock(&self.empties).get_mut(&item.id())
                && *left > 0
            {
                *left -= 1;
                return Outcome::EmptyResponse;
            }
            if self.found.contains(&item.id()) {
                Outcome::Success
            } else {
                Outcome::NotFound
            }
        }
    }

    fn stage(ids: impl IntoIterator<Item = u64>, scanner: Arc<dyn Scanner>, config: ScanConfig) -> ScanStage {
        ScanStage::new(
            ids.into_iter().map(WorkItem::new).collect(),
            scanner,
            config,
            Arc::new(RunStats::new()),
            CancellationToken::new(),
        )
    }

    fn output_ids(stage: &ScanStage) -> Vec<u64> {
        stage.shared().output().drain().iter().map(WorkItem::id).collect()
    }

    #[tokio::test]
    async fn test_output_preserves_input_order() {
        let scanner = Arc::new(ScriptedScanner::found(1..=20));
        let stage = stage(1..=20, scanner, ScanConfig::default());
        stage.run().await;
        assert_eq!(output_ids(&stage), (1..=20).collect::<Vec<_>>());
        assert!(stage.shared().output().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_response_retried_in_place() {
        let scanner = Arc::new(ScriptedScanner::found([1, 2, 3]));
        lock(&scanner.empties).insert(2, 3);
        let stage = stage([1, 2, 3], scanner.clone(), ScanConfig::default());
        stage.run().await;

        assert_eq!(scanner.calls(), vec![1, 2, 2, 2, 2, 3]);
        let out = stage.shared().output().drain();
        assert_eq!(out.iter().map(WorkItem::id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(out.iter().all(|i| i.state() == ItemState::Scanned));
    }

    #[tokio::test]
    async fn test_failures_recorded_and_dropped() {
        let scanner = Arc::new(ScriptedScanner::found([1]));
        let stats = Arc::new(RunStats::new());
        let stage = ScanStage::new(
            vec![WorkItem::new(1), WorkItem::new(2)],
            scanner,
            ScanConfig::default(),
            Arc::clone(&stats),
            CancellationToken::new(),
        );
        stage.run().await;
        assert_eq!(output_ids(&stage), vec![1]);
        assert_eq!(stats.scanned(), 1);
        assert_eq!(stats.not_found(), 1);
    }

    #[tokio::test]
    async fn test_lookahead_budget_shrinks_with_trailing_not_found() {
        // 1 exists, everything after is missing; lookahead 3
        let scanner = Arc::new(ScriptedScanner::found([1]));
        let config = ScanConfig {
            lookahead: 3,
            ..ScanConfig::default()
        };
        let stage = stage([1], scanner.clone(), config);
        stage.run().await;
        // after 1: budget 3 -> 2,3,4 all missing -> budget 0
        assert_eq!(scanner.calls(), vec![1, 2, 3, 4]);
        assert_eq!(stage.shared().sequence(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_lookahead_continues_past_hits() {
        let scanner = Arc::new(ScriptedScanner::found([1, 3, 5]));
        let config = ScanConfig {
            lookahead: 2,
            ..ScanConfig::default()
        };
        let stage = stage([1], scanner.clone(), config);
        stage.run().await;
        assert_eq!(scanner.calls(), vec![1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(output_ids(&stage), vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn test_gap_prediction_skips_fetch() {
        let scanner = Arc::new(ScriptedScanner::found([10, 12]));
        let config = ScanConfig {
            predict_gaps: true,
            gap_table: GapTable::new(vec![(0, 2)]).unwrap(),
            ..ScanConfig::default()
        };
        let stats = Arc::new(RunStats::new());
        let stage = ScanStage::new(
            (10..=13).map(WorkItem::new).collect(),
            scanner.clone(),
            config,
            Arc::clone(&stats),
            CancellationToken::new(),
        );
        stage.run().await;
        assert_eq!(scanner.calls(), vec![10, 12]);
        assert_eq!(stats.not_found(), 2);
    }

    #[tokio::test]
    async fn test_inconsistent_pattern_disables_prediction() {
        // block size 2, but 13 exists three ids after 10
        let scanner = Arc::new(ScriptedScanner::found([10, 13]));
        let config = ScanConfig {
            predict_gaps: true,
            gap_table: GapTable::new(vec![(0, 2)]).unwrap(),
            ..ScanConfig::default()
        };
        let stage = stage(10..=14, scanner.clone(), config);
        stage.run().await;
        // 11 predicted; 14 fetched because prediction was switched off at 13
        assert_eq!(scanner.calls(), vec![10, 12, 13, 14]);
    }

    #[tokio::test]
    async fn test_cancel_clears_pending() {
        struct CancellingScanner {
            cancel: CancellationToken,
            calls: AtomicUsize,
        }

        #[async_trait]
        impl Scanner for CancellingScanner {
            async fn scan(&self, _item: &mut WorkItem) -> Outcome {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.cancel.cancel();
                Outcome::Success
            }
        }

        let cancel = CancellationToken::new();
        let scanner = Arc::new(CancellingScanner {
            cancel: cancel.clone(),
            calls: AtomicUsize::new(0),
        });
        let stage = ScanStage::new(
            (1..=5).map(WorkItem::new).collect(),
            scanner.clone(),
            ScanConfig::default(),
            Arc::new(RunStats::new()),
            cancel,
        );
        stage.run().await;
        assert_eq!(scanner.calls.load(Ordering::SeqCst), 1);
        let shared = stage.shared();
        assert!(shared.pending().is_empty());
        assert_eq!(shared.output_ids(), vec![1]);
        assert_eq!(shared.unscanned_ids(), vec![2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_rewinds_and_sleeps_until_cancelled() {
        let scanner = Arc::new(ScriptedScanner::found([1]));
        let cancel = CancellationToken::new();
        let config = ScanConfig {
            lookahead: -2,
            ..ScanConfig::default()
        };
        let stage = Arc::new(ScanStage::new(
            vec![WorkItem::new(1)],
            scanner.clone(),
            config,
            Arc::new(RunStats::new()),
            cancel.clone(),
        ));
        let runner = {
            let stage = Arc::clone(&stage);
            tokio::spawn(async move { stage.run().await })
        };

        // first pass: 1, then 2,3 missing -> rewind 2 behind 3 and re-extend 4 ids from 2
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(scanner.calls(), vec![1, 2, 3]);
        assert_eq!(stage.shared().pending().snapshot(WorkItem::id), vec![2, 3, 4, 5]);
        assert!(!runner.is_finished());

        // the pause is clamp(2 * 30s, 5min, 30min) = 5 minutes
        tokio::time::sleep(Duration::from_secs(5 * 60)).await;
        assert_eq!(&scanner.calls()[..7], &[1, 2, 3, 2, 3, 4, 5]);

        cancel.cancel();
        runner.await.unwrap();
        assert!(stage.shared().output().is_closed());
    }

    #[test]
    fn test_watcher_delay_is_clamped() {
        assert_eq!(watcher_delay(1), WATCHER_MIN_DELAY);
        assert_eq!(watcher_delay(20), Duration::from_secs(600));
        assert_eq!(watcher_delay(1000), WATCHER_MAX_DELAY);
    }

    #[test]
    fn test_unscanned_ids_include_pending_in_order() {
        let stage = stage([5, 3, 9], Arc::new(ScriptedScanner::default()), ScanConfig::default());
        assert_eq!(stage.shared().unscanned_ids(), vec![5, 3, 9]);
    }

    #[test]
    fn test_download_result_updates_gap_prediction() {
        let mut state = ScanState {
            predictor: GapPredictor::new(GapTable::new(vec![(0, 2)]).unwrap(), true),
            audit: None,
            trailing_not_found: 0,
            last_processed: None,
            last_existing: None,
        };
        state.record(10, Outcome::Success);
        assert!(state.predictor.predict(11));

        // media vanished between scan and download
        state.note_download(10, Outcome::NotFound);
        assert!(!state.predictor.predict(11));

        state.note_download(20, Outcome::Success);
        assert_eq!(state.last_existing, Some(20));
        assert!(state.predictor.predict(21));
    }
}
