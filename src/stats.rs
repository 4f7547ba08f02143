//! Run-wide finish bookkeeping shared by both stages.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::item::{Outcome, WorkItem};

/// Outcome counters for one run.
///
/// Both stages record every item that leaves the pipeline here, whatever
/// the outcome, so the final report covers scan rejections and transfer
/// results alike.
#[derive(Debug, Default)]
pub struct RunStats {
    scanned: AtomicUsize,
    downloaded: AtomicUsize,
    already_existed: AtomicUsize,
    skipped: AtomicUsize,
    filtered: AtomicUsize,
    not_found: AtomicUsize,
    deleted: AtomicUsize,
    failed_ids: Mutex<Vec<u64>>,
}

impl RunStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts an item that passed the scan stage.
    pub fn record_scanned(&self) {
        self.scanned.fetch_add(1, Ordering::SeqCst);
    }

    /// Records the final outcome of an item.
    pub fn record(&self, item: &WorkItem, outcome: Outcome) {
        debug!(item_id = item.id(), outcome = %outcome, "item finished");
        let counter = match outcome {
            Outcome::Success => &self.downloaded,
            Outcome::AlreadyExists => &self.already_existed,
            Outcome::Skipped => &self.skipped,
            Outcome::SkippedByFilter => &self.filtered,
            Outcome::NotFound => &self.not_found,
            Outcome::Deleted => &self.deleted,
            Outcome::RetriesExhausted => {
                self.failed_ids
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(item.id());
                return;
            }
            // retried in place by the scan stage, never final
            Outcome::EmptyResponse => return,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    /// Items that passed the scan stage.
    #[must_use]
    pub fn scanned(&self) -> usize {
        self.scanned.load(Ordering::SeqCst)
    }

    /// Items transferred successfully.
    #[must_use]
    pub fn downloaded(&self) -> usize {
        self.downloaded.load(Ordering::SeqCst)
    }

    /// Items whose file already existed.
    #[must_use]
    pub fn already_existed(&self) -> usize {
        self.already_existed.load(Ordering::SeqCst)
    }

    /// Items skipped by local policy or filters.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::SeqCst) + self.filtered.load(Ordering::SeqCst)
    }

    /// Items excluded by filters only.
    #[must_use]
    pub fn filtered(&self) -> usize {
        self.filtered.load(Ordering::SeqCst)
    }

    /// Items the remote reported absent.
    #[must_use]
    pub fn not_found(&self) -> usize {
        self.not_found.load(Ordering::SeqCst)
    }

    /// Items removed remotely.
    #[must_use]
    pub fn deleted(&self) -> usize {
        self.deleted.load(Ordering::SeqCst)
    }

    /// Ids whose retry budget was exhausted, ascending.
    #[must_use]
    pub fn failed_ids(&self) -> Vec<u64> {
        let mut ids = self
            .failed_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        ids.sort_unstable();
        ids
    }

    /// Total items recorded with a final outcome.
    #[must_use]
    pub fn finished(&self) -> usize {
        self.downloaded()
            + self.already_existed()
            + self.skipped()
            + self.not_found()
            + self.deleted()
            + self.failed_ids().len()
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "downloaded {}, existed {}, skipped {}, not found {}, deleted {}, failed {}",
            self.downloaded(),
            self.already_existed(),
            self.skipped(),
            self.not_found(),
            self.deleted(),
            self.failed_ids().len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_routes_outcomes_to_counters() {
        let stats = RunStats::new();
        let outcomes = [
            (1, Outcome::Success),
            (2, Outcome::Success),
            (3, Outcome::AlreadyExists),
            (4, Outcome::Skipped),
            (5, Outcome::SkippedByFilter),
            (6, Outcome::NotFound),
            (7, Outcome::Deleted),
            (9, Outcome::RetriesExhausted),
            (8, Outcome::RetriesExhausted),
            (10, Outcome::EmptyResponse),
        ];
        for (id, outcome) in outcomes {
            stats.record(&WorkItem::new(id), outcome);
        }
        assert_eq!(stats.downloaded(), 2);
        assert_eq!(stats.already_existed(), 1);
        assert_eq!(stats.skipped(), 2);
        assert_eq!(stats.filtered(), 1);
        assert_eq!(stats.not_found(), 1);
        assert_eq!(stats.deleted(), 1);
        assert_eq!(stats.failed_ids(), vec![8, 9]);
        assert_eq!(stats.finished(), 9);
        assert_eq!(
            stats.to_string(),
            "downloaded 2, existed 1, skipped 2, not found 1, deleted 1, failed 2"
        );
    }
}
