//! Work items flowing through the scan and download stages.
//!
//! A [`WorkItem`] is owned by exactly one stage collection at a time and is
//! moved (never cloned) between them. The parts other tasks need to observe
//! while a consumer owns the item (progress counters, flags and the
//! destination path) live in a shared [`TransferTracker`].
//!
//! # Overview
//!
//! - [`WorkItem`] - id, lifecycle state, scan-derived [`ItemInfo`]
//! - [`ItemState`] - lifecycle with [`ItemState::can_transition_to`]
//! - [`ItemFlags`] - add-only bitset
//! - [`Outcome`] - per-item result shared by both stages
//! - [`Quality`] - ordered quality tiers

mod outcome;
mod quality;
mod state;

pub use outcome::Outcome;
pub use quality::Quality;
pub use state::{ItemState, TransitionError};

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Add-only flag set attached to a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ItemFlags(u8);

impl ItemFlags {
    /// No flags.
    pub const EMPTY: Self = Self(0);
    /// A file with the exact requested quality was already on disk.
    pub const EXISTED_EXACT: Self = Self(1);
    /// A file of another quality for the same id was already on disk.
    pub const EXISTED_SIMILAR_QUALITY: Self = Self(1 << 1);
    /// The destination file was created by this run.
    pub const CREATED_THIS_RUN: Self = Self(1 << 2);
    /// The remote reported the id as absent.
    pub const RETURNED_NOT_FOUND: Self = Self(1 << 3);

    /// Raw bit value.
    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether every bit of `other` is set in `self`.
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of both sets.
    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Scan-derived descriptive fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemInfo {
    /// Human-readable title.
    pub title: Option<String>,
    /// Direct media link used by the transfer.
    pub link: Option<String>,
    /// Duration in seconds.
    pub duration_secs: Option<u64>,
    /// Quality tier selected for download.
    pub quality: Option<Quality>,
    /// Remote tags.
    pub tags: Vec<String>,
    /// Free-text description.
    pub description: Option<String>,
    /// Free-text comments, one per entry.
    pub comments: Vec<String>,
    /// Uploader display name.
    pub uploader: Option<String>,
    /// Score as reported by the remote.
    pub score: Option<String>,
    /// Rating as reported by the remote.
    pub rating: Option<String>,
    /// Destination subfolder relative to the output directory.
    pub subfolder: Option<PathBuf>,
    /// Final file name, without directory.
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct SizeSample {
    bytes: u64,
    at: Instant,
}

/// Transfer bookkeeping shared between the owning consumer, the progress
/// reporter, the throttle detector and the interrupt handler.
#[derive(Debug, Default)]
pub struct TransferTracker {
    flags: AtomicU8,
    expected: AtomicU64,
    written: AtomicU64,
    started_at: Mutex<Option<Instant>>,
    last_sample: Mutex<Option<SizeSample>>,
    destination: Mutex<Option<PathBuf>>,
}

impl TransferTracker {
    /// Current flag set.
    #[must_use]
    pub fn flags(&self) -> ItemFlags {
        ItemFlags(self.flags.load(Ordering::Acquire))
    }

    /// Adds flags. Flags are never cleared.
    pub fn add_flags(&self, flags: ItemFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Whether all of `flags` are set.
    #[must_use]
    pub fn has(&self, flags: ItemFlags) -> bool {
        self.flags().contains(flags)
    }

    /// Expected total size in bytes (0 when unknown).
    #[must_use]
    pub fn expected(&self) -> u64 {
        self.expected.load(Ordering::Relaxed)
    }

    /// Sets the expected total size.
    pub fn set_expected(&self, bytes: u64) {
        self.expected.store(bytes, Ordering::Relaxed);
    }

    /// Bytes written to disk so far, including any resumed prefix.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Sets the written byte count (used when resuming from an offset).
    pub fn set_written(&self, bytes: u64) {
        self.written.store(bytes, Ordering::Relaxed);
    }

    /// Adds to the written byte count.
    pub fn add_written(&self, bytes: u64) {
        self.written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Marks the start of a transfer attempt and resets the speed sample.
    pub fn mark_started(&self) {
        let now = Instant::now();
        *lock(&self.started_at) = Some(now);
        *lock(&self.last_sample) = Some(SizeSample {
            bytes: self.written(),
            at: now,
        });
    }

    /// Time since [`mark_started`](Self::mark_started), if started.
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        lock(&self.started_at).map(|t| t.elapsed())
    }

    /// Instantaneous speed in bytes/s since the previous call.
    ///
    /// Returns `None` before the first sample or when no time has elapsed.
    pub fn sample_speed(&self) -> Option<f64> {
        let now = Instant::now();
        let written = self.written();
        let mut guard = lock(&self.last_sample);
        let previous = guard.replace(SizeSample {
            bytes: written,
            at: now,
        })?;
        let secs = now.duration_since(previous.at).as_secs_f64();
        if secs <= f64::EPSILON {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        let gained = written.saturating_sub(previous.bytes) as f64;
        Some(gained / secs)
    }

    /// Destination path once the transfer has chosen one.
    #[must_use]
    pub fn destination(&self) -> Option<PathBuf> {
        lock(&self.destination).clone()
    }

    /// Records the destination path.
    pub fn set_destination(&self, path: &Path) {
        *lock(&self.destination) = Some(path.to_path_buf());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One candidate resource identified by a numeric id.
#[derive(Debug)]
pub struct WorkItem {
    id: u64,
    state: ItemState,
    /// Scan-derived fields.
    pub info: ItemInfo,
    tracker: Arc<TransferTracker>,
}

impl WorkItem {
    /// Creates a new item in [`ItemState::New`].
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self {
            id,
            state: ItemState::New,
            info: ItemInfo::default(),
            tracker: Arc::new(TransferTracker::default()),
        }
    }

    /// Creates an item whose metadata is already known (skips the scan stage).
    #[must_use]
    pub fn preloaded(id: u64, info: ItemInfo) -> Self {
        Self {
            info,
            ..Self::new(id)
        }
    }

    /// Item id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ItemState {
        self.state
    }

    /// Shared transfer bookkeeping.
    #[must_use]
    pub fn tracker(&self) -> &Arc<TransferTracker> {
        &self.tracker
    }

    /// Current flags.
    #[must_use]
    pub fn flags(&self) -> ItemFlags {
        self.tracker.flags()
    }

    /// Adds flags to the item.
    pub fn add_flags(&self, flags: ItemFlags) {
        self.tracker.add_flags(flags);
    }

    /// Moves the item to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] if the move is not a legal transition; the
    /// state is left unchanged.
    pub fn advance(&mut self, next: ItemState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                id: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Moves the item to [`ItemState::Failed`] unless it is already terminal.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = ItemState::Failed;
        }
    }

    /// Destination path relative to `output_dir`, when a filename is known.
    #[must_use]
    pub fn destination_in(&self, output_dir: &Path) -> Option<PathBuf> {
        let filename = self.info.filename.as_deref()?;
        let mut path = output_dir.to_path_buf();
        if let Some(sub) = &self.info.subfolder {
            path.push(sub);
        }
        path.push(filename);
        Some(path)
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.info.title {
            Some(title) => write!(f, "#{} ({title})", self.id),
            None => write!(f, "#{}", self.id),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_new_item_starts_in_new_state_without_flags() {
        let item = WorkItem::new(42);
        assert_eq!(item.id(), 42);
        assert_eq!(item.state(), ItemState::New);
        assert_eq!(item.flags(), ItemFlags::EMPTY);
    }

    #[test]
    fn test_advance_walks_full_lifecycle() {
        let mut item = WorkItem::new(1);
        for next in [
            ItemState::Queued,
            ItemState::Active,
            ItemState::Scanning,
            ItemState::Scanned,
            ItemState::DownloadPending,
            ItemState::Downloading,
            ItemState::Writing,
            ItemState::Done,
        ] {
            item.advance(next).unwrap();
        }
        assert_eq!(item.state(), ItemState::Done);
    }

    #[test]
    fn test_advance_rejects_backward_move_and_keeps_state() {
        let mut item = WorkItem::new(3);
        item.advance(ItemState::Scanned).unwrap();
        let err = item.advance(ItemState::Queued).unwrap_err();
        assert_eq!(err.from, ItemState::Scanned);
        assert_eq!(err.to, ItemState::Queued);
        assert_eq!(item.state(), ItemState::Scanned);
    }

    #[test]
    fn test_fail_is_noop_on_terminal_item() {
        let mut item = WorkItem::new(3);
        item.advance(ItemState::Done).unwrap();
        item.fail();
        assert_eq!(item.state(), ItemState::Done);
    }

    #[test]
    fn test_flags_are_add_only_and_visible_through_tracker_clone() {
        let item = WorkItem::new(9);
        let tracker = Arc::clone(item.tracker());
        item.add_flags(ItemFlags::CREATED_THIS_RUN);
        tracker.add_flags(ItemFlags::RETURNED_NOT_FOUND);
        let flags = item.flags();
        assert!(flags.contains(ItemFlags::CREATED_THIS_RUN));
        assert!(flags.contains(ItemFlags::RETURNED_NOT_FOUND));
        assert!(!flags.contains(ItemFlags::EXISTED_EXACT));
        assert!(flags.contains(ItemFlags::CREATED_THIS_RUN.union(ItemFlags::RETURNED_NOT_FOUND)));
    }

    #[test]
    fn test_sample_speed_requires_prior_sample() {
        let tracker = TransferTracker::default();
        assert!(tracker.sample_speed().is_none());
        tracker.mark_started();
        tracker.add_written(1024);
        std::thread::sleep(Duration::from_millis(20));
        let speed = tracker.sample_speed().unwrap();
        assert!(speed > 0.0);
    }

    #[test]
    fn test_destination_in_joins_subfolder_and_filename() {
        let mut item = WorkItem::new(5);
        assert!(item.destination_in(Path::new("/out")).is_none());
        item.info.subfolder = Some(PathBuf::from("uploader"));
        item.info.filename = Some("5_720p.mp4".to_string());
        assert_eq!(
            item.destination_in(Path::new("/out")).unwrap(),
            PathBuf::from("/out/uploader/5_720p.mp4")
        );
    }
}
