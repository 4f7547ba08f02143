//! Throttle detection for in-flight transfers.
//!
//! Some servers silently slow a connection to a trickle instead of failing
//! it. A [`ThrottleDetector`] watches one transfer on a fixed cadence and
//! cancels the attempt's abort token when the bytes gained over an interval
//! fall below the configured floor. The transfer then drops the response
//! (closing the connection) and its retry loop resumes from the partial
//! offset.
//!
//! The floor lives in a [`ThrottleGovernor`] shared by every transfer. With
//! adaptation enabled, every third interruption recomputes the floor as
//! `0.98 × mean(samples ∪ {floor})` so a connection that is merely slower than
//! the initial guess stops being killed.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default interval between throughput checks.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Interruptions collected before the floor is recomputed.
const SAMPLES_PER_ADJUSTMENT: usize = 3;

/// Factor applied to the averaged speed when lowering the floor.
const ADJUSTMENT_FACTOR: f64 = 0.98;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct GovernorState {
    floor_kbps: f64,
    samples: Vec<f64>,
}

/// Speed floor shared by all throttle detectors of a run.
#[derive(Debug)]
pub struct ThrottleGovernor {
    state: Mutex<GovernorState>,
    adaptive: bool,
}

impl ThrottleGovernor {
    /// Creates a governor with an initial floor in KB/s.
    ///
    /// A floor of zero disables throttle detection.
    #[must_use]
    pub fn new(floor_kbps: f64, adaptive: bool) -> Self {
        Self {
            state: Mutex::new(GovernorState {
                floor_kbps: floor_kbps.max(0.0),
                samples: Vec::with_capacity(SAMPLES_PER_ADJUSTMENT),
            }),
            adaptive,
        }
    }

    /// Current floor in KB/s.
    #[must_use]
    pub fn floor_kbps(&self) -> f64 {
        lock(&self.state).floor_kbps
    }

    /// Whether detection is active at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.floor_kbps() > 0.0
    }

    /// Number of interruption samples waiting for the next adjustment.
    #[must_use]
    pub fn pending_samples(&self) -> usize {
        lock(&self.state).samples.len()
    }

    /// Records the speed of an interrupted connection.
    ///
    /// Returns the new floor when this sample triggered an adjustment.
    pub fn record_interruption(&self, kbps: f64) -> Option<f64> {
        if !self.adaptive {
            return None;
        }
        let mut state = lock(&self.state);
        state.samples.push(kbps);
        if state.samples.len() < SAMPLES_PER_ADJUSTMENT {
            return None;
        }
        let total: f64 = state.samples.iter().sum::<f64>() + state.floor_kbps;
        #[allow(clippy::cast_precision_loss)]
        let mean = total / (state.samples.len() + 1) as f64;
        let previous = state.floor_kbps;
        state.floor_kbps = ADJUSTMENT_FACTOR * mean;
        state.samples.clear();
        info!(
            previous_kbps = previous,
            floor_kbps = state.floor_kbps,
            "throttle floor adjusted"
        );
        Some(state.floor_kbps)
    }
}

#[derive(Debug)]
struct Attachment {
    abort: CancellationToken,
    path: PathBuf,
    last_size: u64,
    tripped_kbps: Option<f64>,
}

/// Watchdog for a single transfer.
///
/// Each [`attach`](Self::attach) starts a fresh check task whose first tick
/// lands one full interval later; [`detach`](Self::detach) and drop abort it.
/// Between attempts nothing runs.
#[derive(Debug)]
pub struct ThrottleDetector {
    governor: Arc<ThrottleGovernor>,
    interval: Duration,
    attachment: Arc<Mutex<Option<Attachment>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ThrottleDetector {
    /// Creates a detached detector checking every `interval`.
    #[must_use]
    pub fn new(governor: Arc<ThrottleGovernor>, interval: Duration) -> Self {
        Self {
            governor,
            interval,
            attachment: Arc::new(Mutex::new(None)),
            task: Mutex::new(None),
        }
    }

    /// Starts watching an attempt writing to `path`, which already held
    /// `start_size` bytes when the attempt began.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach(&self, abort: CancellationToken, path: &Path, start_size: u64) {
        self.stop();
        *lock(&self.attachment) = Some(Attachment {
            abort,
            path: path.to_path_buf(),
            last_size: start_size,
            tripped_kbps: None,
        });
        let task = tokio::spawn(check_loop(
            Arc::clone(&self.attachment),
            Arc::clone(&self.governor),
            self.interval,
        ));
        *lock(&self.task) = Some(task);
    }

    /// Stops watching the current attempt.
    ///
    /// Returns the measured speed if the detector aborted it.
    pub fn detach(&self) -> Option<f64> {
        self.stop();
        lock(&self.attachment).take().and_then(|a| a.tripped_kbps)
    }

    fn stop(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

impl Drop for ThrottleDetector {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn check_loop(
    attachment: Arc<Mutex<Option<Attachment>>>,
    governor: Arc<ThrottleGovernor>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        check_once(&attachment, &governor, interval);
    }
}

fn check_once(
    attachment: &Mutex<Option<Attachment>>,
    governor: &ThrottleGovernor,
    interval: Duration,
) {
    let mut guard = lock(attachment);
    let Some(current) = guard.as_mut() else {
        return;
    };
    if current.tripped_kbps.is_some() {
        return;
    }
    // file not created yet means the response has not started writing
    let Ok(size) = std::fs::metadata(&current.path).map(|m| m.len()) else {
        return;
    };
    let gained = size.saturating_sub(current.last_size);
    current.last_size = size;

    let secs = interval.as_secs_f64().max(f64::EPSILON);
    #[allow(clippy::cast_precision_loss)]
    let gained_f = gained as f64;
    let kbps = gained_f / 1024.0 / secs;
    let floor = governor.floor_kbps();
    debug!(path = %current.path.display(), kbps, floor_kbps = floor, "throttle check");

    if floor > 0.0 && gained_f < floor * 1024.0 * secs {
        warn!(
            path = %current.path.display(),
            kbps,
            floor_kbps = floor,
            "connection below speed floor, aborting attempt"
        );
        current.tripped_kbps = Some(kbps);
        current.abort.cancel();
        governor.record_interruption(kbps);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_floor_adapts_after_three_samples() {
        let governor = ThrottleGovernor::new(8.0, true);
        assert_eq!(governor.record_interruption(10.0), None);
        assert_eq!(governor.record_interruption(12.0), None);
        let floor = governor.record_interruption(11.0).unwrap();
        let expected = 0.98 * (10.0 + 12.0 + 11.0 + 8.0) / 4.0;
        assert!((floor - expected).abs() < 1e-9, "{floor} != {expected}");
        assert!((governor.floor_kbps() - expected).abs() < 1e-9);
        assert_eq!(governor.pending_samples(), 0);
    }

    #[test]
    fn test_floor_fixed_when_not_adaptive() {
        let governor = ThrottleGovernor::new(8.0, false);
        for _ in 0..5 {
            assert_eq!(governor.record_interruption(1.0), None);
        }
        assert!((governor.floor_kbps() - 8.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_zero_floor_disables_detection() {
        assert!(!ThrottleGovernor::new(0.0, true).is_enabled());
        assert!(ThrottleGovernor::new(0.5, false).is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_detector_aborts_stalled_transfer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stalled.part");
        std::fs::write(&path, vec![0u8; 100]).unwrap();

        let governor = Arc::new(ThrottleGovernor::new(8.0, true));
        let detector = ThrottleDetector::new(Arc::clone(&governor), Duration::from_secs(1));
        let abort = CancellationToken::new();
        detector.attach(abort.clone(), &path, 100);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(abort.is_cancelled());
        let kbps = detector.detach().unwrap();
        assert!(kbps.abs() < f64::EPSILON);
        assert_eq!(governor.pending_samples(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detector_leaves_fast_transfer_alone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fast.part");
        std::fs::write(&path, Vec::<u8>::new()).unwrap();

        let governor = Arc::new(ThrottleGovernor::new(8.0, false));
        let detector = ThrottleDetector::new(governor, Duration::from_secs(1));
        let abort = CancellationToken::new();
        detector.attach(abort.clone(), &path, 0);

        std::fs::write(&path, vec![0u8; 64 * 1024]).unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(!abort.is_cancelled());
        assert_eq!(detector.detach(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_detector_is_noop() {
        let governor = Arc::new(ThrottleGovernor::new(8.0, true));
        let detector = ThrottleDetector::new(Arc::clone(&governor), Duration::from_secs(1));
        let abort = CancellationToken::new();
        detector.attach(abort.clone(), Path::new("/nonexistent/file.part"), 0);
        assert_eq!(detector.detach(), None);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!abort.is_cancelled());
        assert_eq!(governor.pending_samples(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_attach_waits_a_full_interval() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("late.part");
        std::fs::write(&path, Vec::<u8>::new()).unwrap();

        let governor = Arc::new(ThrottleGovernor::new(8.0, true));
        let detector = ThrottleDetector::new(Arc::clone(&governor), Duration::from_secs(60));
        let abort = CancellationToken::new();
        detector.attach(CancellationToken::new(), &path, 0);
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(detector.detach(), None);

        // retry attaches just before the old cadence would have ticked
        detector.attach(abort.clone(), &path, 0);
        std::fs::write(&path, vec![0u8; 100 * 1024]).unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(!abort.is_cancelled());
        assert_eq!(governor.pending_samples(), 0);

        // keeps ~100 KB/s over the first full interval
        std::fs::write(&path, vec![0u8; 6000 * 1024]).unwrap();
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(!abort.is_cancelled());
        assert_eq!(detector.detach(), None);
    }
}
