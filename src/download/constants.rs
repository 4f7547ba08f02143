//! Timeouts and cadences for the download stage.

use std::time::Duration;

/// HTTP connect timeout.
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// HTTP read timeout (per read, not per transfer).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Progress line cadence while transfers are running.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(3);

/// Progress poll cadence while idle.
pub const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A progress line with per-item detail is logged at least this often.
pub const FORCED_REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Checkpoint rewrite cadence.
pub const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(30);
