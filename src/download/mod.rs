//! Download stage and the HTTP transfer behind it.
//!
//! # Features
//!
//! - Bounded-concurrency consumer pool fed by the scan stage
//! - Streaming transfers into `.part` files with `Range` resume
//! - Jittered retry for transient failures, honoring `Retry-After`
//! - Per-transfer throttle detection with an adaptive speed floor
//! - Periodic resume checkpoints and interrupt cleanup

mod client;
mod constants;
mod engine;
mod error;
mod filename;
mod retry;
mod throttle;
mod transfer;

pub use client::{HttpTransfer, PART_SUFFIX, build_client, part_path};
pub use engine::{
    DEFAULT_CONCURRENCY, DownloadConfig, DownloadStage, MAX_CONCURRENCY, MIN_CONCURRENCY,
    StageError,
};
pub use error::DownloadError;
pub use filename::{build_filename, parse_filename};
pub(crate) use filename::sanitize_filename;
pub use retry::{
    DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error,
    parse_retry_after,
};
pub(crate) use retry::classify_http_status;
pub use throttle::{DEFAULT_CHECK_INTERVAL, ThrottleDetector, ThrottleGovernor};
pub use transfer::{Transfer, TransferContext, WritingGuard, WritingSet};

// Note: we do NOT define module-local Result aliases.
// Use `Result<T, DownloadError>` explicitly in function signatures.
