//! scandl core library
//!
//! Scans a remote catalog by numeric id and bulk downloads the matching media
//! with bounded concurrency, throttle detection and resumable checkpoints.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`item`] - Work items, their state machine, flags and outcomes
//! - [`scan`] - Sequential scan stage with lookahead, watcher mode and gap prediction
//! - [`download`] - Download stage, HTTP transfer, retry and throttle detection
//! - [`pipeline`] - Driver wiring both stages together
//! - [`checkpoint`] - Replayable resume files
//! - [`metadata`] - Remote metadata source and tag filter
//! - [`index`] - Lookup of files already present in the output directory
//! - [`sidecar`] - JSON metadata files written next to downloads
//! - [`cancel`] - Interruption sources feeding one cancellation token

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cancel;
pub mod checkpoint;
pub mod download;
pub mod index;
pub mod item;
pub mod metadata;
pub mod pipeline;
pub mod queue;
pub mod scan;
pub mod sidecar;
pub mod stats;
mod user_agent;

// Re-export commonly used types
pub use checkpoint::{Checkpoint, CheckpointError};
pub use download::{
    DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES, DownloadConfig, DownloadStage, HttpTransfer,
    RetryPolicy, ThrottleDetector, ThrottleGovernor, Transfer, TransferContext,
};
pub use item::{ItemFlags, ItemInfo, ItemState, Outcome, Quality, WorkItem};
pub use pipeline::{Input, Pipeline, PipelineConfig, PipelineError, RunReport};
pub use scan::{ScanConfig, ScanStage, Scanner};
pub use stats::RunStats;
