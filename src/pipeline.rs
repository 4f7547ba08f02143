//! Pipeline driver: builds the items, wires the stages and runs them.
//!
//! A scan run feeds [`ScanStage`] and [`DownloadStage`] concurrently, with
//! download results flowing back to the scanner over an unbounded channel.
//! A preloaded item list skips the scan stage entirely.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::download::{
    DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES, DownloadConfig, DownloadStage, HttpTransfer,
    MAX_CONCURRENCY, MIN_CONCURRENCY, RetryPolicy, StageError, ThrottleGovernor, Transfer,
    build_client, build_filename, sanitize_filename,
};
use crate::index::{ExistingFile, FileIndex};
use crate::item::{ItemFlags, ItemInfo, ItemState, Outcome, Quality, WorkItem};
use crate::metadata::{ApiMetadataSource, MetadataError, TagFilter};
use crate::scan::{GapTable, MetadataScanner, ScanConfig, ScanStage, Scanner};
use crate::sidecar::export_sidecars;
use crate::stats::RunStats;

/// Precondition failures, raised before any work starts.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Nothing to scan or download.
    #[error("no ids to process")]
    EmptyIdSet,

    /// The range is reversed.
    #[error("start id {start} is greater than end id {end}")]
    InvalidRange {
        /// First id.
        start: u64,
        /// Last id.
        end: u64,
    },

    /// Concurrency outside the accepted range.
    #[error(transparent)]
    Stage(#[from] StageError),

    /// Options that cannot be combined.
    #[error("conflicting options: {0}")]
    Conflict(String),

    /// Scanning needs a metadata endpoint.
    #[error("a metadata URL is required to scan ids")]
    MissingMetadataUrl,

    /// The metadata endpoint template was rejected.
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    /// The item list could not be read.
    #[error("cannot read item list {path}: {source}")]
    ItemListIo {
        /// List path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The item list is not valid JSON.
    #[error("invalid item list {path}: {source}")]
    ItemListParse {
        /// List path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

/// What the run works on.
#[derive(Debug)]
pub enum Input {
    /// `start..=end`, or just `start` (extended by lookahead) when open.
    Range {
        /// First id.
        start: u64,
        /// Last id, inclusive.
        end: Option<u64>,
    },
    /// Explicit ids, scanned in the given order.
    Ids(Vec<u64>),
    /// Items whose metadata is already known; only downloaded.
    Items(Vec<WorkItem>),
}

impl Input {
    fn is_scan(&self) -> bool {
        !matches!(self, Self::Items(_))
    }
}

/// Run settings shared by both stages.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Root directory for media files.
    pub output_dir: PathBuf,
    /// Concurrent transfers.
    pub concurrency: usize,
    /// Highest quality tier to download.
    pub quality: Quality,
    /// `0` off, `> 0` lookahead, `< 0` watcher mode.
    pub lookahead: i64,
    /// Items carrying any of these tags are skipped.
    pub excluded_tags: Vec<String>,
    /// Items missing any of these tags are skipped.
    pub required_tags: Vec<String>,
    /// Throttle floor in KB/s; `0` disables detection.
    pub throttle_kbps: f64,
    /// Adapt the floor to observed speeds.
    pub throttle_auto: bool,
    /// Skip fetches for predicted gaps.
    pub predict_gaps: bool,
    /// Report not-found runs at shutdown.
    pub audit_gaps: bool,
    /// Block sizes used by gap prediction.
    pub gap_table: GapTable,
    /// Keep partial files created this run on interrupt.
    pub keep_unfinished: bool,
    /// Checkpoint file.
    pub checkpoint: Option<PathBuf>,
    /// Write JSON sidecars after the run.
    pub sidecar: bool,
    /// Metadata endpoint with an `{id}` placeholder.
    pub metadata_url: Option<String>,
    /// Attempts per request.
    pub max_retries: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            concurrency: DEFAULT_CONCURRENCY,
            quality: Quality::P2160,
            lookahead: 0,
            excluded_tags: Vec::new(),
            required_tags: Vec::new(),
            throttle_kbps: 0.0,
            throttle_auto: false,
            predict_gaps: false,
            audit_gaps: false,
            gap_table: GapTable::default(),
            keep_unfinished: false,
            checkpoint: None,
            sidecar: false,
            metadata_url: None,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl PipelineConfig {
    /// Option tokens replayed after the id set in checkpoints.
    ///
    /// Only non-default options are written, in a fixed order. Options that
    /// only exist in the file config are included so a resumed run does not
    /// depend on it.
    #[must_use]
    pub fn checkpoint_args(&self, end: Option<u64>) -> Vec<String> {
        let defaults = Self::default();
        let mut args = Vec::new();
        let mut push = |flag: &str, value: Option<String>| {
            args.push(flag.to_string());
            args.extend(value);
        };
        if let Some(end) = end {
            push("--end", Some(end.to_string()));
        }
        if self.lookahead != 0 {
            push("--lookahead", Some(self.lookahead.to_string()));
        }
        if self.output_dir != defaults.output_dir {
            push("--output", Some(self.output_dir.display().to_string()));
        }
        if self.concurrency != defaults.concurrency {
            push("--concurrency", Some(self.concurrency.to_string()));
        }
        if self.quality != defaults.quality {
            push("--quality", Some(self.quality.to_string()));
        }
        if !self.excluded_tags.is_empty() {
            push("--exclude-tags", Some(self.excluded_tags.join(",")));
        }
        if self.throttle_kbps > 0.0 {
            push("--throttle", Some(self.throttle_kbps.to_string()));
        }
        if self.throttle_auto {
            push("--throttle-auto", None);
        }
        if self.predict_gaps {
            push("--predict-gaps", None);
        }
        if self.keep_unfinished {
            push("--keep-unfinished", None);
        }
        if self.sidecar {
            push("--sidecar", None);
        }
        if !self.required_tags.is_empty() {
            push("--require-tags", Some(self.required_tags.join(",")));
        }
        if self.audit_gaps {
            push("--audit-gaps", None);
        }
        if self.max_retries != defaults.max_retries {
            push("--max-retries", Some(self.max_retries.to_string()));
        }
        if let Some(url) = &self.metadata_url {
            push("--metadata-url", Some(url.clone()));
        }
        args
    }
}

/// End-of-run figures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Items that passed the scan stage.
    pub scanned: usize,
    /// Files written.
    pub downloaded: usize,
    /// Items already present in the output directory.
    pub already_existed: usize,
    /// Items skipped (no rendition, filtered, deleted).
    pub skipped: usize,
    /// Ids the remote does not know.
    pub not_found: usize,
    /// Ids whose retries ran out.
    pub failed_ids: Vec<u64>,
    /// Ids neither finished nor failed.
    pub outstanding: usize,
    /// Sidecars created.
    pub sidecars: usize,
    /// Whether the run was cancelled.
    pub interrupted: bool,
}

impl RunReport {
    /// Whether every item reached a final answer without retries running out.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        !self.interrupted && self.outstanding == 0 && self.failed_ids.is_empty()
    }
}

/// One configured run.
pub struct Pipeline {
    input: Input,
    config: PipelineConfig,
    checkpoint_args: Vec<String>,
    cancel: CancellationToken,
    scanner: Option<Arc<dyn Scanner>>,
    transfer: Option<Arc<dyn Transfer>>,
}

impl Pipeline {
    /// Creates a run over `input`. Cancelling `cancel` stops it.
    #[must_use]
    pub fn new(input: Input, config: PipelineConfig, cancel: CancellationToken) -> Self {
        let end = match &input {
            Input::Range { end, .. } => *end,
            _ => None,
        };
        let checkpoint_args = config.checkpoint_args(end);
        Self {
            input,
            config,
            checkpoint_args,
            cancel,
            scanner: None,
            transfer: None,
        }
    }

    /// Replaces the metadata-backed scanner.
    #[must_use]
    pub fn with_scanner(mut self, scanner: Arc<dyn Scanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    /// Replaces the HTTP transfer.
    #[must_use]
    pub fn with_transfer(mut self, transfer: Arc<dyn Transfer>) -> Self {
        self.transfer = Some(transfer);
        self
    }

    /// Checks the preconditions without doing any work.
    ///
    /// # Errors
    ///
    /// Returns the first failed precondition.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let config = &self.config;
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&config.concurrency) {
            return Err(StageError::InvalidConcurrency {
                value: config.concurrency,
            }
            .into());
        }
        match &self.input {
            Input::Range {
                start,
                end: Some(end),
            } => {
                if start > end {
                    return Err(PipelineError::InvalidRange {
                        start: *start,
                        end: *end,
                    });
                }
                if config.lookahead != 0 {
                    return Err(PipelineError::Conflict(
                        "--lookahead cannot be combined with --end".into(),
                    ));
                }
            }
            Input::Range { end: None, .. } => {}
            Input::Ids(ids) if ids.is_empty() => return Err(PipelineError::EmptyIdSet),
            Input::Ids(_) => {}
            Input::Items(items) => {
                if items.is_empty() {
                    return Err(PipelineError::EmptyIdSet);
                }
                if config.lookahead != 0 || config.predict_gaps {
                    return Err(PipelineError::Conflict(
                        "an item list cannot be extended or gap-predicted".into(),
                    ));
                }
            }
        }
        if self.input.is_scan() && self.scanner.is_none() && config.metadata_url.is_none() {
            return Err(PipelineError::MissingMetadataUrl);
        }
        Ok(())
    }

    /// Runs to completion or cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if a precondition fails; per-item failures
    /// are reported in the [`RunReport`] instead.
    #[instrument(skip(self), fields(output = %self.config.output_dir.display()))]
    pub async fn run(self) -> Result<RunReport, PipelineError> {
        self.validate()?;
        let Self {
            input,
            config,
            checkpoint_args,
            cancel,
            scanner,
            transfer,
        } = self;

        let index = Arc::new(FileIndex::scan(&config.output_dir));
        let stats = Arc::new(RunStats::new());
        let mut client: Option<Client> = None;
        let policy = RetryPolicy::with_max_attempts(config.max_retries);

        let transfer = match transfer {
            Some(transfer) => transfer,
            None => {
                let governor = Arc::new(ThrottleGovernor::new(
                    config.throttle_kbps,
                    config.throttle_auto,
                ));
                let http = shared_client(&mut client)?;
                Arc::new(HttpTransfer::new(http, policy.clone(), governor)) as Arc<dyn Transfer>
            }
        };

        let download_config = DownloadConfig {
            concurrency: config.concurrency,
            output_dir: config.output_dir.clone(),
            keep_unfinished: config.keep_unfinished,
            checkpoint: config.checkpoint.clone(),
            checkpoint_args,
            ..DownloadConfig::default()
        };

        let download = match input {
            Input::Items(items) => {
                let (items, prefiltered) = prefilter(items, &index, &stats);
                info!(items = items.len(), prefiltered, "downloading preloaded items");
                let download = DownloadStage::new(
                    items,
                    transfer,
                    prefiltered,
                    download_config,
                    Arc::clone(&stats),
                    index,
                    cancel.clone(),
                )?;
                download.run().await;
                download
            }
            input => {
                let scanner = match scanner {
                    Some(scanner) => scanner,
                    None => {
                        let template = config
                            .metadata_url
                            .clone()
                            .ok_or(PipelineError::MissingMetadataUrl)?;
                        let source =
                            ApiMetadataSource::new(shared_client(&mut client)?, template, policy)?;
                        let filter = TagFilter::new(&config.excluded_tags, &config.required_tags);
                        debug!(filter = %filter, quality = %config.quality, "metadata scanner ready");
                        Arc::new(MetadataScanner::new(
                            Arc::new(source),
                            Arc::new(filter),
                            Arc::clone(&index),
                            config.quality,
                        )) as Arc<dyn Scanner>
                    }
                };
                let items: Vec<WorkItem> = scan_ids(input).into_iter().map(WorkItem::new).collect();
                let scan_config = ScanConfig {
                    lookahead: config.lookahead,
                    predict_gaps: config.predict_gaps,
                    audit_gaps: config.audit_gaps,
                    gap_table: config.gap_table.clone(),
                    ..ScanConfig::default()
                };
                info!(items = items.len(), lookahead = config.lookahead, "scanning ids");

                let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
                let scan = ScanStage::new(
                    items,
                    scanner,
                    scan_config,
                    Arc::clone(&stats),
                    cancel.clone(),
                )
                .with_feedback(feedback_rx);
                let download = DownloadStage::new(
                    Vec::new(),
                    transfer,
                    0,
                    download_config,
                    Arc::clone(&stats),
                    index,
                    cancel.clone(),
                )?
                .with_scan(scan.shared(), feedback_tx);
                tokio::join!(scan.run(), download.run());
                download
            }
        };

        let done = download.take_done();
        let sidecars = if config.sidecar {
            let created = export_sidecars(&done);
            info!(created, "sidecars exported");
            created
        } else {
            0
        };

        Ok(RunReport {
            scanned: stats.scanned(),
            downloaded: stats.downloaded(),
            already_existed: stats.already_existed(),
            skipped: stats.skipped() + stats.filtered() + stats.deleted(),
            not_found: stats.not_found(),
            failed_ids: stats.failed_ids(),
            outstanding: download.workload_size(),
            sidecars,
            interrupted: cancel.is_cancelled(),
        })
    }
}

fn shared_client(slot: &mut Option<Client>) -> Result<Client, reqwest::Error> {
    if let Some(client) = slot {
        return Ok(client.clone());
    }
    let client = build_client()?;
    *slot = Some(client.clone());
    Ok(client)
}

fn scan_ids(input: Input) -> Vec<u64> {
    match input {
        Input::Range {
            start,
            end: Some(end),
        } => (start..=end).collect(),
        Input::Range { start, end: None } => vec![start],
        Input::Ids(ids) => ids,
        Input::Items(items) => items.iter().map(WorkItem::id).collect(),
    }
}

/// Drops preloaded items whose file is already present.
fn prefilter(items: Vec<WorkItem>, index: &FileIndex, stats: &RunStats) -> (Vec<WorkItem>, usize) {
    let mut kept = Vec::with_capacity(items.len());
    let mut dropped = 0;
    for mut item in items {
        let quality = item.info.quality;
        let present = match index.existing(item.id(), quality) {
            Some(ExistingFile::Exact(_)) => {
                item.add_flags(ItemFlags::EXISTED_EXACT);
                true
            }
            Some(ExistingFile::SimilarQuality { quality: found, .. }) => {
                item.add_flags(ItemFlags::EXISTED_SIMILAR_QUALITY);
                found.is_some_and(|found| quality.is_none_or(|wanted| found >= wanted))
            }
            None => false,
        };
        if present {
            debug!(item_id = item.id(), "already downloaded, not queued");
            if let Err(e) = item.advance(ItemState::Done) {
                debug!(error = %e, "preloaded item not advanced");
            }
            stats.record(&item, Outcome::AlreadyExists);
            dropped += 1;
        } else {
            kept.push(item);
        }
    }
    (kept, dropped)
}

#[derive(Debug, Deserialize)]
struct ListedItem {
    id: u64,
    link: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    quality: Option<String>,
    #[serde(default)]
    subfolder: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    duration_secs: Option<u64>,
    #[serde(default)]
    uploader: Option<String>,
}

/// Reads a preloaded item list: a JSON array of
/// `{"id", "link", "title"?, "quality"?, "subfolder"?, "tags"?, ...}`.
///
/// Unknown quality labels are ignored; subfolders are reduced to a single
/// safe path segment.
///
/// # Errors
///
/// Returns [`PipelineError::ItemListIo`] or [`PipelineError::ItemListParse`].
pub fn load_item_list(path: &Path) -> Result<Vec<WorkItem>, PipelineError> {
    let text = fs::read_to_string(path).map_err(|source| PipelineError::ItemListIo {
        path: path.to_path_buf(),
        source,
    })?;
    let listed: Vec<ListedItem> =
        serde_json::from_str(&text).map_err(|source| PipelineError::ItemListParse {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(listed
        .into_iter()
        .map(|entry| {
            let quality = entry.quality.as_deref().and_then(|q| q.parse::<Quality>().ok());
            let filename = build_filename(entry.id, entry.title.as_deref(), quality, &entry.link);
            WorkItem::preloaded(
                entry.id,
                ItemInfo {
                    title: entry.title,
                    link: Some(entry.link),
                    duration_secs: entry.duration_secs,
                    quality,
                    tags: entry.tags,
                    uploader: entry.uploader,
                    subfolder: entry
                        .subfolder
                        .as_deref()
                        .map(sanitize_filename)
                        .map(PathBuf::from),
                    filename: Some(filename),
                    ..ItemInfo::default()
                },
            )
        })
        .collect())
}
