//! HTTP transfer with range resume, retry and throttle detection.
//!
//! Bytes land in `<destination>.part` and the file is renamed into place
//! once the body is complete. A retry (or a later run) resumes the partial
//! file with a `Range` request; a server that ignores the range gets the
//! file rewritten from the start.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_LENGTH, RANGE, RETRY_AFTER};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use super::error::DownloadError;
use super::retry::{FailureType, RetryDecision, RetryPolicy, classify_error, parse_retry_after};
use super::throttle::{DEFAULT_CHECK_INTERVAL, ThrottleDetector, ThrottleGovernor};
use super::transfer::{Transfer, TransferContext};
use crate::item::{ItemFlags, ItemState, Outcome, WorkItem};
use crate::user_agent;

/// Suffix of in-progress files.
pub const PART_SUFFIX: &str = ".part";

/// Builds the shared HTTP client.
///
/// Uses a read timeout rather than a total timeout so long transfers are
/// not cut off while bytes keep flowing.
///
/// # Errors
///
/// Returns the reqwest error if the TLS backend cannot be initialized.
pub fn build_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .read_timeout(Duration::from_secs(READ_TIMEOUT_SECS))
        .gzip(true)
        .cookie_store(true)
        .user_agent(user_agent::default_user_agent())
        .build()
}

/// Path of the in-progress file for `destination`.
#[must_use]
pub fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

/// Why a single attempt stopped.
enum AttemptError {
    /// The server gave a final answer for the item.
    Terminal(Outcome),
    /// The attempt failed and may be retried.
    Failed(DownloadError),
    /// The abort token fired (throttle detector or run cancellation).
    Aborted,
}

/// Default [`Transfer`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTransfer {
    client: Client,
    policy: RetryPolicy,
    governor: Arc<ThrottleGovernor>,
    check_interval: Duration,
}

impl HttpTransfer {
    /// Creates a transfer using `client` and `policy`, watched by detectors
    /// sharing `governor`.
    #[must_use]
    pub fn new(client: Client, policy: RetryPolicy, governor: Arc<ThrottleGovernor>) -> Self {
        Self {
            client,
            policy,
            governor,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    /// Overrides the throttle check cadence.
    #[must_use]
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    #[allow(clippy::too_many_lines)]
    async fn attempt(
        &self,
        item: &mut WorkItem,
        url: &str,
        part: &Path,
        abort: &CancellationToken,
        detector: Option<&ThrottleDetector>,
        ctx: &TransferContext,
    ) -> Result<(), AttemptError> {
        let existing = tokio::fs::metadata(part).await.map_or(0, |m| m.len());
        let tracker = Arc::clone(item.tracker());
        tracker.set_written(existing);
        tracker.mark_started();

        let mut request = self.client.get(url);
        if existing > 0 {
            request = request.header(RANGE, format!("bytes={existing}-"));
        }
        let response = tokio::select! {
            biased;
            () = abort.cancelled() => return Err(AttemptError::Aborted),
            response = request.send() => response.map_err(|e| {
                AttemptError::Failed(if e.is_timeout() {
                    DownloadError::timeout(url)
                } else {
                    DownloadError::network(url, e)
                })
            })?,
        };

        let status = response.status().as_u16();
        match status {
            404 => return Err(AttemptError::Terminal(Outcome::NotFound)),
            410 => return Err(AttemptError::Terminal(Outcome::Deleted)),
            416 if existing > 0 => {
                // stale offset: start over on the next attempt
                debug!(path = %part.display(), existing, "range not satisfiable, discarding partial file");
                if let Err(e) = discard_part(part).await {
                    // the next attempt would send the same range
                    warn!(error = %DownloadError::io(part, e), "cannot discard partial file");
                    return Err(AttemptError::Terminal(Outcome::RetriesExhausted));
                }
                return Err(AttemptError::Failed(DownloadError::http_status(url, status)));
            }
            s if !(200..300).contains(&s) => {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .map(ToString::to_string);
                return Err(AttemptError::Failed(
                    DownloadError::http_status_with_retry_after(url, status, retry_after),
                ));
            }
            _ => {}
        }

        let append = existing > 0 && status == 206;
        if existing > 0 && !append {
            debug!(path = %part.display(), "server ignored range, restarting from zero");
            tracker.set_written(0);
        }
        let base = if append { existing } else { 0 };
        let expected = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|remaining| base.saturating_add(remaining));
        if let Some(total) = expected {
            tracker.set_expected(total);
        }

        let file = open_part(part, append)
            .await
            .map_err(|e| AttemptError::Failed(DownloadError::io(part, e)))?;
        tracker.set_destination(part);

        advance(item, ItemState::Writing);
        let _writing = ctx.writing.enter(item.id());
        if let Some(detector) = detector {
            detector.attach(abort.clone(), part, base);
        }

        let mut writer = BufWriter::new(file);
        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                biased;
                () = abort.cancelled() => {
                    let _ = writer.flush().await;
                    return Err(AttemptError::Aborted);
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| AttemptError::Failed(DownloadError::network(url, e)))?;
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| AttemptError::Failed(DownloadError::io(part, e)))?;
            tracker.add_written(chunk.len() as u64);
        }
        writer
            .flush()
            .await
            .map_err(|e| AttemptError::Failed(DownloadError::io(part, e)))?;

        let written = tracker.written();
        if let Some(total) = expected
            && written != total
        {
            return Err(AttemptError::Failed(DownloadError::truncated(url, total, written)));
        }
        Ok(())
    }
}

#[async_trait]
impl Transfer for HttpTransfer {
    #[instrument(skip_all, fields(item_id = item.id()))]
    async fn transfer(&self, item: &mut WorkItem, ctx: &TransferContext) -> Outcome {
        let Some(url) = item.info.link.clone() else {
            warn!("no direct link, skipping");
            return Outcome::Skipped;
        };
        if Url::parse(&url).is_err() {
            warn!(error = %DownloadError::invalid_url(&url), "skipping");
            return Outcome::Skipped;
        }
        let Some(destination) = item.destination_in(&ctx.output_dir) else {
            warn!("no destination filename, skipping");
            return Outcome::Skipped;
        };
        if let Some(parent) = destination.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            warn!(error = %DownloadError::io(parent, e), "cannot create destination directory");
            return Outcome::RetriesExhausted;
        }

        let part = part_path(&destination);
        if !tokio::fs::try_exists(&part).await.unwrap_or(false) {
            item.add_flags(ItemFlags::CREATED_THIS_RUN);
        }
        let detector = self
            .governor
            .is_enabled()
            .then(|| ThrottleDetector::new(Arc::clone(&self.governor), self.check_interval));

        let mut attempt = 1;
        loop {
            let abort = ctx.cancel.child_token();
            let result = self
                .attempt(item, &url, &part, &abort, detector.as_ref(), ctx)
                .await;
            let tripped = detector.as_ref().and_then(ThrottleDetector::detach);

            let error = match result {
                Ok(()) => return finish(item, &part, &destination, ctx).await,
                Err(AttemptError::Terminal(outcome)) => {
                    debug!(outcome = %outcome, "terminal response");
                    return outcome;
                }
                Err(AttemptError::Failed(error)) => error,
                Err(AttemptError::Aborted) if ctx.cancel.is_cancelled() => {
                    DownloadError::cancelled(&url)
                }
                Err(AttemptError::Aborted) => DownloadError::throttled(&url, tripped.unwrap_or(0.0)),
            };

            let failure = classify_error(&error);
            match self.policy.should_retry(failure, attempt) {
                RetryDecision::Retry { delay, attempt: next } => {
                    let delay = match (&error, failure) {
                        (
                            DownloadError::HttpStatus {
                                retry_after: Some(raw),
                                ..
                            },
                            FailureType::RateLimited,
                        ) => parse_retry_after(raw).unwrap_or(delay),
                        _ => delay,
                    };
                    info!(
                        attempt = next,
                        max_attempts = self.policy.max_attempts(),
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "retrying transfer"
                    );
                    if item.state() == ItemState::Writing {
                        advance(item, ItemState::Downloading);
                    }
                    tokio::select! {
                        biased;
                        () = ctx.cancel.cancelled() => return Outcome::RetriesExhausted,
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt = next;
                }
                RetryDecision::DoNotRetry { reason } => {
                    warn!(error = %error, %reason, attempts = attempt, "transfer failed");
                    return Outcome::RetriesExhausted;
                }
            }
        }
    }
}

/// Removes a partial file; a file that is already gone is fine.
async fn discard_part(part: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(part).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn open_part(part: &Path, append: bool) -> std::io::Result<File> {
    if append {
        OpenOptions::new().append(true).open(part).await
    } else {
        File::create(part).await
    }
}

async fn finish(
    item: &mut WorkItem,
    part: &Path,
    destination: &Path,
    ctx: &TransferContext,
) -> Outcome {
    if let Err(e) = tokio::fs::rename(part, destination).await {
        warn!(error = %DownloadError::io(destination, e), "cannot move finished file into place");
        return Outcome::RetriesExhausted;
    }
    item.tracker().set_destination(destination);
    ctx.index.insert(destination);
    info!(
        path = %destination.display(),
        bytes = item.tracker().written(),
        "transfer complete"
    );
    Outcome::Success
}

fn advance(item: &mut WorkItem, next: ItemState) {
    if let Err(e) = item.advance(next) {
        debug!(error = %e, "state unchanged");
    }
}
