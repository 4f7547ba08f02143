//! Remote metadata lookup and tag filtering.
//!
//! The scan stage needs two things per id: the remote metadata (title, tags,
//! downloadable files...) and a decision whether local filters exclude it.
//! Both sit behind traits so the scan stage can be driven by fakes in tests.
//!
//! # Overview
//!
//! - [`MetadataSource`] / [`ApiMetadataSource`] - JSON metadata endpoint
//! - [`ItemFilter`] / [`TagFilter`] - excluded/required tag predicate
//! - [`RemoteMetadata`] - parsed metadata for one id

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::RETRY_AFTER;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::download::{
    FailureType, RetryDecision, RetryPolicy, classify_http_status, parse_retry_after,
};
use crate::item::{Outcome, Quality, WorkItem};

/// Placeholder substituted with the item id in metadata URL templates.
pub const ID_PLACEHOLDER: &str = "{id}";

/// One downloadable rendition of an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFile {
    /// Quality tier of the rendition.
    pub quality: Quality,
    /// Direct link.
    pub url: String,
}

/// Metadata returned by the remote for one id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteMetadata {
    pub title: Option<String>,
    pub duration_secs: Option<u64>,
    pub tags: Vec<String>,
    pub description: Option<String>,
    pub comments: Vec<String>,
    pub uploader: Option<String>,
    pub score: Option<String>,
    pub rating: Option<String>,
    /// Available renditions. Unknown quality labels are dropped.
    pub files: Vec<MediaFile>,
}

impl RemoteMetadata {
    /// Picks the rendition to download for a quality ceiling.
    #[must_use]
    pub fn select_file(&self, ceiling: Quality) -> Option<&MediaFile> {
        let offered: Vec<Quality> = self.files.iter().map(|f| f.quality).collect();
        let chosen = Quality::select(&offered, ceiling)?;
        self.files.iter().find(|f| f.quality == chosen)
    }
}

/// Wire shape of the metadata endpoint.
#[derive(Debug, Deserialize)]
struct MetadataResponse {
    #[serde(default)]
    deleted: bool,
    title: Option<String>,
    duration: Option<u64>,
    #[serde(default)]
    tags: Vec<String>,
    description: Option<String>,
    #[serde(default)]
    comments: Vec<String>,
    uploader: Option<String>,
    score: Option<serde_json::Value>,
    rating: Option<serde_json::Value>,
    #[serde(default)]
    files: Vec<FileResponse>,
}

#[derive(Debug, Deserialize)]
struct FileResponse {
    quality: String,
    url: String,
}

fn value_to_string(value: Option<serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

impl From<MetadataResponse> for RemoteMetadata {
    fn from(raw: MetadataResponse) -> Self {
        let files = raw
            .files
            .into_iter()
            .filter_map(|f| {
                f.quality.parse::<Quality>().ok().map(|quality| MediaFile {
                    quality,
                    url: f.url,
                })
            })
            .collect();
        Self {
            title: raw.title,
            duration_secs: raw.duration,
            tags: raw.tags,
            description: raw.description,
            comments: raw.comments,
            uploader: raw.uploader,
            score: value_to_string(raw.score),
            rating: value_to_string(raw.rating),
            files,
        }
    }
}

/// Errors raised while fetching metadata.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The URL template cannot produce a valid URL.
    #[error("invalid metadata URL template '{template}': {reason}")]
    InvalidTemplate {
        /// The template as configured.
        template: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Network-level failure.
    #[error("network error fetching {url}: {source}")]
    Network {
        /// Requested URL.
        url: String,
        /// Underlying error.
        #[source]
        source: reqwest::Error,
    },

    /// Non-success HTTP status other than 404/410.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// Requested URL.
        url: String,
        /// Status code.
        status: u16,
        /// Raw Retry-After header, if any.
        retry_after: Option<String>,
    },

    /// The body was not valid metadata JSON.
    #[error("malformed metadata from {url}: {source}")]
    Parse {
        /// Requested URL.
        url: String,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

impl MetadataError {
    fn failure_type(&self) -> FailureType {
        match self {
            Self::Network { source, .. } if source.is_builder() => FailureType::Permanent,
            Self::Network { .. } => FailureType::Transient,
            Self::HttpStatus { status, .. } => classify_http_status(*status),
            Self::InvalidTemplate { .. } | Self::Parse { .. } => FailureType::Permanent,
        }
    }
}

/// Source of remote metadata.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Fetches metadata for `id`.
    ///
    /// Terminal conditions are reported as the matching [`Outcome`]
    /// (`NotFound`, `Deleted`, `EmptyResponse`, `RetriesExhausted`, `Skipped`).
    async fn fetch(&self, id: u64) -> Result<RemoteMetadata, Outcome>;
}

/// Metadata source backed by a JSON endpoint.
///
/// The endpoint is addressed by a URL template containing `{id}`. Status
/// mapping: 404 is `NotFound`, 410 or `"deleted": true` is `Deleted`, an
/// empty body is `EmptyResponse`; transient failures are retried under a
/// [`RetryPolicy`] and become `RetriesExhausted` once the budget is spent.
#[derive(Debug, Clone)]
pub struct ApiMetadataSource {
    client: Client,
    template: String,
    policy: RetryPolicy,
}

enum FetchError {
    Terminal(Outcome),
    Failed(MetadataError),
}

impl ApiMetadataSource {
    /// Creates a source for `template`.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::InvalidTemplate`] if the template lacks the
    /// `{id}` placeholder or does not form a valid http(s) URL.
    pub fn new(
        client: Client,
        template: impl Into<String>,
        policy: RetryPolicy,
    ) -> Result<Self, MetadataError> {
        let template = template.into();
        validate_template(&template)?;
        Ok(Self {
            client,
            template,
            policy,
        })
    }

    /// URL for `id`.
    #[must_use]
    pub fn url_for(&self, id: u64) -> String {
        self.template.replace(ID_PLACEHOLDER, &id.to_string())
    }

    async fn fetch_once(&self, url: &str) -> Result<RemoteMetadata, FetchError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            FetchError::Failed(MetadataError::Network {
                url: url.to_string(),
                source: e,
            })
        })?;

        let status = response.status().as_u16();
        match status {
            404 => return Err(FetchError::Terminal(Outcome::NotFound)),
            410 => return Err(FetchError::Terminal(Outcome::Deleted)),
            s if !(200..300).contains(&s) => {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .map(ToString::to_string);
                return Err(FetchError::Failed(MetadataError::HttpStatus {
                    url: url.to_string(),
                    status,
                    retry_after,
                }));
            }
            _ => {}
        }

        let body = response.bytes().await.map_err(|e| {
            FetchError::Failed(MetadataError::Network {
                url: url.to_string(),
                source: e,
            })
        })?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(FetchError::Terminal(Outcome::EmptyResponse));
        }

        let raw: MetadataResponse = serde_json::from_slice(&body).map_err(|e| {
            FetchError::Failed(MetadataError::Parse {
                url: url.to_string(),
                source: e,
            })
        })?;
        if raw.deleted {
            return Err(FetchError::Terminal(Outcome::Deleted));
        }
        Ok(raw.into())
    }
}

#[async_trait]
impl MetadataSource for ApiMetadataSource {
    #[instrument(skip(self))]
    async fn fetch(&self, id: u64) -> Result<RemoteMetadata, Outcome> {
        let url = self.url_for(id);
        let mut attempt = 1;
        loop {
            let error = match self.fetch_once(&url).await {
                Ok(metadata) => return Ok(metadata),
                Err(FetchError::Terminal(outcome)) => {
                    debug!(id, outcome = %outcome, "metadata terminal outcome");
                    return Err(outcome);
                }
                Err(FetchError::Failed(error)) => error,
            };

            let failure = error.failure_type();
            match self.policy.should_retry(failure, attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    let delay = match &error {
                        MetadataError::HttpStatus {
                            retry_after: Some(raw),
                            ..
                        } => parse_retry_after(raw).map_or(delay, |hint| hint.max(delay)),
                        _ => delay,
                    };
                    warn!(id, attempt, error = %error, delay_ms = delay.as_millis(), "metadata fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt = next;
                }
                RetryDecision::DoNotRetry { reason } => {
                    warn!(id, error = %error, reason = %reason, "metadata fetch failed");
                    return Err(if failure == FailureType::Permanent {
                        Outcome::Skipped
                    } else {
                        Outcome::RetriesExhausted
                    });
                }
            }
        }
    }
}

fn validate_template(template: &str) -> Result<(), MetadataError> {
    let invalid = |reason: &str| MetadataError::InvalidTemplate {
        template: template.to_string(),
        reason: reason.to_string(),
    };
    if !template.contains(ID_PLACEHOLDER) {
        return Err(invalid("missing {id} placeholder"));
    }
    let sample = template.replace(ID_PLACEHOLDER, "0");
    let parsed = Url::parse(&sample).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    Ok(())
}

/// Local predicate deciding whether a scanned item is excluded.
pub trait ItemFilter: Send + Sync {
    /// Returns `true` if the item must not be downloaded.
    fn is_excluded(&self, item: &WorkItem, raw_tags: &[String]) -> bool;
}

/// Excluded/required tag filter. Tag comparison is case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct TagFilter {
    excluded: HashSet<String>,
    required: HashSet<String>,
}

impl TagFilter {
    /// Creates a filter from excluded and required tag lists.
    #[must_use]
    pub fn new<I, J, S, T>(excluded: I, required: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: AsRef<str>,
        T: AsRef<str>,
    {
        let normalize = |s: &str| s.trim().to_lowercase();
        Self {
            excluded: excluded
                .into_iter()
                .map(|s| normalize(s.as_ref()))
                .filter(|s| !s.is_empty())
                .collect(),
            required: required
                .into_iter()
                .map(|s| normalize(s.as_ref()))
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    /// Whether the filter excludes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.excluded.is_empty() && self.required.is_empty()
    }
}

impl ItemFilter for TagFilter {
    fn is_excluded(&self, item: &WorkItem, raw_tags: &[String]) -> bool {
        let tags: HashSet<String> = raw_tags.iter().map(|t| t.trim().to_lowercase()).collect();
        if let Some(hit) = self.excluded.iter().find(|t| tags.contains(*t)) {
            debug!(item_id = item.id(), tag = %hit, "excluded tag present");
            return true;
        }
        if let Some(missing) = self.required.iter().find(|t| !tags.contains(*t)) {
            debug!(item_id = item.id(), tag = %missing, "required tag missing");
            return true;
        }
        false
    }
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut excluded: Vec<&str> = self.excluded.iter().map(String::as_str).collect();
        excluded.sort_unstable();
        let mut required: Vec<&str> = self.required.iter().map(String::as_str).collect();
        required.sort_unstable();
        write!(
            f,
            "exclude=[{}] require=[{}]",
            excluded.join(","),
            required.join(",")
        )
    }
}
