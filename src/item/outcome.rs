//! Result of processing one work item in either stage.

use std::fmt;

/// Outcome of scanning or transferring a single item.
///
/// Both stages use the same closed set so bookkeeping can be shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Item processed successfully.
    Success,
    /// Remote resource is absent.
    NotFound,
    /// Network/IO failure budget exceeded.
    RetriesExhausted,
    /// Destination file already present locally.
    AlreadyExists,
    /// Local policy decided not to process the item.
    Skipped,
    /// Excluded by the tag/text filters.
    SkippedByFilter,
    /// Resource existed but is no longer available.
    Deleted,
    /// Server returned an empty page; transient.
    EmptyResponse,
}

impl Outcome {
    /// Returns the lowercase label used in logs and reports.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NotFound => "not_found",
            Self::RetriesExhausted => "retries_exhausted",
            Self::AlreadyExists => "already_exists",
            Self::Skipped => "skipped",
            Self::SkippedByFilter => "skipped_by_filter",
            Self::Deleted => "deleted",
            Self::EmptyResponse => "empty_response",
        }
    }

    /// Whether a scan returning this outcome should be retried in place.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::EmptyResponse)
    }

    /// Whether the outcome counts as a failure in the final report.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::RetriesExhausted)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
