//! Error types for the download module.
//!
//! Every variant carries the URL or path it concerns. These errors never
//! leave a single transfer: [`HttpTransfer`](super::HttpTransfer) classifies
//! them into a retry or a terminal [`Outcome`](crate::item::Outcome).

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during one transfer attempt.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present (for 429 responses).
        retry_after: Option<String>,
    },

    /// File system error during download (create file, write, etc.)
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The item has no usable direct link.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The throttle detector aborted the connection for being too slow.
    #[error("transfer of {url} throttled at {kbps:.1} KB/s")]
    Throttled {
        /// The URL whose connection was aborted.
        url: String,
        /// Measured speed over the last check interval.
        kbps: f64,
    },

    /// The body ended before the announced length was reached.
    #[error("transfer of {url} ended at {actual} of {expected} bytes")]
    Truncated {
        /// The URL being transferred.
        url: String,
        /// Announced total size.
        expected: u64,
        /// Size on disk when the body ended.
        actual: u64,
    },

    /// The run was cancelled while the transfer was in flight.
    #[error("transfer of {url} cancelled")]
    Cancelled {
        /// The URL being transferred.
        url: String,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a throttled error.
    pub fn throttled(url: impl Into<String>, kbps: f64) -> Self {
        Self::Throttled {
            url: url.into(),
            kbps,
        }
    }

    /// Creates a truncated-body error.
    pub fn truncated(url: impl Into<String>, expected: u64, actual: u64) -> Self {
        Self::Truncated {
            url: url.into(),
            expected,
            actual,
        }
    }

    /// Creates a cancelled error.
    pub fn cancelled(url: impl Into<String>) -> Self {
        Self::Cancelled { url: url.into() }
    }
}
