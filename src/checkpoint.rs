//! Resume checkpoints.
//!
//! A checkpoint is a plain-text file holding one command-line token per
//! line. Replaying those tokens as arguments resumes the interrupted run:
//!
//! ```text
//! (id=5~id=9~id=12)
//! --output
//! /data/media
//! --throttle
//! 64
//! ```
//!
//! When exactly one id is outstanding the id set is written as
//! `--start N --end N` instead, so the replayed range covers that id only.
//! With `--lookahead` the `--end` bound is left out and the scan continues
//! past the id.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, instrument};

/// Full id-set token: `(id=5~id=9~id=12)`.
#[allow(clippy::expect_used)]
static ID_SET_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\(id=\d+(?:~id=\d+)*\)$").expect("id-set regex is valid") // Static pattern, safe to panic
});

/// One `id=N` element inside an id-set token.
#[allow(clippy::expect_used)]
static ID_ELEMENT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"id=(\d+)").expect("id element regex is valid") // Static pattern, safe to panic
});

/// Errors reading or writing checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The file could not be read or written.
    #[error("checkpoint IO error at {path}: {source}")]
    Io {
        /// Checkpoint path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The checkpoint holds no tokens.
    #[error("checkpoint is empty")]
    Empty,

    /// The first token is neither `--start` nor an id set.
    #[error("invalid checkpoint id token: {0}")]
    InvalidIdToken(String),

    /// An id does not fit in 64 bits.
    #[error("invalid id in checkpoint: {0}")]
    InvalidId(String),
}

/// Outstanding work plus the options needed to replay it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    ids: Vec<u64>,
    args: Vec<String>,
}

impl Checkpoint {
    /// Creates a checkpoint. Ids are sorted and deduplicated.
    #[must_use]
    pub fn new(ids: impl IntoIterator<Item = u64>, args: Vec<String>) -> Self {
        let mut ids: Vec<u64> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        Self { ids, args }
    }

    /// Outstanding ids, ascending.
    #[must_use]
    pub fn ids(&self) -> &[u64] {
        &self.ids
    }

    /// Replayed option tokens, in write order.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Whether nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Command-line tokens: id tokens first, then the options.
    #[must_use]
    pub fn tokens(&self) -> Vec<String> {
        let [single] = self.ids.as_slice() else {
            let mut tokens = vec![format_id_set(&self.ids)];
            tokens.extend(self.args.iter().cloned());
            return tokens;
        };
        let mut tokens = vec!["--start".to_string(), single.to_string()];
        if !self.args.iter().any(|a| a == "--lookahead") {
            tokens.extend(["--end".to_string(), single.to_string()]);
        }
        let mut args = self.args.iter();
        while let Some(arg) = args.next() {
            if arg == "--end" {
                args.next();
                continue;
            }
            tokens.push(arg.clone());
        }
        tokens
    }

    /// Renders the file contents.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for token in self.tokens() {
            let _ = writeln!(out, "{token}");
        }
        out
    }

    /// Parses file contents.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] if the contents hold no tokens or the
    /// leading id tokens are malformed.
    pub fn parse(text: &str) -> Result<Self, CheckpointError> {
        let mut tokens = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string);
        let first = tokens.next().ok_or(CheckpointError::Empty)?;
        let ids = if first == "--start" {
            let value = tokens
                .next()
                .ok_or_else(|| CheckpointError::InvalidIdToken(first.clone()))?;
            vec![
                value
                    .parse::<u64>()
                    .map_err(|_| CheckpointError::InvalidId(value.clone()))?,
            ]
        } else {
            parse_id_set(&first)?
        };
        Ok(Self::new(ids, tokens.collect()))
    }

    /// Writes the checkpoint atomically (temp file then rename).
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Io`] on any filesystem failure.
    #[instrument(skip(self), fields(path = %path.display(), ids = self.ids.len()))]
    pub async fn write(&self, path: &Path) -> Result<(), CheckpointError> {
        let io_err = |source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, self.render()).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
        debug!("checkpoint written");
        Ok(())
    }

    /// Reads and parses a checkpoint file.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] if the file cannot be read or parsed.
    pub fn read(path: &Path) -> Result<Self, CheckpointError> {
        let text = std::fs::read_to_string(path).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Deletes a checkpoint file; a missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Io`] on other filesystem failures.
    pub async fn remove(path: &Path) -> Result<(), CheckpointError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CheckpointError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

/// Formats ids as an id-set token: `(id=5~id=9~id=12)`.
#[must_use]
pub fn format_id_set(ids: &[u64]) -> String {
    let inner: Vec<String> = ids.iter().map(|id| format!("id={id}")).collect();
    format!("({})", inner.join("~"))
}

/// Parses an id-set token.
///
/// # Errors
///
/// Returns [`CheckpointError::InvalidIdToken`] if the token does not match
/// `(id=N~id=M...)` and [`CheckpointError::InvalidId`] if an id overflows.
pub fn parse_id_set(token: &str) -> Result<Vec<u64>, CheckpointError> {
    let token = token.trim();
    if !ID_SET_PATTERN.is_match(token) {
        return Err(CheckpointError::InvalidIdToken(token.to_string()));
    }
    ID_ELEMENT_PATTERN
        .captures_iter(token)
        .map(|caps| {
            let raw = &caps[1];
            raw.parse::<u64>()
                .map_err(|_| CheckpointError::InvalidId(raw.to_string()))
        })
        .collect()
}

/// Whether `token` looks like an id-set token.
#[must_use]
pub fn is_id_set(token: &str) -> bool {
    ID_SET_PATTERN.is_match(token.trim())
}
