//! JSON sidecar files for downloaded media.
//!
//! Each completed item gets `<file>.json` next to the media file, holding the
//! metadata gathered during the scan. Existing sidecars are never
//! overwritten, so re-running an export is harmless.

use std::fs;
use std::io::{BufWriter, ErrorKind};
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::item::WorkItem;

/// Errors produced by sidecar generation.
#[derive(Debug, Error)]
pub enum SidecarError {
    /// I/O error writing the sidecar file to disk.
    #[error("I/O error writing sidecar: {0}")]
    Io(#[from] std::io::Error),
    /// JSON serialization error (shouldn't occur for well-formed structs).
    #[error("JSON serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Sidecar document.
#[derive(Debug, Serialize)]
struct Sidecar<'a> {
    id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    link: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quality: Option<&'static str>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    tags: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    uploader: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    score: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rating: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    comments: &'a [String],
}

impl<'a> From<&'a WorkItem> for Sidecar<'a> {
    fn from(item: &'a WorkItem) -> Self {
        let info = &item.info;
        Self {
            id: item.id(),
            title: info.title.as_deref(),
            link: info.link.as_deref(),
            duration_secs: info.duration_secs,
            quality: info.quality.map(|q| q.as_str()),
            tags: &info.tags,
            uploader: info.uploader.as_deref(),
            score: info.score.as_deref(),
            rating: info.rating.as_deref(),
            description: info.description.as_deref(),
            comments: &info.comments,
        }
    }
}

/// Writes the sidecar for `item`, whose media file is at `media_path`.
///
/// Returns `None` (with a `debug!` log) if the media file is missing or the
/// sidecar already exists.
///
/// # Errors
///
/// Returns [`SidecarError`] on I/O or serialization failure.
#[instrument(skip(item), fields(item_id = item.id(), path = %media_path.display()))]
pub fn write_sidecar(item: &WorkItem, media_path: &Path) -> Result<Option<PathBuf>, SidecarError> {
    if !media_path.exists() {
        debug!("media file missing, skipping sidecar");
        return Ok(None);
    }
    let sidecar_path = sidecar_path(media_path);

    let file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&sidecar_path)
    {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            debug!(path = %sidecar_path.display(), "sidecar already exists, skipping");
            return Ok(None);
        }
        Err(err) => return Err(err.into()),
    };
    let write_result = {
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, &Sidecar::from(item))
    };
    if let Err(err) = write_result {
        // a half-written sidecar would block the next export
        let _ = fs::remove_file(&sidecar_path);
        return Err(err.into());
    }

    debug!(path = %sidecar_path.display(), "sidecar created");
    Ok(Some(sidecar_path))
}

/// Writes sidecars for every item with a known destination. Failures are
/// logged and counted, never fatal.
///
/// Returns the number of sidecars created.
pub fn export_sidecars<'a>(items: impl IntoIterator<Item = &'a WorkItem>) -> usize {
    let mut created = 0;
    for item in items {
        let Some(path) = item.tracker().destination() else {
            continue;
        };
        match write_sidecar(item, &path) {
            Ok(Some(_)) => created += 1,
            Ok(None) => {}
            Err(e) => warn!(item_id = item.id(), error = %e, "sidecar export failed"),
        }
    }
    created
}

/// `<file>.json` next to the media file: `7_clip_720p.mp4` becomes
/// `7_clip_720p.mp4.json`.
#[must_use]
pub fn sidecar_path(media_path: &Path) -> PathBuf {
    let mut name = media_path.as_os_str().to_os_string();
    name.push(".json");
    PathBuf::from(name)
}
