//! Index of media files already present in the destination directory.
//!
//! Built once before the pipeline starts by walking the output directory
//! (and one level of subfolders). Lookups are lock-free reads on a
//! [`DashMap`]; consumers register files they create and forget files they
//! delete so later items in the same run see an accurate view.

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use tracing::{debug, instrument, warn};

use crate::download::parse_filename;
use crate::item::Quality;

/// A file on disk that matches a requested id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExistingFile {
    /// Same id, same quality.
    Exact(PathBuf),
    /// Same id, another (or unknown) quality.
    SimilarQuality {
        /// Path of the file found.
        path: PathBuf,
        /// Its quality, when the name carries one.
        quality: Option<Quality>,
    },
}

impl ExistingFile {
    /// Path of the matched file.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Exact(path) | Self::SimilarQuality { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone)]
struct IndexedFile {
    path: PathBuf,
    quality: Option<Quality>,
}

/// Destination-folder lookup cache keyed by item id.
#[derive(Debug, Default)]
pub struct FileIndex {
    files: DashMap<u64, Vec<IndexedFile>>,
}

impl FileIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the index from `dir` and its immediate subdirectories.
    ///
    /// A missing directory yields an empty index. Unreadable entries are
    /// skipped with a warning.
    #[instrument(skip_all, fields(dir = %dir.display()))]
    pub fn scan(dir: &Path) -> Self {
        let index = Self::new();
        index.scan_dir(dir, true);
        debug!(ids = index.files.len(), "destination index built");
        index
    }

    fn scan_dir(&self, dir: &Path, descend: bool) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "cannot read directory");
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                if descend {
                    self.scan_dir(&path, false);
                }
                continue;
            }
            if file_type.is_file() {
                self.insert(&path);
            }
        }
    }

    /// Registers a file. Names that do not follow the download naming
    /// scheme are ignored.
    pub fn insert(&self, path: &Path) {
        let Some((id, quality)) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_filename)
        else {
            return;
        };
        let mut files = self.files.entry(id).or_default();
        if !files.iter().any(|f| f.path == path) {
            files.push(IndexedFile {
                path: path.to_path_buf(),
                quality,
            });
        }
    }

    /// Forgets a file.
    pub fn remove(&self, path: &Path) {
        let Some((id, _)) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_filename)
        else {
            return;
        };
        let now_empty = self.files.get_mut(&id).is_some_and(|mut files| {
            files.retain(|f| f.path != path);
            files.is_empty()
        });
        if now_empty {
            self.files.remove_if(&id, |_, files| files.is_empty());
        }
    }

    /// Looks up a file for `id`, preferring an exact quality match.
    ///
    /// Without a requested quality any file for the id counts as exact.
    #[must_use]
    pub fn existing(&self, id: u64, quality: Option<Quality>) -> Option<ExistingFile> {
        let files = self.files.get(&id)?;
        if let Some(exact) = files
            .iter()
            .find(|f| quality.is_none() || f.quality == quality)
        {
            return Some(ExistingFile::Exact(exact.path.clone()));
        }
        // best of the other qualities
        files
            .iter()
            .max_by_key(|f| f.quality)
            .map(|f| ExistingFile::SimilarQuality {
                path: f.path.clone(),
                quality: f.quality,
            })
    }

    /// Whether any file for `id` is indexed.
    #[must_use]
    pub fn contains(&self, id: u64) -> bool {
        self.files.contains_key(&id)
    }

    /// Number of distinct ids indexed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
