//! Per-item scan: fetch metadata, apply filters, check for existing files.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::download::build_filename;
use crate::index::{ExistingFile, FileIndex};
use crate::item::{ItemFlags, ItemInfo, Outcome, Quality, WorkItem};
use crate::metadata::{ItemFilter, MetadataSource};

/// Inspects one item and decides whether it is eligible for transfer.
///
/// Implementations fill in the item's [`ItemInfo`] and flags. Only
/// [`Outcome::Success`] sends the item on to the download stage.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Scans `item`.
    async fn scan(&self, item: &mut WorkItem) -> Outcome;
}

/// Default scanner composed from a metadata source, a filter and the
/// destination index.
pub struct MetadataScanner {
    source: Arc<dyn MetadataSource>,
    filter: Arc<dyn ItemFilter>,
    index: Arc<FileIndex>,
    quality: Quality,
}

impl MetadataScanner {
    /// Creates a scanner selecting the best rendition up to `quality`.
    #[must_use]
    pub fn new(
        source: Arc<dyn MetadataSource>,
        filter: Arc<dyn ItemFilter>,
        index: Arc<FileIndex>,
        quality: Quality,
    ) -> Self {
        Self {
            source,
            filter,
            index,
            quality,
        }
    }
}

#[async_trait]
impl Scanner for MetadataScanner {
    #[instrument(skip_all, fields(item_id = item.id()))]
    async fn scan(&self, item: &mut WorkItem) -> Outcome {
        let metadata = match self.source.fetch(item.id()).await {
            Ok(metadata) => metadata,
            Err(outcome) => return outcome,
        };

        let chosen = metadata.select_file(self.quality).cloned();
        item.info = ItemInfo {
            title: metadata.title.clone(),
            link: chosen.as_ref().map(|f| f.url.clone()),
            duration_secs: metadata.duration_secs,
            quality: chosen.as_ref().map(|f| f.quality),
            tags: metadata.tags.clone(),
            description: metadata.description.clone(),
            comments: metadata.comments.clone(),
            uploader: metadata.uploader.clone(),
            score: metadata.score.clone(),
            rating: metadata.rating.clone(),
            subfolder: item.info.subfolder.take(),
            filename: None,
        };

        if self.filter.is_excluded(item, &metadata.tags) {
            return Outcome::SkippedByFilter;
        }
        let Some(file) = chosen else {
            debug!("no downloadable rendition");
            return Outcome::Skipped;
        };
        item.info.filename = Some(build_filename(
            item.id(),
            item.info.title.as_deref(),
            Some(file.quality),
            &file.url,
        ));

        match self.index.existing(item.id(), Some(file.quality)) {
            Some(ExistingFile::Exact(path)) => {
                debug!(path = %path.display(), "exact file already present");
                item.add_flags(ItemFlags::EXISTED_EXACT);
                Outcome::AlreadyExists
            }
            Some(ExistingFile::SimilarQuality { path, quality }) => {
                item.add_flags(ItemFlags::EXISTED_SIMILAR_QUALITY);
                if quality.is_some_and(|q| q >= file.quality) {
                    debug!(path = %path.display(), "equal or better quality already present");
                    Outcome::AlreadyExists
                } else {
                    debug!(path = %path.display(), "lower quality present, upgrading");
                    Outcome::Success
                }
            }
            None => Outcome::Success,
        }
    }
}
