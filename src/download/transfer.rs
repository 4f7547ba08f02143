//! Transfer seam between the download stage and the network.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::index::FileIndex;
use crate::item::{Outcome, WorkItem};

/// Moves one scanned item's bytes to disk.
///
/// Implementations own their retry loop: the returned [`Outcome`] is final
/// for the item. On success the file must be at
/// [`WorkItem::destination_in`] for the context's output directory.
#[async_trait]
pub trait Transfer: Send + Sync {
    /// Transfers `item`.
    async fn transfer(&self, item: &mut WorkItem, ctx: &TransferContext) -> Outcome;
}

/// Run-wide state a transfer reads and updates.
#[derive(Debug, Clone)]
pub struct TransferContext {
    /// Root directory for media files.
    pub output_dir: PathBuf,
    /// Items currently writing bytes.
    pub writing: Arc<WritingSet>,
    /// Destination index, updated when a file lands.
    pub index: Arc<FileIndex>,
    /// Run cancellation.
    pub cancel: CancellationToken,
}

impl TransferContext {
    /// Creates a context with an empty writing set.
    #[must_use]
    pub fn new(output_dir: PathBuf, index: Arc<FileIndex>, cancel: CancellationToken) -> Self {
        Self {
            output_dir,
            writing: Arc::new(WritingSet::default()),
            index,
            cancel,
        }
    }
}

/// Ids of items whose response body is being written.
#[derive(Debug, Default)]
pub struct WritingSet {
    ids: Mutex<HashSet<u64>>,
}

impl WritingSet {
    fn lock(&self) -> MutexGuard<'_, HashSet<u64>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `id` as writing until the guard drops.
    #[must_use]
    pub fn enter(&self, id: u64) -> WritingGuard<'_> {
        self.lock().insert(id);
        WritingGuard { set: self, id }
    }

    /// Number of writing items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is writing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Whether `id` is writing.
    #[must_use]
    pub fn contains(&self, id: u64) -> bool {
        self.lock().contains(&id)
    }
}

/// Removes its id from the [`WritingSet`] on drop.
#[derive(Debug)]
pub struct WritingGuard<'a> {
    set: &'a WritingSet,
    id: u64,
}

impl Drop for WritingGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}
