//! Work item lifecycle states and transition validation.

use std::fmt;

use thiserror::Error;

/// Lifecycle state of a [`WorkItem`](super::WorkItem).
///
/// States advance strictly forward through the scan and download stages.
/// The only backward moves are retries (an in-place scan retry, or a
/// transfer attempt that is retried), and [`ItemState::Failed`] is a
/// terminal state reachable from any in-flight state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ItemState {
    /// Created by the driver, not yet handed to any stage.
    New,
    /// Sitting in the scan stage's pending queue.
    Queued,
    /// Picked by the scan stage as the next item to inspect.
    Active,
    /// Metadata fetch in progress.
    Scanning,
    /// Metadata fetched and filters passed.
    Scanned,
    /// Waiting in the download stage for a free transfer slot.
    DownloadPending,
    /// Transfer started (connecting, negotiating ranges).
    Downloading,
    /// Response body is being written to disk.
    Writing,
    /// Transfer finished (or short-circuited).
    Done,
    /// Terminal failure.
    Failed,
}

impl ItemState {
    /// Returns the lowercase label used in logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Scanning => "scanning",
            Self::Scanned => "scanned",
            Self::DownloadPending => "download_pending",
            Self::Downloading => "downloading",
            Self::Writing => "writing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Whether the state is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Checks whether moving from `self` to `next` is a legal transition.
    ///
    /// Legal moves are:
    /// - any forward move (skipping states is allowed, e.g. a preloaded item
    ///   goes `New -> DownloadPending`),
    /// - `Failed` from any non-terminal state,
    /// - the retry edges `Scanning -> Active`, `Writing -> Downloading` and
    ///   `Downloading -> DownloadPending`.
    #[must_use]
    pub fn can_transition_to(&self, next: ItemState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == Self::Failed {
            return true;
        }
        match (self, next) {
            (Self::Scanning, Self::Active)
            | (Self::Writing, Self::Downloading)
            | (Self::Downloading, Self::DownloadPending) => true,
            (current, next) => next > *current,
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Rejected state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("item {id}: illegal state transition {from} -> {to}")]
pub struct TransitionError {
    /// Item id.
    pub id: u64,
    /// State the item was in.
    pub from: ItemState,
    /// Requested state.
    pub to: ItemState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_allowed() {
        assert!(ItemState::New.can_transition_to(ItemState::Queued));
        assert!(ItemState::Queued.can_transition_to(ItemState::Active));
        assert!(ItemState::Scanned.can_transition_to(ItemState::DownloadPending));
        assert!(ItemState::Writing.can_transition_to(ItemState::Done));
        // skipping ahead is fine for preloaded items
        assert!(ItemState::New.can_transition_to(ItemState::DownloadPending));
    }

    #[test]
    fn test_backward_transitions_rejected() {
        assert!(!ItemState::Scanned.can_transition_to(ItemState::Queued));
        assert!(!ItemState::Writing.can_transition_to(ItemState::Scanning));
        assert!(!ItemState::Done.can_transition_to(ItemState::Writing));
    }

    #[test]
    fn test_retry_edges_allowed() {
        assert!(ItemState::Scanning.can_transition_to(ItemState::Active));
        assert!(ItemState::Writing.can_transition_to(ItemState::Downloading));
        assert!(ItemState::Downloading.can_transition_to(ItemState::DownloadPending));
    }

    #[test]
    fn test_failed_reachable_from_in_flight_states_only() {
        for state in [
            ItemState::New,
            ItemState::Queued,
            ItemState::Scanning,
            ItemState::Downloading,
            ItemState::Writing,
        ] {
            assert!(state.can_transition_to(ItemState::Failed), "{state}");
        }
        assert!(!ItemState::Done.can_transition_to(ItemState::Failed));
        assert!(!ItemState::Failed.can_transition_to(ItemState::Failed));
    }

    #[test]
    fn test_same_state_is_not_a_transition() {
        assert!(!ItemState::Scanning.can_transition_to(ItemState::Scanning));
    }

    #[test]
    fn test_transition_error_display() {
        let err = TransitionError {
            id: 7,
            from: ItemState::Done,
            to: ItemState::Writing,
        };
        assert_eq!(
            err.to_string(),
            "item 7: illegal state transition done -> writing"
        );
    }
}
