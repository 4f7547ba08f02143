//! In-memory FIFO queues connecting the pipeline stages.
//!
//! [`WorkQueue`] is a small async FIFO with an optional capacity and an
//! explicit close signal. Unlike a channel it can be inspected
//! ([`WorkQueue::snapshot`]) so the checkpoint writer can enumerate
//! outstanding ids without taking items out.
//!
//! The pipeline uses three of them:
//! - the scan stage's pending queue (unbounded, FIFO order is scan order),
//! - the scan output queue (unbounded, single producer/single consumer),
//! - the download stage's ready queue (bounded by the concurrency cap).

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Async FIFO queue with optional capacity and close semantics.
#[derive(Debug)]
pub struct WorkQueue<T> {
    inner: Mutex<Inner<T>>,
    changed: Notify,
    capacity: Option<usize>,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl<T> WorkQueue<T> {
    /// Creates a queue without a capacity limit.
    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            changed: Notify::new(),
            capacity: None,
        }
    }

    /// Creates a queue holding at most `capacity` items (minimum 1).
    #[must_use]
    pub fn bounded(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity.max(1)),
            ..Self::unbounded()
        }
    }

    /// Creates an unbounded queue prefilled with `items`.
    #[must_use]
    pub fn from_items(items: impl IntoIterator<Item = T>) -> Self {
        let queue = Self::unbounded();
        queue.lock().items.extend(items);
        queue
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn has_room(&self, inner: &Inner<T>) -> bool {
        self.capacity.is_none_or(|cap| inner.items.len() < cap)
    }

    /// Appends an item, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns the item back if the queue has been closed.
    pub async fn push(&self, item: T) -> Result<(), T> {
        loop {
            let notified = self.changed.notified();
            {
                let mut inner = self.lock();
                if inner.closed {
                    return Err(item);
                }
                if self.has_room(&inner) {
                    inner.items.push_back(item);
                    drop(inner);
                    self.changed.notify_waiters();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Appends an item without waiting.
    ///
    /// # Errors
    ///
    /// Returns the item back if the queue is closed or full.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let mut inner = self.lock();
        if inner.closed || !self.has_room(&inner) {
            return Err(item);
        }
        inner.items.push_back(item);
        drop(inner);
        self.changed.notify_waiters();
        Ok(())
    }

    /// Appends every item, ignoring the capacity limit.
    ///
    /// Used to extend unbounded queues; items are dropped if the queue is
    /// closed.
    pub fn extend(&self, items: impl IntoIterator<Item = T>) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.items.extend(items);
        drop(inner);
        self.changed.notify_waiters();
    }

    /// Removes the head item, waiting until one is available.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.changed.notified();
            {
                let mut inner = self.lock();
                if let Some(item) = inner.items.pop_front() {
                    drop(inner);
                    self.changed.notify_waiters();
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Removes the head item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        let item = self.lock().items.pop_front();
        if item.is_some() {
            self.changed.notify_waiters();
        }
        item
    }

    /// Removes and returns every queued item.
    pub fn drain(&self) -> Vec<T> {
        let items: Vec<T> = self.lock().items.drain(..).collect();
        self.changed.notify_waiters();
        items
    }

    /// Marks the queue closed. Queued items can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.changed.notify_waiters();
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Whether the queue is closed and empty (nothing more will come out).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        let inner = self.lock();
        inner.closed && inner.items.is_empty()
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Whether the queue holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Maps every queued item without removing it, in queue order.
    pub fn snapshot<R>(&self, f: impl FnMut(&T) -> R) -> Vec<R> {
        self.lock().items.iter().map(f).collect()
    }

    /// Waits until the queue holds no items.
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.changed.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}
