// Work Queue Port (Interface)

use crate::domain::{ItemStatus, NewItem, QueueItem};
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Per-status item counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub suspended: usize,
    pub total: usize,
}

impl QueueStats {
    pub fn record(&mut self, status: ItemStatus) {
        match status {
            ItemStatus::Pending => self.pending += 1,
            ItemStatus::Processing => self.processing += 1,
            ItemStatus::Completed => self.completed += 1,
            ItemStatus::Failed => self.failed += 1,
            ItemStatus::Suspended => self.suspended += 1,
        }
        self.total += 1;
    }
}

/// Priority + FIFO work queue.
///
/// Implementations are thread-safe; every call is short and non-blocking.
/// Listing methods return items in priority order, then insertion order.
pub trait WorkQueue: Send + Sync {
    /// Add a new pending item
    ///
    /// # Errors
    /// - `AppError::QueueFull` if the queue is bounded and at capacity
    /// - `AppError::Conflict` if the supplied id already exists
    fn add(&self, item: NewItem) -> Result<QueueItem>;

    /// Next eligible pending item, or None. Does not change the item's status.
    fn get_next(&self) -> Option<QueueItem>;

    /// Find item by ID
    fn get(&self, id: &str) -> Option<QueueItem>;

    /// Replace the stored item; a PENDING item becomes eligible again
    fn update(&self, item: &QueueItem) -> Result<()>;

    /// Make a still-PENDING item eligible again after `get_next` handed it out
    /// but the caller could not record the hand-off. False if nothing changed.
    fn requeue(&self, id: &str) -> bool;

    /// Remove item by ID (true if it existed)
    fn remove(&self, id: &str) -> Result<bool>;

    fn list_by_status(&self, status: ItemStatus) -> Vec<QueueItem>;

    fn list_all(&self) -> Vec<QueueItem>;

    fn count_by_status(&self, status: ItemStatus) -> usize;

    fn size(&self) -> usize;

    fn is_full(&self) -> bool;

    /// Remove all items, or only those with `status`; returns the removed count
    fn clear(&self, status: Option<ItemStatus>) -> Result<usize>;

    fn get_stats(&self) -> QueueStats;

    fn is_empty(&self) -> bool {
        self.size() == 0
    }
}
