// Async consumer bridge over a WorkQueue

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use crate::domain::{ItemStatus, NewItem, QueueItem};
use crate::error::Result;
use crate::port::{QueueStats, WorkQueue};

/// Lets async consumers await work without polling.
///
/// Producers may call `put`/`update` from any thread or task. A wake is only a
/// hint; consumers always re-poll the wrapped queue after waking.
#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<dyn WorkQueue>,
    gate: Arc<Notify>,
}

impl AsyncQueue {
    pub fn new(inner: Arc<dyn WorkQueue>) -> Self {
        Self {
            inner,
            gate: Arc::new(Notify::new()),
        }
    }

    pub fn inner(&self) -> &Arc<dyn WorkQueue> {
        &self.inner
    }

    /// Add an item and wake waiting consumers
    pub fn put(&self, item: NewItem) -> Result<QueueItem> {
        let added = self.inner.add(item)?;
        self.wake();
        Ok(added)
    }

    /// Store an item; wakes consumers when it is pending
    pub fn update(&self, item: &QueueItem) -> Result<()> {
        self.inner.update(item)?;
        if item.is_pending() {
            self.wake();
        }
        Ok(())
    }

    /// Put a handed-out item back in line and wake consumers
    pub fn requeue(&self, id: &str) -> bool {
        let requeued = self.inner.requeue(id);
        if requeued {
            self.wake();
        }
        requeued
    }

    /// Wake every waiting consumer (e.g. after items were made pending elsewhere)
    pub fn wake(&self) {
        self.gate.notify_waiters();
    }

    /// Wait for the next eligible item.
    ///
    /// Returns None once `timeout` elapses with nothing available; `None` timeout
    /// waits indefinitely. Safe to cancel by dropping the future.
    pub async fn get(&self, timeout: Option<Duration>) -> Option<QueueItem> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            // Register before polling so a put between poll and wait is not lost
            let notified = self.gate.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.inner.get_next() {
                return Some(item);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        trace!("Queue wait timed out");
                        return self.inner.get_next();
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Wait for one item, then drain whatever else is ready, up to `max_items`
    pub async fn get_batch(&self, max_items: usize, timeout: Option<Duration>) -> Vec<QueueItem> {
        if max_items == 0 {
            return Vec::new();
        }
        let mut batch = Vec::with_capacity(max_items);
        if let Some(first) = self.get(timeout).await {
            batch.push(first);
            while batch.len() < max_items {
                match self.inner.get_next() {
                    Some(item) => batch.push(item),
                    None => break,
                }
            }
        }
        batch
    }

    pub fn get_item(&self, id: &str) -> Option<QueueItem> {
        self.inner.get(id)
    }

    pub fn remove(&self, id: &str) -> Result<bool> {
        self.inner.remove(id)
    }

    pub fn size(&self) -> usize {
        self.inner.size()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.count_by_status(ItemStatus::Pending)
    }

    pub fn processing_count(&self) -> usize {
        self.inner.count_by_status(ItemStatus::Processing)
    }

    pub fn list_by_status(&self, status: ItemStatus) -> Vec<QueueItem> {
        self.inner.list_by_status(status)
    }

    pub fn get_stats(&self) -> QueueStats {
        self.inner.get_stats()
    }
}
