// In-memory priority queue (binary heap + authoritative id map)

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::domain::{
    clamp_priority, ItemId, ItemStatus, NewItem, Priority, QueueItem, DEFAULT_MAX_ATTEMPTS,
};
use crate::error::{AppError, Result};
use crate::port::id_provider::UuidProvider;
use crate::port::{IdProvider, QueueStats, WorkQueue};

/// Heap key: (priority, insertion sequence, id). Min-heap via `Reverse`.
type HeapEntry = Reverse<(Priority, u64, ItemId)>;

/// Rebuild the heap once stale entries outnumber live items by this factor
const COMPACTION_FACTOR: usize = 2;
const COMPACTION_MIN_ENTRIES: usize = 64;

#[derive(Debug, Clone)]
pub struct MemoryQueueConfig {
    /// None = unbounded
    pub max_size: Option<usize>,
    pub default_max_attempts: u32,
}

impl Default for MemoryQueueConfig {
    fn default() -> Self {
        Self {
            max_size: None,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

struct Slot {
    item: QueueItem,
    seq: u64,
    /// A live heap entry exists for (item.priority, seq)
    queued: bool,
}

#[derive(Default)]
struct QueueState {
    items: HashMap<ItemId, Slot>,
    heap: BinaryHeap<HeapEntry>,
    next_seq: u64,
    /// Slots with `queued` set
    live: usize,
}

impl QueueState {
    fn insert(&mut self, item: QueueItem) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let queued = item.is_pending();
        if queued {
            self.heap.push(Reverse((item.priority, seq, item.id.clone())));
            self.live += 1;
        }
        self.items.insert(item.id.clone(), Slot { item, seq, queued });
    }

    /// Push a fresh heap entry for the slot under `id`
    fn index(&mut self, id: &str) {
        let Some(slot) = self.items.get_mut(id) else {
            return;
        };
        // Same sequence number: re-eligible items keep their place among equals
        self.heap
            .push(Reverse((slot.item.priority, slot.seq, slot.item.id.clone())));
        if !slot.queued {
            slot.queued = true;
            self.live += 1;
        }
    }

    fn remove(&mut self, id: &str) -> bool {
        match self.items.remove(id) {
            Some(slot) => {
                if slot.queued {
                    self.live -= 1;
                }
                true
            }
            None => false,
        }
    }

    fn pop_eligible(&mut self) -> Option<QueueItem> {
        while let Some(Reverse((priority, seq, id))) = self.heap.pop() {
            let Some(slot) = self.items.get_mut(&id) else {
                continue; // removed
            };
            if !slot.queued || slot.seq != seq || slot.item.priority != priority {
                continue; // superseded entry
            }
            slot.queued = false;
            self.live -= 1;
            if slot.item.is_pending() {
                return Some(slot.item.clone());
            }
        }
        None
    }

    fn sorted<'a>(&'a self, filter: impl Fn(&QueueItem) -> bool) -> Vec<QueueItem> {
        let mut slots: Vec<&'a Slot> = self.items.values().filter(|s| filter(&s.item)).collect();
        slots.sort_by_key(|s| (s.item.priority, s.seq));
        slots.into_iter().map(|s| s.item.clone()).collect()
    }

    fn compact_if_needed(&mut self) {
        if self.heap.len() < COMPACTION_MIN_ENTRIES
            || self.heap.len() <= self.live * COMPACTION_FACTOR
        {
            return;
        }
        self.heap = self
            .items
            .values()
            .filter(|s| s.queued)
            .map(|s| Reverse((s.item.priority, s.seq, s.item.id.clone())))
            .collect();
        debug!(entries = self.heap.len(), "Compacted queue heap");
    }
}

/// Thread-safe priority + FIFO queue.
///
/// The id map is the source of truth. Heap entries are only an index and are
/// invalidated lazily: `get_next` drops entries whose item is gone, is no longer
/// pending, or has since changed priority.
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    config: MemoryQueueConfig,
    id_provider: Arc<dyn IdProvider>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(MemoryQueueConfig::default())
    }
}

impl MemoryQueue {
    pub fn new(config: MemoryQueueConfig) -> Self {
        Self::with_id_provider(config, Arc::new(UuidProvider))
    }

    pub fn with_id_provider(config: MemoryQueueConfig, id_provider: Arc<dyn IdProvider>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            config,
            id_provider,
        }
    }

    pub fn config(&self) -> &MemoryQueueConfig {
        &self.config
    }

    // Every mutation leaves map and heap consistent before releasing the lock,
    // so a poisoned guard is still safe to use.
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Build the item `add` would insert, without inserting it
    pub fn prepare(&self, request: NewItem) -> QueueItem {
        let id = request
            .id
            .unwrap_or_else(|| self.id_provider.generate_id());
        let max_attempts = request
            .max_attempts
            .unwrap_or(self.config.default_max_attempts);
        let mut item = QueueItem::new(id, request.data, request.priority, max_attempts);
        item.metadata = request.metadata;
        item
    }

    /// Check capacity and id uniqueness for a prepared item
    pub fn check_insertable(&self, item: &QueueItem) -> Result<()> {
        let state = self.state();
        Self::check_insertable_locked(&state, &self.config, item)
    }

    fn check_insertable_locked(
        state: &QueueState,
        config: &MemoryQueueConfig,
        item: &QueueItem,
    ) -> Result<()> {
        if let Some(max) = config.max_size {
            if state.items.len() >= max {
                return Err(AppError::QueueFull(max));
            }
        }
        if state.items.contains_key(&item.id) {
            return Err(AppError::Conflict(format!("item {} already queued", item.id)));
        }
        Ok(())
    }

    /// Insert an already-built item as-is (any status).
    ///
    /// Used when rebuilding from disk; pending items become eligible.
    pub fn restore(&self, item: QueueItem) -> Result<()> {
        let mut state = self.state();
        if state.items.contains_key(&item.id) {
            return Err(AppError::Conflict(format!("item {} already queued", item.id)));
        }
        state.insert(item);
        Ok(())
    }

    fn insert_checked(&self, item: QueueItem) -> Result<QueueItem> {
        let mut state = self.state();
        Self::check_insertable_locked(&state, &self.config, &item)?;
        debug!(item_id = %item.id, priority = item.priority, "Item queued");
        state.insert(item.clone());
        Ok(item)
    }
}

impl WorkQueue for MemoryQueue {
    fn add(&self, request: NewItem) -> Result<QueueItem> {
        let item = self.prepare(request);
        self.insert_checked(item)
    }

    fn get_next(&self) -> Option<QueueItem> {
        let mut state = self.state();
        let next = state.pop_eligible();
        state.compact_if_needed();
        next
    }

    fn get(&self, id: &str) -> Option<QueueItem> {
        self.state().items.get(id).map(|s| s.item.clone())
    }

    fn update(&self, item: &QueueItem) -> Result<()> {
        let mut state = self.state();
        let state = &mut *state;
        let slot = state
            .items
            .get_mut(&item.id)
            .ok_or_else(|| AppError::NotFound(format!("item {}", item.id)))?;

        let previous_priority = slot.item.priority;
        slot.item = item.clone();
        slot.item.priority = clamp_priority(item.priority as i64);

        if slot.item.is_pending() && (!slot.queued || previous_priority != slot.item.priority) {
            state.index(&item.id);
        }
        Ok(())
    }

    fn requeue(&self, id: &str) -> bool {
        let mut state = self.state();
        match state.items.get(id) {
            Some(slot) if slot.item.is_pending() && !slot.queued => {
                state.index(id);
                debug!(item_id = %id, "Item made eligible again");
                true
            }
            _ => false,
        }
    }

    fn remove(&self, id: &str) -> Result<bool> {
        Ok(self.state().remove(id))
    }

    fn list_by_status(&self, status: ItemStatus) -> Vec<QueueItem> {
        self.state().sorted(|item| item.status == status)
    }

    fn list_all(&self) -> Vec<QueueItem> {
        self.state().sorted(|_| true)
    }

    fn count_by_status(&self, status: ItemStatus) -> usize {
        self.state()
            .items
            .values()
            .filter(|s| s.item.status == status)
            .count()
    }

    fn size(&self) -> usize {
        self.state().items.len()
    }

    fn is_full(&self) -> bool {
        match self.config.max_size {
            Some(max) => self.size() >= max,
            None => false,
        }
    }

    fn clear(&self, status: Option<ItemStatus>) -> Result<usize> {
        let mut state = self.state();
        let before = state.items.len();
        match status {
            Some(status) => {
                let ids: Vec<ItemId> = state
                    .items
                    .values()
                    .filter(|s| s.item.status == status)
                    .map(|s| s.item.id.clone())
                    .collect();
                for id in ids {
                    state.remove(&id);
                }
            }
            None => {
                state.items.clear();
                state.heap.clear();
                state.live = 0;
            }
        }
        Ok(before - state.items.len())
    }

    fn get_stats(&self) -> QueueStats {
        let state = self.state();
        let mut stats = QueueStats::default();
        for slot in state.items.values() {
            stats.record(slot.item.status);
        }
        stats
    }
}
