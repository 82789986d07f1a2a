// Persistent Queue - MemoryQueue mirrored to one directory
//
// The in-memory queue stays authoritative while running. Disk is written first
// so a failed write leaves memory untouched, and reloading rebuilds memory.

mod recovery;
mod sidecar;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use relay_core::application::{MemoryQueue, MemoryQueueConfig};
use relay_core::domain::{ItemStatus, NewItem, QueueItem, DEFAULT_MAX_ATTEMPTS};
use relay_core::error::{AppError, Result};
use relay_core::port::{IdProvider, QueueStats, WorkQueue};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::atomic::{remove_if_exists, write_atomic};
use recovery::{item_files, log_stale, scan_dir};
use sidecar::{data_path, meta_path, Sidecar};

#[derive(Debug, Clone)]
pub struct PersistentQueueConfig {
    pub dir: PathBuf,
    /// None = unbounded
    pub max_size: Option<usize>,
    pub default_max_attempts: u32,
    /// Drop both files as soon as an item completes
    pub delete_on_completion: bool,
    /// Load existing items in `open`
    pub auto_load: bool,
}

impl PersistentQueueConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_size: None,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            delete_on_completion: false,
            auto_load: true,
        }
    }
}

/// Outcome of loading the queue directory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub loaded: usize,
    /// PROCESSING items reset to PENDING
    pub recovered: usize,
    /// Unreadable or corrupt items left on disk
    pub skipped: usize,
}

pub struct PersistentQueue {
    memory: MemoryQueue,
    config: PersistentQueueConfig,
    persist: Mutex<()>,
}

impl PersistentQueue {
    /// Create the directory if needed and (with `auto_load`) load it
    pub fn open(config: PersistentQueueConfig) -> Result<Self> {
        let memory = MemoryQueue::new(Self::memory_config(&config));
        Self::open_with(config, memory)
    }

    pub fn open_with_id_provider(
        config: PersistentQueueConfig,
        id_provider: Arc<dyn IdProvider>,
    ) -> Result<Self> {
        let memory = MemoryQueue::with_id_provider(Self::memory_config(&config), id_provider);
        Self::open_with(config, memory)
    }

    fn memory_config(config: &PersistentQueueConfig) -> MemoryQueueConfig {
        MemoryQueueConfig {
            max_size: config.max_size,
            default_max_attempts: config.default_max_attempts,
        }
    }

    fn open_with(config: PersistentQueueConfig, memory: MemoryQueue) -> Result<Self> {
        if config.dir.exists() && !config.dir.is_dir() {
            return Err(AppError::Persistence(format!(
                "queue path {} is not a directory",
                config.dir.display()
            )));
        }
        fs::create_dir_all(&config.dir)?;
        let queue = Self {
            memory,
            config,
            persist: Mutex::new(()),
        };
        if queue.config.auto_load {
            queue.load()?;
        }
        Ok(queue)
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    pub fn config(&self) -> &PersistentQueueConfig {
        &self.config
    }

    // Guards no data of its own; a poisoned guard is as good as a fresh one
    fn persist_lock(&self) -> MutexGuard<'_, ()> {
        self.persist.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Rebuild memory from disk.
    ///
    /// Items already in memory are left alone, so calling this twice is harmless.
    pub fn load(&self) -> Result<LoadReport> {
        let _guard = self.persist_lock();
        let dir = &self.config.dir;
        let scan = scan_dir(dir)?;
        let mut report = LoadReport {
            skipped: scan.skipped,
            ..Default::default()
        };

        for (id, status) in &scan.stale {
            log_stale(id, *status);
            if let Err(e) = remove_files(dir, id, *status) {
                warn!(
                    item_id = %id,
                    status = %status,
                    error = %e,
                    "Could not remove superseded files"
                );
            }
        }

        for disk in scan.items {
            let mut item = disk.item;
            if self.memory.get(&item.id).is_some() {
                continue;
            }

            if item.status == ItemStatus::Processing {
                item.reset_to_pending();
                match write_files(dir, &item) {
                    Ok(()) => {
                        if let Err(e) = remove_files(dir, &item.id, ItemStatus::Processing) {
                            warn!(
                                item_id = %item.id,
                                error = %e,
                                "Could not remove processing files"
                            );
                        }
                    }
                    Err(e) => {
                        warn!(item_id = %item.id, error = %e, "Could not persist recovered item");
                    }
                }
                debug!(item_id = %item.id, attempts = item.attempts, "Recovered interrupted item");
                report.recovered += 1;
            }

            self.memory.restore(item)?;
            report.loaded += 1;
        }

        info!(
            dir = %dir.display(),
            loaded = report.loaded,
            recovered = report.recovered,
            skipped = report.skipped,
            "Persistent queue loaded"
        );
        Ok(report)
    }
}

/// Data first, then the sidecar; the sidecar commits the copy
fn write_files(dir: &Path, item: &QueueItem) -> Result<()> {
    let data = item.data.encode()?;
    let meta = serde_json::to_vec_pretty(&Sidecar::from_item(item))?;
    let data_file = data_path(dir, &item.id, item.status);
    let meta_file = meta_path(dir, &item.id, item.status);
    // An in-place rewrite keeps its committed sidecar; only a new copy is rolled back
    let fresh = !meta_file.exists();
    write_atomic(&data_file, &data)?;
    if let Err(e) = write_atomic(&meta_file, &meta) {
        if fresh {
            if let Err(cleanup) = remove_if_exists(&data_file) {
                warn!(
                    item_id = %item.id,
                    error = %cleanup,
                    "Could not remove uncommitted data file"
                );
            }
        }
        return Err(e.into());
    }
    Ok(())
}

fn remove_files(dir: &Path, id: &str, status: ItemStatus) -> std::io::Result<()> {
    for path in item_files(dir, id, status) {
        remove_if_exists(&path)?;
    }
    Ok(())
}

impl WorkQueue for PersistentQueue {
    fn add(&self, request: NewItem) -> Result<QueueItem> {
        let _guard = self.persist_lock();
        let item = self.memory.prepare(request);
        self.memory.check_insertable(&item)?;
        write_files(&self.config.dir, &item)?;
        self.memory.restore(item.clone())?;
        debug!(item_id = %item.id, priority = item.priority, "Item persisted");
        Ok(item)
    }

    fn get_next(&self) -> Option<QueueItem> {
        self.memory.get_next()
    }

    fn get(&self, id: &str) -> Option<QueueItem> {
        self.memory.get(id)
    }

    fn update(&self, item: &QueueItem) -> Result<()> {
        let _guard = self.persist_lock();
        let dir = &self.config.dir;
        let previous = self
            .memory
            .get(&item.id)
            .ok_or_else(|| AppError::NotFound(item.id.clone()))?;

        write_files(dir, item)?;
        if previous.status != item.status {
            if let Err(e) = remove_files(dir, &item.id, previous.status) {
                warn!(
                    item_id = %item.id,
                    status = %previous.status,
                    error = %e,
                    "Could not remove old status files"
                );
            }
        }
        if self.config.delete_on_completion && item.status == ItemStatus::Completed {
            if let Err(e) = remove_files(dir, &item.id, ItemStatus::Completed) {
                warn!(item_id = %item.id, error = %e, "Could not delete completed item files");
            }
        }

        self.memory.update(item)
    }

    fn requeue(&self, id: &str) -> bool {
        // Nothing on disk changed: the pending copy is still the committed one
        self.memory.requeue(id)
    }

    fn remove(&self, id: &str) -> Result<bool> {
        let _guard = self.persist_lock();
        if self.memory.get(id).is_none() {
            return Ok(false);
        }
        for status in ItemStatus::ALL {
            remove_files(&self.config.dir, id, status)?;
        }
        self.memory.remove(id)
    }

    fn list_by_status(&self, status: ItemStatus) -> Vec<QueueItem> {
        self.memory.list_by_status(status)
    }

    fn list_all(&self) -> Vec<QueueItem> {
        self.memory.list_all()
    }

    fn count_by_status(&self, status: ItemStatus) -> usize {
        self.memory.count_by_status(status)
    }

    fn size(&self) -> usize {
        self.memory.size()
    }

    fn is_full(&self) -> bool {
        self.memory.is_full()
    }

    fn clear(&self, status: Option<ItemStatus>) -> Result<usize> {
        let _guard = self.persist_lock();
        let targets = match status {
            Some(status) => self.memory.list_by_status(status),
            None => self.memory.list_all(),
        };

        let mut removed = 0;
        for item in targets {
            remove_files(&self.config.dir, &item.id, item.status)?;
            if self.memory.remove(&item.id)? {
                removed += 1;
            }
        }
        info!(removed, status = ?status, "Persistent queue cleared");
        Ok(removed)
    }

    fn get_stats(&self) -> QueueStats {
        self.memory.get_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use relay_core::domain::ItemPayload;
    use serde_json::json;
    use tempfile::TempDir;

    fn open(dir: &Path) -> PersistentQueue {
        PersistentQueue::open(PersistentQueueConfig::new(dir)).unwrap()
    }

    fn json_item(id: &str) -> NewItem {
        NewItem::new(ItemPayload::Json(json!({ "id": id }))).with_id(id)
    }

    fn exists(dir: &Path, name: &str) -> bool {
        dir.join(name).exists()
    }

    #[test]
    fn test_add_writes_data_and_sidecar() {
        let tmp = TempDir::new().unwrap();
        let queue = open(tmp.path());

        queue.add(json_item("A1").with_priority(2)).unwrap();

        assert!(exists(tmp.path(), "A1.pending.data"));
        assert!(exists(tmp.path(), "A1.pending.meta.json"));
        let meta: serde_json::Value =
            serde_json::from_slice(&fs::read(tmp.path().join("A1.pending.meta.json")).unwrap())
                .unwrap();
        assert_eq!(meta["priority"], 2);
        assert_eq!(meta["status"], "pending");
        assert_eq!(meta["payload_kind"], "json");
    }

    #[test]
    fn test_status_change_moves_files() {
        let tmp = TempDir::new().unwrap();
        let queue = open(tmp.path());
        let mut item = queue.add(json_item("A1")).unwrap();

        item.mark_processing().unwrap();
        queue.update(&item).unwrap();

        assert!(exists(tmp.path(), "A1.processing.data"));
        assert!(!exists(tmp.path(), "A1.pending.data"));
        assert!(!exists(tmp.path(), "A1.pending.meta.json"));
    }

    #[test]
    fn test_reload_preserves_fifo_order() {
        let tmp = TempDir::new().unwrap();
        {
            let queue = open(tmp.path());
            for id in ["a", "b", "c"] {
                queue.add(json_item(id)).unwrap();
            }
        }

        let queue = open(tmp.path());
        let mut order = Vec::new();
        while let Some(mut item) = queue.get_next() {
            order.push(item.id.clone());
            item.mark_completed();
            queue.update(&item).unwrap();
        }
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_processing_items_recovered_as_pending() {
        let tmp = TempDir::new().unwrap();
        {
            let queue = open(tmp.path());
            let mut item = queue.add(json_item("A1")).unwrap();
            item.mark_processing().unwrap();
            queue.update(&item).unwrap();
            // dropped mid-processing
        }

        let queue = open(tmp.path());
        let item = queue.get("A1").unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.attempts, 1);
        assert_eq!(queue.get_next().map(|i| i.id), Some("A1".to_string()));
        assert!(exists(tmp.path(), "A1.pending.data"));
        assert!(!exists(tmp.path(), "A1.processing.data"));
    }

    #[test]
    fn test_load_report_counts() {
        let tmp = TempDir::new().unwrap();
        {
            let queue = open(tmp.path());
            queue.add(json_item("ok")).unwrap();
            let mut busy = queue.add(json_item("busy")).unwrap();
            busy.mark_processing().unwrap();
            queue.update(&busy).unwrap();
        }
        fs::write(tmp.path().join("bad.pending.data"), b"{ not json").unwrap();

        let queue = PersistentQueue::open(PersistentQueueConfig {
            auto_load: false,
            ..PersistentQueueConfig::new(tmp.path())
        })
        .unwrap();
        assert_eq!(queue.size(), 0);

        let report = queue.load().unwrap();
        assert_eq!(
            report,
            LoadReport {
                loaded: 2,
                recovered: 1,
                skipped: 1
            }
        );

        // Second load finds nothing new
        assert_eq!(queue.load().unwrap().loaded, 0);
        assert_eq!(queue.size(), 2);
    }

    #[test]
    fn test_corrupt_payload_is_skipped() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("bad.pending.data"), b"\x00\x01 garbage").unwrap();
        fs::write(
            tmp.path().join("bad.pending.meta.json"),
            br#"{"id": "bad", "payload_kind": "json"}"#,
        )
        .unwrap();

        let queue = open(tmp.path());
        assert!(queue.is_empty());
        assert!(exists(tmp.path(), "bad.pending.data"));
    }

    #[test]
    fn test_malformed_sidecar_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("X9.pending.data"), br#"{"sn": "X9"}"#).unwrap();
        fs::write(tmp.path().join("X9.pending.meta.json"), b"not json at all").unwrap();
        fs::write(tmp.path().join("Y1.pending.data"), br#"{"sn": "Y1"}"#).unwrap();

        let queue = open(tmp.path());
        let item = queue.get("X9").unwrap();
        assert_eq!(item.priority, 5);
        assert_eq!(item.max_attempts, 3);
        assert_eq!(item.data, ItemPayload::Json(json!({"sn": "X9"})));
        assert!(queue.get("Y1").is_some());
    }

    #[test]
    fn test_newest_copy_wins() {
        let tmp = TempDir::new().unwrap();
        let mut old = QueueItem::new("A1", ItemPayload::Text("v1".into()), 5, 3);
        old.status = ItemStatus::Pending;
        let mut new = old.clone();
        new.data = ItemPayload::Text("v2".into());
        new.status = ItemStatus::Completed;
        new.updated_at = old.updated_at + Duration::minutes(1);
        write_files(tmp.path(), &old).unwrap();
        write_files(tmp.path(), &new).unwrap();

        let queue = open(tmp.path());
        let item = queue.get("A1").unwrap();
        assert_eq!(item.status, ItemStatus::Completed);
        assert_eq!(item.data, ItemPayload::Text("v2".into()));
        assert!(queue.get_next().is_none());
        assert!(!exists(tmp.path(), "A1.pending.data"));
    }

    #[test]
    fn test_special_characters_in_id() {
        let tmp = TempDir::new().unwrap();
        {
            let queue = open(tmp.path());
            queue.add(json_item("run/01:a b")).unwrap();
        }
        assert!(exists(tmp.path(), "run_01_a_b.pending.data"));

        let queue = open(tmp.path());
        assert!(queue.get("run/01:a b").is_some());
    }

    #[test]
    fn test_text_and_bytes_payloads_survive_reload() {
        let tmp = TempDir::new().unwrap();
        {
            let queue = open(tmp.path());
            queue
                .add(NewItem::new(ItemPayload::Text("héllo".into())).with_id("t"))
                .unwrap();
            queue
                .add(NewItem::new(ItemPayload::Bytes(vec![0, 159, 255])).with_id("b"))
                .unwrap();
        }

        let queue = open(tmp.path());
        assert_eq!(queue.get("t").unwrap().data, ItemPayload::Text("héllo".into()));
        assert_eq!(queue.get("b").unwrap().data, ItemPayload::Bytes(vec![0, 159, 255]));
    }

    #[test]
    fn test_delete_on_completion() {
        let tmp = TempDir::new().unwrap();
        let queue = PersistentQueue::open(PersistentQueueConfig {
            delete_on_completion: true,
            ..PersistentQueueConfig::new(tmp.path())
        })
        .unwrap();
        let mut item = queue.add(json_item("A1")).unwrap();

        item.mark_completed();
        queue.update(&item).unwrap();

        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
        assert_eq!(queue.get("A1").unwrap().status, ItemStatus::Completed);
    }

    #[test]
    fn test_remove_deletes_files() {
        let tmp = TempDir::new().unwrap();
        let queue = open(tmp.path());
        queue.add(json_item("A1")).unwrap();

        assert!(queue.remove("A1").unwrap());
        assert!(!queue.remove("A1").unwrap());
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_clear_by_status_deletes_only_those_files() {
        let tmp = TempDir::new().unwrap();
        let queue = open(tmp.path());
        queue.add(json_item("keep")).unwrap();
        let mut done = queue.add(json_item("done")).unwrap();
        done.mark_completed();
        queue.update(&done).unwrap();

        assert_eq!(queue.clear(Some(ItemStatus::Completed)).unwrap(), 1);
        assert!(!exists(tmp.path(), "done.completed.data"));
        assert!(exists(tmp.path(), "keep.pending.data"));
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn test_write_failure_leaves_memory_unchanged() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("queue");
        let queue = open(&dir);
        fs::remove_dir_all(&dir).unwrap();

        let err = queue.add(json_item("A1")).unwrap_err();
        assert!(matches!(err, AppError::Io(_)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_half_written_transition_is_discarded() {
        let tmp = TempDir::new().unwrap();
        {
            let queue = open(tmp.path());
            let mut item = queue
                .add(json_item("run/01").with_priority(7).with_max_attempts(9))
                .unwrap();
            item.mark_processing().unwrap();
            item.reset_to_pending();
            queue.update(&item).unwrap();
        }
        // Crash after the processing data file, before its sidecar
        fs::copy(
            tmp.path().join("run_01.pending.data"),
            tmp.path().join("run_01.processing.data"),
        )
        .unwrap();

        let queue = open(tmp.path());
        let items = queue.list_all();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "run/01");
        assert_eq!(items[0].priority, 7);
        assert_eq!(items[0].max_attempts, 9);
        assert_eq!(items[0].attempts, 1);
        assert!(!exists(tmp.path(), "run_01.processing.data"));
        assert!(exists(tmp.path(), "run_01.pending.meta.json"));
    }

    #[test]
    fn test_mixed_statuses_recover_in_priority_then_arrival_order() {
        let tmp = TempDir::new().unwrap();
        {
            let queue = open(tmp.path());
            let arrivals = [("1-low", 8), ("2-high", 2), ("3-mid", 4), ("4-low", 8), ("5-high", 2)];
            for (id, priority) in arrivals {
                queue.add(json_item(id).with_priority(priority)).unwrap();
            }
            for id in ["2-high", "4-low"] {
                let mut busy = queue.get(id).unwrap();
                busy.mark_processing().unwrap();
                queue.update(&busy).unwrap();
            }
            let mut failed = queue.get("3-mid").unwrap();
            failed.mark_processing().unwrap();
            failed.mark_failed("schema mismatch");
            queue.update(&failed).unwrap();
        }

        let queue = open(tmp.path());
        assert_eq!(queue.count_by_status(ItemStatus::Pending), 4);
        assert_eq!(queue.count_by_status(ItemStatus::Failed), 1);

        let mut order = Vec::new();
        while let Some(mut item) = queue.get_next() {
            order.push(item.id.clone());
            item.mark_completed();
            queue.update(&item).unwrap();
        }
        assert_eq!(order, vec!["2-high", "5-high", "1-low", "4-low"]);
        assert_eq!(queue.get("2-high").unwrap().attempts, 1);
        assert_eq!(queue.get("3-mid").unwrap().status, ItemStatus::Failed);
    }

    #[test]
    fn test_requeue_after_failed_hand_off() {
        let tmp = TempDir::new().unwrap();
        let queue = open(tmp.path());
        queue.add(json_item("A1")).unwrap();

        assert_eq!(queue.get_next().unwrap().id, "A1");
        assert!(queue.get_next().is_none());
        assert!(queue.requeue("A1"));
        assert_eq!(queue.get_next().unwrap().id, "A1");
        assert!(exists(tmp.path(), "A1.pending.data"));
    }

    #[test]
    fn test_queue_path_that_is_a_file_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("queue");
        fs::write(&path, b"not a directory").unwrap();

        let err = PersistentQueue::open(PersistentQueueConfig::new(&path))
            .err()
            .unwrap();
        assert!(matches!(err, AppError::Persistence(_)));
    }

    #[test]
    fn test_full_queue_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let queue = PersistentQueue::open(PersistentQueueConfig {
            max_size: Some(1),
            ..PersistentQueueConfig::new(tmp.path())
        })
        .unwrap();
        queue.add(json_item("A1")).unwrap();

        let err = queue.add(json_item("A2")).unwrap_err();
        assert!(matches!(err, AppError::QueueFull(1)));
        assert!(!exists(tmp.path(), "A2.pending.data"));
    }
}
