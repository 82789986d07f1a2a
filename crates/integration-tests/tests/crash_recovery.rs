//! Crash Recovery Integration Tests
//!
//! A relay killed mid-processing must pick up every queued file on restart,
//! exactly once, without re-queuing files it already accepted.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use relay_core::application::{
    CircuitBreaker, CircuitBreakerConfig, ConverterBinding, ConverterPool, PoolConfig,
};
use relay_core::domain::{ItemPayload, ItemStatus, NewItem};
use relay_core::port::{PostProcess, SourceInbox, WorkQueue};
use relay_infra_fs::{
    FsInbox, JsonPassthroughConverter, OutboxDeliveryClient, PersistentQueue,
    PersistentQueueConfig,
};
use tempfile::TempDir;

struct Station {
    _tmp: TempDir,
    watch: PathBuf,
    queue_dir: PathBuf,
    outbox: PathBuf,
}

impl Station {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let watch = tmp.path().join("inbox");
        fs::create_dir_all(&watch).unwrap();
        Self {
            queue_dir: tmp.path().join("queue"),
            outbox: tmp.path().join("outbox"),
            watch,
            _tmp: tmp,
        }
    }

    fn open_queue(&self) -> Arc<PersistentQueue> {
        Arc::new(PersistentQueue::open(PersistentQueueConfig::new(&self.queue_dir)).unwrap())
    }

    fn pool(&self, queue: Arc<PersistentQueue>) -> ConverterPool {
        let binding = ConverterBinding::new(Arc::new(JsonPassthroughConverter::new()), &self.watch)
            .with_post_process(PostProcess::Delete);
        ConverterPool::new(
            queue,
            Arc::new(CircuitBreaker::new("collector", CircuitBreakerConfig::default())),
            Arc::new(OutboxDeliveryClient::new(&self.outbox).unwrap()),
            Arc::new(FsInbox::new()),
            vec![binding],
            PoolConfig::default(),
        )
    }

    fn drop_file(&self, name: &str, body: &str) -> PathBuf {
        let path = self.watch.join(name);
        fs::write(&path, body).unwrap();
        path
    }

    fn outbox_records(&self) -> Vec<serde_json::Value> {
        let Ok(entries) = fs::read_dir(&self.outbox) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .map(|e| serde_json::from_slice(&fs::read(e.path()).unwrap()).unwrap())
            .collect()
    }
}

fn exists(path: &Path) -> bool {
    path.exists()
}

#[tokio::test]
async fn test_item_interrupted_mid_processing_is_delivered_after_restart() {
    let station = Station::new();
    let file = station.drop_file("run_01.json", r#"{"sn": "A1", "result": "pass"}"#);

    // First run: file accepted, worker picks it up, then the process dies
    {
        let queue = station.open_queue();
        let pool = station.pool(queue.clone());
        pool.on_file_created(&file, "json").unwrap();

        let mut item = queue.get_next().unwrap();
        item.mark_processing().unwrap();
        queue.update(&item).unwrap();
    }
    assert!(exists(&file.with_extension("json.queued")));

    // Second run: recovered as pending, then delivered
    let queue = station.open_queue();
    assert_eq!(queue.count_by_status(ItemStatus::Pending), 1);
    let pool = station.pool(queue.clone());

    assert!(pool.process_next().await.unwrap());

    let records = station.outbox_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["sn"], "A1");
    assert_eq!(queue.count_by_status(ItemStatus::Completed), 1);
    assert_eq!(queue.list_all()[0].attempts, 2);
    assert!(!exists(&file));
    assert!(!exists(&file.with_extension("json.queued")));
}

#[tokio::test]
async fn test_startup_scan_does_not_requeue_accepted_files() {
    let station = Station::new();
    let accepted = station.drop_file("run_01.json", r#"{"sn": "A1"}"#);

    {
        let queue = station.open_queue();
        let pool = station.pool(queue);
        pool.on_file_created(&accepted, "json").unwrap();
    }

    // Arrived while the relay was down
    station.drop_file("run_02.json", r#"{"sn": "A2"}"#);

    let queue = station.open_queue();
    let pool = station.pool(queue.clone());
    let stats = pool.scan_existing_files().await.unwrap();

    assert_eq!(stats.scanned, 2);
    assert_eq!(stats.queued, 1);
    assert_eq!(stats.skipped, 1);
    assert_eq!(queue.size(), 2);
    assert!(FsInbox::new().is_marked(&station.watch.join("run_02.json")));
}

#[tokio::test]
async fn test_priority_and_fifo_survive_restart() {
    let station = Station::new();
    {
        let queue = station.open_queue();
        for (id, priority) in [("low-1", 8), ("high-1", 2), ("low-2", 8), ("high-2", 2)] {
            queue
                .add(
                    NewItem::new(ItemPayload::Text(id.to_string()))
                        .with_id(id)
                        .with_priority(priority),
                )
                .unwrap();
        }
    }

    let queue = station.open_queue();
    let mut order = Vec::new();
    while let Some(mut item) = queue.get_next() {
        order.push(item.id.clone());
        item.mark_completed();
        queue.update(&item).unwrap();
    }
    assert_eq!(order, vec!["high-1", "high-2", "low-1", "low-2"]);
}

#[tokio::test]
async fn test_terminal_items_are_kept_but_not_reprocessed() {
    let station = Station::new();
    {
        let queue = station.open_queue();
        let mut done = queue
            .add(NewItem::new(ItemPayload::Text("done".into())).with_id("done"))
            .unwrap();
        done.mark_completed();
        queue.update(&done).unwrap();

        let mut failed = queue
            .add(NewItem::new(ItemPayload::Text("failed".into())).with_id("failed"))
            .unwrap();
        failed.mark_failed("Record rejected");
        queue.update(&failed).unwrap();
    }

    let queue = station.open_queue();
    assert_eq!(queue.size(), 2);
    assert!(queue.get_next().is_none());
    assert_eq!(
        queue.get("failed").unwrap().last_error.as_deref(),
        Some("Record rejected")
    );
}
