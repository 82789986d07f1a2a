// Station Relay Infrastructure - Filesystem Adapters
// Implements: WorkQueue (PersistentQueue), OperationStore, SourceInbox, Converter, DeliveryClient

mod atomic;
mod converter;
mod inbox;
mod operation_store;
mod outbox;
mod persistent_queue;
mod watcher;

pub use atomic::write_atomic;
pub use converter::{JsonPassthroughConverter, JSON_CONVERTER_NAME};
pub use inbox::{is_candidate_file, FsInbox};
pub use operation_store::FsOperationStore;
pub use outbox::OutboxDeliveryClient;
pub use persistent_queue::{LoadReport, PersistentQueue, PersistentQueueConfig};
pub use watcher::{FileArrivalWatcher, WatcherConfig, WatcherState, WatcherStats};

// Note: notify::Error conversion is handled by a helper in watcher.rs
// due to Rust's orphan rules (cannot implement From<notify::Error> for AppError here)
