// Operation Store Port
// Durable home of queued operations, split into partitions

use crate::domain::QueuedOperation;
use crate::error::Result;

/// Store partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorePartition {
    /// Waiting to send (or being retried)
    Pending,
    /// Gave up after max retries; kept for manual reconciliation
    Failed,
    /// Delivered; kept for a retention window
    Sent,
}

impl StorePartition {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorePartition::Pending => "pending",
            StorePartition::Failed => "failed",
            StorePartition::Sent => "sent",
        }
    }
}

/// Operation store interface
pub trait OperationStore: Send + Sync {
    /// Create or overwrite `operation` in `partition`
    fn save(&self, partition: StorePartition, operation: &QueuedOperation) -> Result<()>;

    fn load(&self, partition: StorePartition, id: &str) -> Result<Option<QueuedOperation>>;

    /// Delete from `partition` (true if it existed)
    fn delete(&self, partition: StorePartition, id: &str) -> Result<bool>;

    /// All operations in `partition`, oldest first
    fn list(&self, partition: StorePartition) -> Result<Vec<QueuedOperation>>;

    fn count(&self, partition: StorePartition) -> Result<usize> {
        Ok(self.list(partition)?.len())
    }
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::error::AppError;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory store whose writes can be forced to fail
    #[derive(Default)]
    pub struct InMemoryOperationStore {
        partitions: Mutex<HashMap<&'static str, HashMap<String, QueuedOperation>>>,
        saves: Mutex<usize>,
        fail_after: Mutex<Option<usize>>,
    }

    impl InMemoryOperationStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Let `n` more saves succeed, then fail every save after that
        pub fn fail_saves_after(&self, n: usize) {
            let saves = *self.saves.lock().unwrap();
            *self.fail_after.lock().unwrap() = Some(saves + n);
        }

        pub fn heal(&self) {
            *self.fail_after.lock().unwrap() = None;
        }
    }

    impl OperationStore for InMemoryOperationStore {
        fn save(&self, partition: StorePartition, operation: &QueuedOperation) -> Result<()> {
            let mut saves = self.saves.lock().unwrap();
            if let Some(limit) = *self.fail_after.lock().unwrap() {
                if *saves >= limit {
                    return Err(AppError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "No space left on device",
                    )));
                }
            }
            *saves += 1;
            self.partitions
                .lock()
                .unwrap()
                .entry(partition.as_str())
                .or_default()
                .insert(operation.id.clone(), operation.clone());
            Ok(())
        }

        fn load(&self, partition: StorePartition, id: &str) -> Result<Option<QueuedOperation>> {
            Ok(self
                .partitions
                .lock()
                .unwrap()
                .get(partition.as_str())
                .and_then(|ops| ops.get(id).cloned()))
        }

        fn delete(&self, partition: StorePartition, id: &str) -> Result<bool> {
            Ok(self
                .partitions
                .lock()
                .unwrap()
                .get_mut(partition.as_str())
                .map(|ops| ops.remove(id).is_some())
                .unwrap_or(false))
        }

        fn list(&self, partition: StorePartition) -> Result<Vec<QueuedOperation>> {
            let mut ops: Vec<QueuedOperation> = self
                .partitions
                .lock()
                .unwrap()
                .get(partition.as_str())
                .map(|ops| ops.values().cloned().collect())
                .unwrap_or_default();
            ops.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
            Ok(ops)
        }
    }
}
