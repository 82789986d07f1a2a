// Filesystem Operation Store
// Layout: <root>/{pending,failed,sent}/<id>.json

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use relay_core::domain::QueuedOperation;
use relay_core::error::{AppError, Result};
use relay_core::port::{OperationStore, StorePartition};
use tracing::{debug, warn};

use crate::atomic::{remove_if_exists, write_atomic};

const PARTITIONS: [StorePartition; 3] = [
    StorePartition::Pending,
    StorePartition::Failed,
    StorePartition::Sent,
];

/// One JSON file per operation, written atomically
pub struct FsOperationStore {
    root: PathBuf,
}

impl FsOperationStore {
    /// Open the store, creating the partition directories
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for partition in PARTITIONS {
            fs::create_dir_all(root.join(partition.as_str()))?;
        }
        debug!(root = %root.display(), "Operation store opened");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partition_dir(&self, partition: StorePartition) -> PathBuf {
        self.root.join(partition.as_str())
    }

    fn operation_path(&self, partition: StorePartition, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.partition_dir(partition).join(format!("{}.json", id)))
    }
}

fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(AppError::Validation(format!("invalid operation id: {:?}", id)))
    }
}

impl OperationStore for FsOperationStore {
    fn save(&self, partition: StorePartition, operation: &QueuedOperation) -> Result<()> {
        let path = self.operation_path(partition, &operation.id)?;
        let bytes = serde_json::to_vec_pretty(operation)?;
        write_atomic(&path, &bytes)?;
        Ok(())
    }

    fn load(&self, partition: StorePartition, id: &str) -> Result<Option<QueuedOperation>> {
        let path = self.operation_path(partition, id)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, partition: StorePartition, id: &str) -> Result<bool> {
        let path = self.operation_path(partition, id)?;
        Ok(remove_if_exists(&path)?)
    }

    fn list(&self, partition: StorePartition) -> Result<Vec<QueuedOperation>> {
        let dir = self.partition_dir(partition);
        let mut operations = Vec::new();

        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read(&path)
                .map_err(AppError::from)
                .and_then(|bytes| {
                    serde_json::from_slice::<QueuedOperation>(&bytes).map_err(AppError::from)
                });
            match parsed {
                Ok(operation) => operations.push(operation),
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Skipping unreadable operation");
                }
            }
        }

        operations.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(operations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;
    use tempfile::TempDir;

    fn operation(id: &str, minutes: i64) -> QueuedOperation {
        let created =
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes);
        QueuedOperation::new(id, "test_result", json!({"sn": id}), created)
    }

    #[test]
    fn test_creates_partition_dirs() {
        let tmp = TempDir::new().unwrap();
        let store = FsOperationStore::new(tmp.path().join("ops")).unwrap();
        for name in ["pending", "failed", "sent"] {
            assert!(store.root().join(name).is_dir());
        }
    }

    #[test]
    fn test_save_load_delete() {
        let tmp = TempDir::new().unwrap();
        let store = FsOperationStore::new(tmp.path()).unwrap();
        let op = operation("20240301_120000_abcd1234", 0);

        store.save(StorePartition::Pending, &op).unwrap();
        assert!(tmp.path().join("pending/20240301_120000_abcd1234.json").exists());
        assert_eq!(store.load(StorePartition::Pending, &op.id).unwrap(), Some(op.clone()));
        assert_eq!(store.load(StorePartition::Failed, &op.id).unwrap(), None);

        assert!(store.delete(StorePartition::Pending, &op.id).unwrap());
        assert!(!store.delete(StorePartition::Pending, &op.id).unwrap());
        assert_eq!(store.load(StorePartition::Pending, &op.id).unwrap(), None);
    }

    #[test]
    fn test_save_overwrites() {
        let tmp = TempDir::new().unwrap();
        let store = FsOperationStore::new(tmp.path()).unwrap();
        let mut op = operation("op1", 0);
        store.save(StorePartition::Pending, &op).unwrap();

        op.begin_attempt(Utc::now());
        store.save(StorePartition::Pending, &op).unwrap();

        let loaded = store.load(StorePartition::Pending, "op1").unwrap().unwrap();
        assert_eq!(loaded.attempts, 1);
        assert_eq!(store.count(StorePartition::Pending).unwrap(), 1);
    }

    #[test]
    fn test_list_oldest_first_skipping_corrupt() {
        let tmp = TempDir::new().unwrap();
        let store = FsOperationStore::new(tmp.path()).unwrap();
        store.save(StorePartition::Pending, &operation("late", 5)).unwrap();
        store.save(StorePartition::Pending, &operation("early", 1)).unwrap();
        fs::write(tmp.path().join("pending/broken.json"), b"{ truncated").unwrap();
        fs::write(tmp.path().join("pending/notes.txt"), b"ignored").unwrap();

        let ids: Vec<String> = store
            .list(StorePartition::Pending)
            .unwrap()
            .into_iter()
            .map(|op| op.id)
            .collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[test]
    fn test_rejects_path_like_ids() {
        let tmp = TempDir::new().unwrap();
        let store = FsOperationStore::new(tmp.path()).unwrap();
        let op = operation("../escape", 0);

        let err = store.save(StorePartition::Pending, &op).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
