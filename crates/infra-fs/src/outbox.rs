// Outbox delivery client
// Drops each record as `<remote_id>.json` for the uplink agent to collect

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use relay_core::domain::{CanonicalRecord, RemoteId};
use relay_core::port::{DeliveryClient, DeliveryError};
use tracing::debug;
use uuid::Uuid;

use crate::atomic::write_atomic;

pub struct OutboxDeliveryClient {
    dir: PathBuf,
}

impl OutboxDeliveryClient {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn is_empty_record(record: &CanonicalRecord) -> bool {
    match record.as_value() {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[async_trait]
impl DeliveryClient for OutboxDeliveryClient {
    async fn send(&self, record: &CanonicalRecord) -> Result<RemoteId, DeliveryError> {
        if is_empty_record(record) {
            return Err(DeliveryError::Validation("record is empty".to_string()));
        }

        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| DeliveryError::Validation(format!("record not serializable: {}", e)))?;
        let remote_id = Uuid::new_v4().to_string();
        let path = self.dir.join(format!("{}.json", remote_id));

        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| DeliveryError::Transient(format!("outbox writer stopped: {}", e)))?
            .map_err(|e| DeliveryError::Transient(format!("outbox write failed: {}", e)))?;

        debug!(remote_id = %remote_id, "Record written to outbox");
        Ok(remote_id)
    }
}
