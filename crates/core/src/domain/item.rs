// Queue Item Domain Model

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::error::{DomainError, Result};

/// Item ID (UUID v4 unless supplied by the caller)
pub type ItemId = String;

/// Priority (1 = highest, 10 = lowest)
pub type Priority = u8;

pub const HIGHEST_PRIORITY: Priority = 1;
pub const LOWEST_PRIORITY: Priority = 10;
pub const DEFAULT_PRIORITY: Priority = 5;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Clamp any requested priority into the supported 1..=10 band.
pub fn clamp_priority(priority: i64) -> Priority {
    priority.clamp(HIGHEST_PRIORITY as i64, LOWEST_PRIORITY as i64) as Priority
}

/// Opaque caller metadata
pub type Metadata = BTreeMap<String, String>;

/// Item Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Suspended,
}

impl ItemStatus {
    pub const ALL: [ItemStatus; 5] = [
        ItemStatus::Pending,
        ItemStatus::Processing,
        ItemStatus::Completed,
        ItemStatus::Failed,
        ItemStatus::Suspended,
    ];

    /// Lowercase name, also used in on-disk file names
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Processing => "processing",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
            ItemStatus::Suspended => "suspended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialization tag for an item payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    #[default]
    Json,
    Text,
    Bytes,
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadKind::Json => write!(f, "json"),
            PayloadKind::Text => write!(f, "text"),
            PayloadKind::Bytes => write!(f, "bytes"),
        }
    }
}

/// Item payload.
///
/// The variant decides how the payload is encoded on disk. The tag is stored
/// alongside the bytes so decoding never has to guess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ItemPayload {
    Json(serde_json::Value),
    Text(String),
    Bytes(Vec<u8>),
}

impl ItemPayload {
    /// Build a JSON payload from any serializable value
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        serde_json::to_value(value)
            .map(ItemPayload::Json)
            .map_err(|e| DomainError::ValidationError(format!("payload not serializable: {}", e)))
    }

    pub fn kind(&self) -> PayloadKind {
        match self {
            ItemPayload::Json(_) => PayloadKind::Json,
            ItemPayload::Text(_) => PayloadKind::Text,
            ItemPayload::Bytes(_) => PayloadKind::Bytes,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            ItemPayload::Json(value) => {
                serde_json::to_vec(value).map_err(|e| DomainError::PayloadDecode {
                    kind: PayloadKind::Json.to_string(),
                    reason: e.to_string(),
                })
            }
            ItemPayload::Text(text) => Ok(text.as_bytes().to_vec()),
            ItemPayload::Bytes(bytes) => Ok(bytes.clone()),
        }
    }

    pub fn decode(kind: PayloadKind, bytes: &[u8]) -> Result<Self> {
        let decode_err = |reason: String| DomainError::PayloadDecode {
            kind: kind.to_string(),
            reason,
        };
        match kind {
            PayloadKind::Json => serde_json::from_slice(bytes)
                .map(ItemPayload::Json)
                .map_err(|e| decode_err(e.to_string())),
            PayloadKind::Text => String::from_utf8(bytes.to_vec())
                .map(ItemPayload::Text)
                .map_err(|e| decode_err(e.to_string())),
            PayloadKind::Bytes => Ok(ItemPayload::Bytes(bytes.to_vec())),
        }
    }

    /// Deserialize a JSON payload into a typed value
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            ItemPayload::Json(value) => serde_json::from_value(value.clone())
                .map_err(|e| DomainError::ValidationError(format!("unexpected payload: {}", e))),
            other => Err(DomainError::ValidationError(format!(
                "expected json payload, found {}",
                other.kind()
            ))),
        }
    }
}

/// Request to add an item to a queue
#[derive(Debug, Clone)]
pub struct NewItem {
    pub data: ItemPayload,
    pub priority: Priority,
    pub id: Option<ItemId>,
    pub max_attempts: Option<u32>,
    pub metadata: Metadata,
}

impl NewItem {
    pub fn new(data: ItemPayload) -> Self {
        Self {
            data,
            priority: DEFAULT_PRIORITY,
            id: None,
            max_attempts: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = clamp_priority(priority);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Queue Item Entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: ItemId,
    pub data: ItemPayload,
    pub status: ItemStatus,
    pub priority: Priority,

    pub attempts: u32,
    pub max_attempts: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub last_error: Option<String>,
    pub metadata: Metadata,
}

impl QueueItem {
    /// Create a pending item
    ///
    /// # Arguments
    ///
    /// * `id` - Unique item ID (injected, not generated)
    /// * `data` - Item payload
    /// * `priority` - 1 (highest) to 10 (lowest)
    /// * `max_attempts` - Processing attempts before the item fails
    pub fn new(
        id: impl Into<String>,
        data: ItemPayload,
        priority: Priority,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            data,
            status: ItemStatus::Pending,
            priority: clamp_priority(priority as i64),
            attempts: 0,
            max_attempts,
            created_at: now,
            updated_at: now,
            last_error: None,
            metadata: Metadata::new(),
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Transition to Processing; counts one attempt
    pub fn mark_processing(&mut self) -> Result<()> {
        if self.status != ItemStatus::Pending {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.to_string(),
                to: ItemStatus::Processing.to_string(),
            });
        }
        self.status = ItemStatus::Processing;
        self.attempts += 1;
        self.touch();
        Ok(())
    }

    pub fn mark_completed(&mut self) {
        self.status = ItemStatus::Completed;
        self.last_error = None;
        self.touch();
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = ItemStatus::Failed;
        self.last_error = Some(reason.into());
        self.touch();
    }

    pub fn mark_suspended(&mut self, reason: Option<String>) {
        self.status = ItemStatus::Suspended;
        if reason.is_some() {
            self.last_error = reason;
        }
        self.touch();
    }

    pub fn reset_to_pending(&mut self) {
        self.status = ItemStatus::Pending;
        self.touch();
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn is_pending(&self) -> bool {
        self.status == ItemStatus::Pending
    }

    pub fn is_processing(&self) -> bool {
        self.status == ItemStatus::Processing
    }

    pub fn is_completed(&self) -> bool {
        self.status == ItemStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status == ItemStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item() -> QueueItem {
        QueueItem::new("ITEM-1", ItemPayload::Json(json!({"sn": "A1"})), DEFAULT_PRIORITY, 3)
    }

    #[test]
    fn test_new_item_defaults() {
        let item = item();
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.attempts, 0);
        assert_eq!(item.priority, 5);
        assert!(item.last_error.is_none());
    }

    #[test]
    fn test_mark_processing_counts_attempt() {
        let mut item = item();
        item.mark_processing().unwrap();
        assert_eq!(item.status, ItemStatus::Processing);
        assert_eq!(item.attempts, 1);
    }

    #[test]
    fn test_mark_processing_rejects_non_pending() {
        let mut item = item();
        item.mark_completed();
        let err = item.mark_processing().unwrap_err();
        assert!(err.to_string().contains("completed -> processing"));
    }

    #[test]
    fn test_completed_clears_error() {
        let mut item = item();
        item.mark_failed("Connection error");
        assert_eq!(item.last_error.as_deref(), Some("Connection error"));
        item.mark_completed();
        assert!(item.last_error.is_none());
    }

    #[test]
    fn test_suspend_without_reason_keeps_previous_error() {
        let mut item = item();
        item.last_error = Some("earlier".to_string());
        item.mark_suspended(None);
        assert_eq!(item.status, ItemStatus::Suspended);
        assert_eq!(item.last_error.as_deref(), Some("earlier"));
    }

    #[test]
    fn test_can_retry() {
        let mut item = item();
        assert!(item.can_retry());
        item.attempts = 3;
        assert!(!item.can_retry());
    }

    #[test]
    fn test_priority_is_clamped() {
        assert_eq!(clamp_priority(0), 1);
        assert_eq!(clamp_priority(-4), 1);
        assert_eq!(clamp_priority(42), 10);
        assert_eq!(NewItem::new(ItemPayload::Text("x".into())).with_priority(11).priority, 10);
    }

    #[test]
    fn test_payload_kind_selects_encoding() {
        let text = ItemPayload::Text("héllo".to_string());
        let bytes = text.encode().unwrap();
        assert_eq!(ItemPayload::decode(PayloadKind::Text, &bytes).unwrap(), text);

        let raw = ItemPayload::decode(PayloadKind::Bytes, &[0xff, 0x00]).unwrap();
        assert_eq!(raw, ItemPayload::Bytes(vec![0xff, 0x00]));

        let err = ItemPayload::decode(PayloadKind::Json, b"{ not json }").unwrap_err();
        assert!(matches!(err, DomainError::PayloadDecode { .. }));
    }

    #[test]
    fn test_status_round_trips_through_name() {
        for status in ItemStatus::ALL {
            assert_eq!(ItemStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ItemStatus::parse("bogus"), None);
    }
}
