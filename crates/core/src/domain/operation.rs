// Queued Operation Domain Model (delivery variant)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operation ID (`<YYYYmmdd_HHMMSS>_<8 hex>`)
pub type OperationId = String;

/// Operation Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Sending,
    Sent,
    Failed,
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationStatus::Pending => write!(f, "pending"),
            OperationStatus::Sending => write!(f, "sending"),
            OperationStatus::Sent => write!(f, "sent"),
            OperationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A UI/agent operation that must reach the collector or stay on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: OperationId,
    pub operation_type: String,
    pub payload: serde_json::Value,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    pub status: OperationStatus,
}

impl QueuedOperation {
    pub fn new(
        id: impl Into<String>,
        operation_type: impl Into<String>,
        payload: serde_json::Value,
        created: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            operation_type: operation_type.into(),
            payload,
            created,
            attempts: 0,
            last_attempt: None,
            error: None,
            status: OperationStatus::Pending,
        }
    }

    /// Start a send attempt
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) {
        self.status = OperationStatus::Sending;
        self.attempts += 1;
        self.last_attempt = Some(now);
    }

    /// Record a failed attempt; the operation goes back to pending
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.status = OperationStatus::Pending;
        self.error = Some(error.into());
    }
}
