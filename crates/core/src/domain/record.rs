// Canonical Record (opaque to the relay)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Converter output handed to the delivery client unchanged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalRecord(serde_json::Value);

impl CanonicalRecord {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

/// Remote identifier returned by the collector
pub type RemoteId = String;

/// Work item payload enqueued by the converter pool for one source file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionTask {
    pub source_path: PathBuf,
    pub converter: String,
}
