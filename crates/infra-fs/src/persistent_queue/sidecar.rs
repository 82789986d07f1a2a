// On-disk layout: `<id>.<status>.data` + `<id>.<status>.meta.json`

use chrono::{DateTime, Utc};
use relay_core::domain::{
    clamp_priority, ItemStatus, Metadata, PayloadKind, QueueItem, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_PRIORITY,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub(crate) const DATA_SUFFIX: &str = ".data";
pub(crate) const META_SUFFIX: &str = ".meta.json";

/// File-name-safe form of an item id (anything outside `[A-Za-z0-9_-]` becomes `_`)
pub(crate) fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub(crate) fn data_path(dir: &Path, id: &str, status: ItemStatus) -> PathBuf {
    dir.join(format!("{}.{}{}", sanitize_id(id), status.as_str(), DATA_SUFFIX))
}

pub(crate) fn meta_path(dir: &Path, id: &str, status: ItemStatus) -> PathBuf {
    dir.join(format!("{}.{}{}", sanitize_id(id), status.as_str(), META_SUFFIX))
}

/// Split `<stem>.<status>.data` into (stem, status)
pub(crate) fn parse_data_file_name(name: &str) -> Option<(&str, ItemStatus)> {
    let base = name.strip_suffix(DATA_SUFFIX)?;
    let (stem, status) = base.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    Some((stem, ItemStatus::parse(status)?))
}

fn default_priority() -> i64 {
    DEFAULT_PRIORITY as i64
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

/// Item metadata sidecar. Every field is optional on read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Sidecar {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<ItemStatus>,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub payload_kind: PayloadKind,
}

impl Sidecar {
    pub fn from_item(item: &QueueItem) -> Self {
        Self {
            id: Some(item.id.clone()),
            status: Some(item.status),
            priority: item.priority as i64,
            attempts: item.attempts,
            max_attempts: item.max_attempts,
            created_at: Some(item.created_at),
            updated_at: Some(item.updated_at),
            last_error: item.last_error.clone(),
            metadata: item.metadata.clone(),
            payload_kind: item.data.kind(),
        }
    }

    /// Sidecar used when the real one is missing or unreadable
    pub fn fallback() -> Self {
        Self {
            priority: default_priority(),
            max_attempts: default_max_attempts(),
            ..Default::default()
        }
    }

    pub fn clamped_priority(&self) -> u8 {
        clamp_priority(self.priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize_id("CUSTOM-001"), "CUSTOM-001");
        assert_eq!(sanitize_id("run/01:a.b c"), "run_01_a_b_c");
    }

    #[test]
    fn test_file_names_use_lowercase_status() {
        let dir = Path::new("/q");
        assert_eq!(
            data_path(dir, "abc", ItemStatus::Processing),
            PathBuf::from("/q/abc.processing.data")
        );
        assert_eq!(
            meta_path(dir, "abc", ItemStatus::Pending),
            PathBuf::from("/q/abc.pending.meta.json")
        );
    }

    #[test]
    fn test_parse_data_file_name() {
        assert_eq!(
            parse_data_file_name("abc-1.completed.data"),
            Some(("abc-1", ItemStatus::Completed))
        );
        assert_eq!(parse_data_file_name("abc.unknown.data"), None);
        assert_eq!(parse_data_file_name("abc.pending.meta.json"), None);
        assert_eq!(parse_data_file_name(".pending.data"), None);
    }

    #[test]
    fn test_missing_priority_defaults_to_five() {
        let sidecar: Sidecar = serde_json::from_str(r#"{"id": "X", "attempts": 1}"#).unwrap();
        assert_eq!(sidecar.priority, 5);
        assert_eq!(sidecar.max_attempts, 3);
        assert_eq!(sidecar.payload_kind, PayloadKind::Json);
        assert!(sidecar.metadata.is_empty());
    }
}
