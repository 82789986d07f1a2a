// Load + crash recovery: rebuild queue items from the files on disk

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use relay_core::domain::{ItemPayload, ItemStatus, QueueItem};
use relay_core::error::Result;
use tracing::{debug, warn};

use super::sidecar::{data_path, meta_path, parse_data_file_name, Sidecar};

/// One item found on disk
pub(crate) struct DiskItem {
    pub item: QueueItem,
    /// Status whose files hold this item
    pub file_status: ItemStatus,
}

/// Everything found in the queue directory
pub(crate) struct DiskScan {
    /// Newest copy per id, oldest `created_at` first
    pub items: Vec<DiskItem>,
    /// Older copies that lost to a newer status of the same id
    pub stale: Vec<(String, ItemStatus)>,
    pub skipped: usize,
}

/// A readable copy before grouping
struct Found {
    stem: String,
    status: ItemStatus,
    item: QueueItem,
    /// The copy's sidecar was present and valid
    committed: bool,
}

pub(crate) fn scan_dir(dir: &Path) -> Result<DiskScan> {
    let mut found = Vec::new();
    let mut skipped = 0;

    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Unreadable directory entry");
                continue;
            }
        };
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some((stem, status)) = parse_data_file_name(name) else {
            continue;
        };

        let Some((item, committed)) = read_item(dir, stem, status, &entry.path()) else {
            skipped += 1;
            continue;
        };
        found.push(Found {
            stem: stem.to_string(),
            status,
            item,
            committed,
        });
    }

    // A data file without its sidecar is a transition interrupted between the
    // two writes; when a committed copy exists it is the one to trust
    let committed_stems: HashSet<String> = found
        .iter()
        .filter(|f| f.committed)
        .map(|f| f.stem.clone())
        .collect();

    let mut newest: HashMap<String, DiskItem> = HashMap::new();
    let mut stale = Vec::new();
    for Found {
        stem,
        status,
        item,
        committed,
    } in found
    {
        if !committed && committed_stems.contains(&stem) {
            warn!(file_stem = %stem, status = %status, "Discarding half-written queue copy");
            stale.push((item.id, status));
            continue;
        }

        match newest.get(&item.id) {
            Some(existing) if existing.item.updated_at >= item.updated_at => {
                stale.push((item.id.clone(), status));
            }
            Some(existing) => {
                stale.push((existing.item.id.clone(), existing.file_status));
                newest.insert(item.id.clone(), DiskItem { item, file_status: status });
            }
            None => {
                newest.insert(item.id.clone(), DiskItem { item, file_status: status });
            }
        }
    }

    let mut items: Vec<DiskItem> = newest.into_values().collect();
    items.sort_by(|a, b| {
        a.item
            .created_at
            .cmp(&b.item.created_at)
            .then_with(|| a.item.id.cmp(&b.item.id))
    });

    Ok(DiskScan {
        items,
        stale,
        skipped,
    })
}

/// Read one item and whether its sidecar was intact, or None (with a warning)
/// if its payload is unusable
fn read_item(
    dir: &Path,
    stem: &str,
    status: ItemStatus,
    data_file: &Path,
) -> Option<(QueueItem, bool)> {
    let sidecar = read_sidecar(&meta_path(dir, stem, status));
    let committed = sidecar.is_some();
    let sidecar = sidecar.unwrap_or_else(Sidecar::fallback);

    let bytes = match fs::read(data_file) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(file = %data_file.display(), error = %e, "Skipping unreadable queue item");
            return None;
        }
    };
    let data = match ItemPayload::decode(sidecar.payload_kind, &bytes) {
        Ok(data) => data,
        Err(e) => {
            warn!(file = %data_file.display(), error = %e, "Skipping corrupt queue item");
            return None;
        }
    };

    let file_time = file_mtime(data_file).unwrap_or_else(Utc::now);
    let created_at = sidecar.created_at.unwrap_or(file_time);
    let id = sidecar.id.clone().unwrap_or_else(|| stem.to_string());

    let mut item = QueueItem::new(id, data, sidecar.clamped_priority(), sidecar.max_attempts);
    // The file name decides the status: it is the last thing committed
    item.status = status;
    item.attempts = sidecar.attempts;
    item.created_at = created_at;
    item.updated_at = sidecar.updated_at.unwrap_or(created_at);
    item.last_error = sidecar.last_error;
    item.metadata = sidecar.metadata;
    Some((item, committed))
}

fn read_sidecar(path: &Path) -> Option<Sidecar> {
    match fs::read(path) {
        Ok(bytes) => match serde_json::from_slice::<Sidecar>(&bytes) {
            Ok(sidecar) => Some(sidecar),
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Malformed metadata, using defaults");
                None
            }
        },
        Err(e) => {
            warn!(file = %path.display(), error = %e, "Missing metadata, using defaults");
            None
        }
    }
}

fn file_mtime(path: &Path) -> Option<DateTime<Utc>> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}

/// Both files of one item copy
pub(crate) fn item_files(dir: &Path, id: &str, status: ItemStatus) -> [PathBuf; 2] {
    [data_path(dir, id, status), meta_path(dir, id, status)]
}

pub(crate) fn log_stale(id: &str, status: ItemStatus) {
    debug!(item_id = %id, status = %status, "Removing superseded queue files");
}
