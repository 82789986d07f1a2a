// Startup reconciliation - queue files that arrived while the relay was down

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::{ConverterBinding, PoolShared};
use crate::error::Result;
use crate::port::SourceFile;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    /// Files matched by a binding (after the cap)
    pub scanned: usize,
    pub queued: usize,
    /// Already carried a queued marker or was claimed by a file event
    pub skipped: usize,
    pub errors: usize,
}

pub(super) async fn scan_existing_files(shared: &Arc<PoolShared>) -> Result<ScanStats> {
    let mut stats = ScanStats::default();

    if !shared.config.enable_startup_scan {
        info!("Startup scan disabled");
        shared.startup_state().complete = true;
        return Ok(stats);
    }

    let mut seen = HashSet::new();
    let mut candidates: Vec<(SourceFile, &ConverterBinding)> = Vec::new();
    for binding in &shared.bindings {
        match shared.inbox.list_files(&binding.watch_dir, binding.recursive) {
            Ok(files) => {
                for file in files {
                    if binding.matches(&file.path) && seen.insert(file.path.clone()) {
                        candidates.push((file, binding));
                    }
                }
            }
            Err(e) => {
                stats.errors += 1;
                warn!(
                    dir = %binding.watch_dir.display(),
                    converter = %binding.name(),
                    error = %e,
                    "Startup scan could not list directory"
                );
            }
        }
    }

    // Oldest first: arrival order survives the restart
    candidates.sort_by(|(a, _), (b, _)| {
        a.modified
            .cmp(&b.modified)
            .then_with(|| a.path.cmp(&b.path))
    });

    let cap = shared.config.startup_scan_max_files;
    if cap > 0 && candidates.len() > cap {
        warn!(
            found = candidates.len(),
            cap, "Startup scan capped, remaining files wait for the next scan"
        );
        candidates.truncate(cap);
    }

    let total = candidates.len();
    stats.scanned = total;
    for (done, (file, binding)) in candidates.into_iter().enumerate() {
        if shared.inbox.is_marked(&file.path) || !shared.claim_startup_path(&file.path) {
            debug!(path = %file.path.display(), "Already queued, skipping");
            stats.skipped += 1;
        } else {
            match shared.submit(&file.path, binding) {
                Ok(_) => stats.queued += 1,
                Err(e) => {
                    shared.release_startup_path(&file.path);
                    stats.errors += 1;
                    warn!(
                        path = %file.path.display(),
                        error = %e,
                        "Startup scan could not queue file"
                    );
                }
            }
        }
        if let Some(progress) = &shared.config.on_progress {
            progress(done + 1, total);
        }
    }

    schedule_dedup_reset(shared);

    info!(
        scanned = stats.scanned,
        queued = stats.queued,
        skipped = stats.skipped,
        errors = stats.errors,
        "Startup scan complete"
    );
    Ok(stats)
}

/// Close the dedup window once `dedup_ttl` has passed
fn schedule_dedup_reset(shared: &Arc<PoolShared>) {
    let ttl = shared.config.dedup_ttl;
    let timer_shared = Arc::clone(shared);

    let mut startup = shared.startup_state();
    if let Some(previous) = startup.reset_task.take() {
        previous.abort();
    }
    let handle = tokio::spawn(async move {
        tokio::time::sleep(ttl).await;
        let mut startup = timer_shared.startup_state();
        let cleared = startup.files.len();
        startup.files.clear();
        startup.complete = true;
        startup.reset_task = None;
        debug!(cleared, "Startup dedup window closed");
    });
    startup.reset_task = Some(handle.abort_handle());
}
