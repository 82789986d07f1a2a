// Filesystem Inbox
// Directory listing and the sibling `<file>.queued` markers

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::Utc;
use relay_core::error::{AppError, Result};
use relay_core::port::{marker_path, PostProcess, SourceFile, SourceInbox, MARKER_EXTENSION};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::atomic::{remove_if_exists, write_atomic};

/// False for markers, dotfiles and temp files
pub fn is_candidate_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with('.') {
        return false;
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => ext != MARKER_EXTENSION && !ext.eq_ignore_ascii_case("tmp"),
        None => true,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FsInbox;

impl FsInbox {
    pub fn new() -> Self {
        Self
    }
}

fn move_file(from: &Path, to_dir: &Path) -> Result<()> {
    let name = from
        .file_name()
        .ok_or_else(|| AppError::Validation(format!("not a file: {}", from.display())))?;
    fs::create_dir_all(to_dir)?;
    let target = free_target(to_dir, Path::new(name));
    if target.file_name() != Some(name) {
        warn!(
            from = %from.display(),
            to = %target.display(),
            "Archive already holds this name; keeping both"
        );
    }
    match fs::rename(from, &target) {
        Ok(()) => Ok(()),
        // Rename cannot cross filesystems
        Err(_) => {
            fs::copy(from, &target)?;
            fs::remove_file(from)?;
            Ok(())
        }
    }
}

/// `to_dir/name`, or `to_dir/<stem>.<n>.<ext>` with the first free `n`
fn free_target(to_dir: &Path, name: &Path) -> PathBuf {
    let target = to_dir.join(name);
    if !target.exists() {
        return target;
    }
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = name.extension().map(|e| e.to_string_lossy().into_owned());
    (1u32..)
        .map(|n| match &ext {
            Some(ext) => to_dir.join(format!("{}.{}.{}", stem, n, ext)),
            None => to_dir.join(format!("{}.{}", stem, n)),
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or(target)
}

impl SourceInbox for FsInbox {
    fn list_files(&self, dir: &Path, recursive: bool) -> Result<Vec<SourceFile>> {
        if !dir.is_dir() {
            return Err(AppError::NotFound(format!("watch directory {}", dir.display())));
        }

        let max_depth = if recursive { usize::MAX } else { 1 };
        let mut files = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(max_depth) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !is_candidate_file(entry.path()) {
                continue;
            }
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            files.push(SourceFile {
                path: entry.into_path(),
                modified,
            });
        }
        Ok(files)
    }

    fn is_marked(&self, path: &Path) -> bool {
        marker_path(path).exists()
    }

    fn mark(&self, path: &Path) -> Result<()> {
        let stamp = Utc::now().to_rfc3339();
        write_atomic(&marker_path(path), stamp.as_bytes())?;
        debug!(path = %path.display(), "Marked as queued");
        Ok(())
    }

    fn unmark(&self, path: &Path) -> Result<()> {
        remove_if_exists(&marker_path(path))?;
        Ok(())
    }

    fn finalize(&self, path: &Path, action: &PostProcess) -> Result<()> {
        match action {
            PostProcess::Keep => return Ok(()),
            PostProcess::Delete => match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(path = %path.display(), "Source file already gone");
                }
                Err(e) => return Err(e.into()),
            },
            PostProcess::Move(dir) => move_file(path, dir)?,
        }
        self.unmark(path)?;
        debug!(path = %path.display(), action = ?action, "Source file finalized");
        Ok(())
    }
}
