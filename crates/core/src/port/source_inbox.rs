// Source Inbox Port
// Watched directories and the durable "already queued" markers next to source files

use crate::error::Result;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Marker suffix: `<file>.queued`
pub const MARKER_EXTENSION: &str = "queued";

/// Sibling marker path for a source file
pub fn marker_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(MARKER_EXTENSION);
    PathBuf::from(name)
}

/// A file found in a watched directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// What happens to a source file once its record is delivered
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PostProcess {
    /// Leave file and marker in place
    #[default]
    Keep,
    /// Delete file and marker
    Delete,
    /// Move the file into this directory and drop the marker
    Move(PathBuf),
}

/// Source inbox interface
pub trait SourceInbox: Send + Sync {
    /// Regular files in `dir` (markers, dotfiles and temp files excluded)
    fn list_files(&self, dir: &Path, recursive: bool) -> Result<Vec<SourceFile>>;

    fn is_marked(&self, path: &Path) -> bool;

    fn mark(&self, path: &Path) -> Result<()>;

    fn unmark(&self, path: &Path) -> Result<()>;

    /// Apply the post-processing action after successful delivery
    fn finalize(&self, path: &Path, action: &PostProcess) -> Result<()>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    /// In-memory inbox
    #[derive(Default)]
    pub struct InMemoryInbox {
        files: Mutex<Vec<SourceFile>>,
        markers: Mutex<HashSet<PathBuf>>,
        finalized: Mutex<Vec<(PathBuf, PostProcess)>>,
    }

    impl InMemoryInbox {
        pub fn new() -> Self {
            Self::default()
        }

        /// Add a file whose mtime is `age_secs` seconds after the epoch
        pub fn add_file(&self, path: impl Into<PathBuf>, age_secs: u64) {
            self.files.lock().unwrap().push(SourceFile {
                path: path.into(),
                modified: SystemTime::UNIX_EPOCH + Duration::from_secs(age_secs),
            });
        }

        pub fn finalized(&self) -> Vec<(PathBuf, PostProcess)> {
            self.finalized.lock().unwrap().clone()
        }
    }

    impl SourceInbox for InMemoryInbox {
        fn list_files(&self, dir: &Path, _recursive: bool) -> Result<Vec<SourceFile>> {
            Ok(self
                .files
                .lock()
                .unwrap()
                .iter()
                .filter(|f| f.path.starts_with(dir))
                .cloned()
                .collect())
        }

        fn is_marked(&self, path: &Path) -> bool {
            self.markers.lock().unwrap().contains(path)
        }

        fn mark(&self, path: &Path) -> Result<()> {
            self.markers.lock().unwrap().insert(path.to_path_buf());
            Ok(())
        }

        fn unmark(&self, path: &Path) -> Result<()> {
            self.markers.lock().unwrap().remove(path);
            Ok(())
        }

        fn finalize(&self, path: &Path, action: &PostProcess) -> Result<()> {
            if *action != PostProcess::Keep {
                self.markers.lock().unwrap().remove(path);
                self.files.lock().unwrap().retain(|f| f.path != path);
            }
            self.finalized
                .lock()
                .unwrap()
                .push((path.to_path_buf(), action.clone()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_path_appends_suffix() {
        assert_eq!(
            marker_path(Path::new("/watch/run_01.csv")),
            PathBuf::from("/watch/run_01.csv.queued")
        );
    }
}
