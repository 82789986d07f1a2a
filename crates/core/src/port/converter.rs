// Converter Port
// Turns one source file into a canonical record

use crate::domain::CanonicalRecord;
use std::path::Path;
use thiserror::Error;

/// Result of converting one source file
#[derive(Debug, Clone, PartialEq)]
pub enum ConversionOutcome {
    /// Record ready for delivery
    Success(CanonicalRecord),
    /// File is not ready yet (e.g. still being written); kept for a later pass
    Suspended(String),
    /// File can never be converted; not retried
    Failed(String),
}

/// Unexpected conversion errors (retried under the item's attempt budget)
#[derive(Error, Debug, Clone)]
pub enum ConvertError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Converter panicked: {0}")]
    Panicked(String),

    #[error("No converter registered under '{0}'")]
    UnknownConverter(String),
}

impl From<std::io::Error> for ConvertError {
    fn from(err: std::io::Error) -> Self {
        ConvertError::Io(err.to_string())
    }
}

/// File-to-record converter.
///
/// Implementations are invoked concurrently from several workers and must be
/// safe to share. `convert` runs on the blocking thread pool.
pub trait Converter: Send + Sync {
    /// Unique converter name (stored in queued tasks)
    fn name(&self) -> &str;

    /// True if this converter handles `path`; non-matching files are ignored
    fn matches(&self, path: &Path) -> bool;

    fn convert(&self, path: &Path) -> Result<ConversionOutcome, ConvertError>;
}

/// Case-insensitive extension check (extensions given without the dot)
pub fn matches_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    /// Mock converter behavior
    #[derive(Debug, Clone)]
    pub enum MockBehavior {
        /// Record `{"source": <file name>}`
        Success,
        Suspend(String),
        Fail(String),
        Error(String),
        Panic(String),
    }

    /// Mock Converter for testing
    pub struct MockConverter {
        name: String,
        extensions: Vec<String>,
        behavior: Arc<Mutex<MockBehavior>>,
        calls: Arc<Mutex<Vec<PathBuf>>>,
    }

    impl MockConverter {
        pub fn new(name: impl Into<String>, extensions: &[&str], behavior: MockBehavior) -> Self {
            Self {
                name: name.into(),
                extensions: extensions.iter().map(|e| e.to_string()).collect(),
                behavior: Arc::new(Mutex::new(behavior)),
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn new_success(name: impl Into<String>, extensions: &[&str]) -> Self {
            Self::new(name, extensions, MockBehavior::Success)
        }

        pub fn set_behavior(&self, behavior: MockBehavior) {
            *self.behavior.lock().unwrap() = behavior;
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        pub fn calls(&self) -> Vec<PathBuf> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Converter for MockConverter {
        fn name(&self) -> &str {
            &self.name
        }

        fn matches(&self, path: &Path) -> bool {
            let exts: Vec<&str> = self.extensions.iter().map(String::as_str).collect();
            matches_extension(path, &exts)
        }

        fn convert(&self, path: &Path) -> Result<ConversionOutcome, ConvertError> {
            self.calls.lock().unwrap().push(path.to_path_buf());
            let behavior = self.behavior.lock().unwrap().clone();

            match behavior {
                MockBehavior::Success => {
                    let source = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    Ok(ConversionOutcome::Success(CanonicalRecord::new(
                        serde_json::json!({ "source": source }),
                    )))
                }
                MockBehavior::Suspend(reason) => Ok(ConversionOutcome::Suspended(reason)),
                MockBehavior::Fail(reason) => Ok(ConversionOutcome::Failed(reason)),
                MockBehavior::Error(msg) => Err(ConvertError::Parse(msg)),
                MockBehavior::Panic(msg) => {
                    panic!("{}", msg); // Actually panic for panic isolation testing
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_extension_ignores_case() {
        assert!(matches_extension(Path::new("/in/run_01.CSV"), &["csv"]));
        assert!(!matches_extension(Path::new("/in/run_01.csv.queued"), &["csv"]));
        assert!(!matches_extension(Path::new("/in/README"), &["csv"]));
    }
}
